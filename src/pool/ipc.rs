//! Pipe primitives for worker communication.
//!
//! Provides framed I/O over pipes with EINTR handling.

use super::frame::{self, FrameError, FrameParser};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::io::{self, Read, Write};
use std::os::unix::io::{AsFd, AsRawFd, BorrowedFd, IntoRawFd, OwnedFd, RawFd};

/// Read size for a single channel read (64KB).
pub const READ_CHUNK: usize = 64 * 1024;

/// A file descriptor wrapper that implements Read/Write with EINTR handling.
#[derive(Debug)]
pub struct PipeFd {
    fd: OwnedFd,
}

impl PipeFd {
    /// Create from an owned file descriptor.
    pub fn new(fd: OwnedFd) -> Self {
        Self { fd }
    }
}

impl AsFd for PipeFd {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}

impl AsRawFd for PipeFd {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

impl IntoRawFd for PipeFd {
    fn into_raw_fd(self) -> RawFd {
        self.fd.into_raw_fd()
    }
}

impl Read for PipeFd {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            match nix::unistd::read(&self.fd, buf) {
                Ok(n) => return Ok(n),
                Err(nix::errno::Errno::EINTR) => continue,
                Err(e) => return Err(io::Error::from_raw_os_error(e as i32)),
            }
        }
    }
}

impl Write for PipeFd {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        loop {
            match nix::unistd::write(&self.fd, buf) {
                Ok(n) => return Ok(n),
                Err(nix::errno::Errno::EINTR) => continue,
                Err(e) => return Err(io::Error::from_raw_os_error(e as i32)),
            }
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(()) // Pipes don't need flushing at the fd level
    }
}

/// Create a pipe, returning `(read_end, write_end)`.
pub fn pipe() -> io::Result<(PipeFd, PipeFd)> {
    let (read_fd, write_fd) =
        nix::unistd::pipe().map_err(|e| io::Error::from_raw_os_error(e as i32))?;
    Ok((PipeFd::new(read_fd), PipeFd::new(write_fd)))
}

/// Writes whole frames to a pipe.
#[derive(Debug)]
pub struct FrameWriter {
    fd: PipeFd,
}

impl FrameWriter {
    pub fn new(fd: PipeFd) -> Self {
        Self { fd }
    }

    /// Encode and write one frame. Blocks only on pipe backpressure.
    pub fn send<T: Serialize>(&mut self, msg: &T) -> io::Result<()> {
        let bytes = frame::encode(msg)?;
        self.fd.write_all(&bytes)
    }
}

impl AsRawFd for FrameWriter {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

/// Blocking frame reader, used on the worker side and by the blocking pool.
#[derive(Debug)]
pub struct FrameReader {
    fd: PipeFd,
    parser: FrameParser,
    chunk: Box<[u8]>,
}

impl FrameReader {
    pub fn new(fd: PipeFd) -> Self {
        Self {
            fd,
            parser: FrameParser::new(),
            chunk: vec![0u8; READ_CHUNK].into_boxed_slice(),
        }
    }

    /// Read until one full frame is available.
    ///
    /// Returns `None` on EOF. A truncated frame at EOF is reported as
    /// `UnexpectedEof`.
    pub fn recv<T: DeserializeOwned>(&mut self) -> io::Result<Option<Result<T, FrameError>>> {
        loop {
            if let Some(frame) = self.parser.next_frame() {
                return Ok(Some(frame));
            }
            let n = self.fd.read(&mut self.chunk)?;
            if n == 0 {
                if self.parser.in_progress() {
                    return Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "channel closed mid-frame",
                    ));
                }
                return Ok(None);
            }
            self.parser.feed(&self.chunk[..n]);
        }
    }
}

impl AsRawFd for FrameReader {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}
