//! Length-prefixed framing for pool IPC.
//!
//! Every frame is a 4-byte big-endian payload length followed by a JSON
//! payload. [`FrameParser`] is resumable: bytes can arrive in arbitrary
//! chunks and a half-read frame stays buffered until the rest shows up.

use serde::Serialize;
use serde::de::DeserializeOwned;
use thiserror::Error;

/// Size of the length header in bytes.
pub const HEADER_LEN: usize = 4;

/// Largest payload accepted from a peer (64 MiB).
pub const MAX_FRAME_LEN: usize = 64 * 1024 * 1024;

/// Errors attributed to a single frame.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
    #[error("frame of {len} bytes exceeds limit of {max} bytes")]
    TooLarge { len: usize, max: usize },

    #[error("undecodable payload: {0}")]
    Decode(String),
}

/// Serialize a message into a complete frame (header + payload).
pub fn encode<T: Serialize>(msg: &T) -> Result<Vec<u8>, serde_json::Error> {
    let payload = serde_json::to_vec(msg)?;
    let mut frame = Vec::with_capacity(HEADER_LEN + payload.len());
    frame.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    frame.extend_from_slice(&payload);
    Ok(frame)
}

/// Decode a frame payload.
pub fn decode<T: DeserializeOwned>(payload: &[u8]) -> Result<T, FrameError> {
    serde_json::from_slice(payload).map_err(|e| FrameError::Decode(e.to_string()))
}

/// Where the parser is within the current frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseState {
    /// No bytes of the next frame seen yet.
    Idle,
    /// Some of the length header is buffered.
    Header,
    /// Header read, waiting for `len` payload bytes.
    Body { len: usize },
    /// Discarding the payload of an oversized frame.
    Skip { remaining: usize },
}

/// Resumable decoder for a byte stream of frames.
#[derive(Debug)]
pub struct FrameParser {
    buf: Vec<u8>,
    state: ParseState,
}

impl Default for FrameParser {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameParser {
    pub fn new() -> Self {
        Self {
            buf: Vec::new(),
            state: ParseState::Idle,
        }
    }

    /// Append bytes read from the channel.
    pub fn feed(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
        if self.state == ParseState::Idle && !self.buf.is_empty() {
            self.state = ParseState::Header;
        }
    }

    pub fn state(&self) -> ParseState {
        self.state
    }

    /// True when a frame has been started but not completed.
    pub fn in_progress(&self) -> bool {
        self.state != ParseState::Idle
    }

    /// Number of buffered, not yet consumed bytes.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Pull the next complete payload out of the buffer.
    ///
    /// Returns `None` when more bytes are needed. An oversized header yields
    /// one `Err` and the parser then skips that payload.
    pub fn next_payload(&mut self) -> Option<Result<Vec<u8>, FrameError>> {
        loop {
            match self.state {
                ParseState::Idle | ParseState::Header => {
                    if self.buf.len() < HEADER_LEN {
                        self.state = if self.buf.is_empty() {
                            ParseState::Idle
                        } else {
                            ParseState::Header
                        };
                        return None;
                    }
                    let mut header = [0u8; HEADER_LEN];
                    header.copy_from_slice(&self.buf[..HEADER_LEN]);
                    self.buf.drain(..HEADER_LEN);
                    let len = u32::from_be_bytes(header) as usize;
                    if len > MAX_FRAME_LEN {
                        self.state = ParseState::Skip { remaining: len };
                        return Some(Err(FrameError::TooLarge {
                            len,
                            max: MAX_FRAME_LEN,
                        }));
                    }
                    self.state = ParseState::Body { len };
                }
                ParseState::Body { len } => {
                    if self.buf.len() < len {
                        return None;
                    }
                    let payload: Vec<u8> = self.buf.drain(..len).collect();
                    self.state = if self.buf.is_empty() {
                        ParseState::Idle
                    } else {
                        ParseState::Header
                    };
                    return Some(Ok(payload));
                }
                ParseState::Skip { remaining } => {
                    let n = remaining.min(self.buf.len());
                    self.buf.drain(..n);
                    if n < remaining {
                        self.state = ParseState::Skip {
                            remaining: remaining - n,
                        };
                        return None;
                    }
                    self.state = ParseState::Idle;
                }
            }
        }
    }

    /// Pull and decode the next complete frame.
    pub fn next_frame<T: DeserializeOwned>(&mut self) -> Option<Result<T, FrameError>> {
        self.next_payload()
            .map(|payload| payload.and_then(|bytes| decode(&bytes)))
    }
}
