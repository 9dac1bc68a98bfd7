//! Logging setup for the pool process and its workers.
//!
//! # Environment Variables
//!
//! - `PREFORK_LOG` - Log filter (overrides RUST_LOG)
//! - `PREFORK_LOG_LEVEL` - Log level: error, warn, info, debug, trace
//! - `PREFORK_LOG_FORMAT` - Output format: pretty, compact, json
//! - `PREFORK_LOG_FILE` - Path to log file (in addition to stderr). `%I`
//!   expands to the worker index inside worker processes.
//! - `PREFORK_LOG_ROTATION` - File rotation: hourly, daily, never
//! - `RUST_LOG` - Standard Rust log filter (fallback)
//!
//! # Example
//!
//! ```no_run
//! use prefork::logging::{LogConfig, init};
//!
//! init(LogConfig::default().with_env_overrides());
//! ```

use std::path::{Path, PathBuf};
use std::str::FromStr;

use tracing::Level;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{
    EnvFilter, Layer, Registry,
    fmt::{self, MakeWriter, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
};

/// Placeholder replaced by the worker index in log file names.
pub const WORKER_INDEX_PLACEHOLDER: &str = "%I";

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    /// Multi-line, human-readable
    #[default]
    Pretty,
    /// One line per event
    Compact,
    /// One JSON object per event
    Json,
}

const FORMAT_NAMES: &[(&str, LogFormat)] = &[
    ("pretty", LogFormat::Pretty),
    ("full", LogFormat::Pretty),
    ("compact", LogFormat::Compact),
    ("json", LogFormat::Json),
];

const ROTATION_NAMES: &[(&str, Rotation)] = &[
    ("hourly", Rotation::HOURLY),
    ("daily", Rotation::DAILY),
    ("never", Rotation::NEVER),
];

const LEVEL_NAMES: &[(&str, Level)] = &[
    ("error", Level::ERROR),
    ("warn", Level::WARN),
    ("warning", Level::WARN),
    ("info", Level::INFO),
    ("debug", Level::DEBUG),
    ("trace", Level::TRACE),
];

fn lookup<T: Clone>(table: &[(&str, T)], name: &str) -> Option<T> {
    let name = name.trim().to_ascii_lowercase();
    table
        .iter()
        .find(|(candidate, _)| *candidate == name)
        .map(|(_, value)| value.clone())
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        lookup(FORMAT_NAMES, s)
            .ok_or_else(|| format!("Unknown log format '{}' (pretty, compact, json)", s))
    }
}

/// Logging configuration.
#[derive(Debug, Clone)]
pub struct LogConfig {
    pub level: Level,
    pub format: LogFormat,
    /// Extra output file; stderr is always written.
    pub file_path: Option<PathBuf>,
    pub rotation: Rotation,
    /// Emit an event when a span closes, with its busy time.
    pub span_events: bool,
    /// `EnvFilter` directives; replaces `level` when set.
    pub filter: Option<String>,
    pub show_target: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: Level::INFO,
            format: LogFormat::Pretty,
            file_path: None,
            rotation: Rotation::DAILY,
            span_events: false,
            filter: None,
            show_target: true,
        }
    }
}

impl LogConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Preset for a worker process.
    ///
    /// Pretty output becomes compact, targets are hidden, and `%I` in the
    /// file name is replaced by the worker index so every worker writes its
    /// own file.
    pub fn for_worker(&self, index: usize) -> Self {
        Self {
            format: match self.format {
                LogFormat::Pretty => LogFormat::Compact,
                other => other,
            },
            show_target: false,
            file_path: self
                .file_path
                .as_deref()
                .map(|path| expand_worker_index(path, index)),
            ..self.clone()
        }
    }

    pub fn with_level(mut self, level: Level) -> Self {
        self.level = level;
        self
    }

    pub fn with_format(mut self, format: LogFormat) -> Self {
        self.format = format;
        self
    }

    pub fn with_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.file_path = Some(path.into());
        self
    }

    pub fn with_rotation(mut self, rotation: Rotation) -> Self {
        self.rotation = rotation;
        self
    }

    pub fn with_span_events(mut self, enabled: bool) -> Self {
        self.span_events = enabled;
        self
    }

    pub fn with_filter(mut self, filter: impl Into<String>) -> Self {
        self.filter = Some(filter.into());
        self
    }

    /// Apply environment variable overrides.
    ///
    /// An explicit filter wins over `PREFORK_LOG` and `RUST_LOG`.
    /// `PREFORK_LOG_LEVEL` only applies when no filter is set at all.
    pub fn with_env_overrides(mut self) -> Self {
        if self.filter.is_none() {
            self.filter = std::env::var("PREFORK_LOG")
                .or_else(|_| std::env::var("RUST_LOG"))
                .ok();
        }
        if self.filter.is_none()
            && let Some(level) = env_lookup("PREFORK_LOG_LEVEL", LEVEL_NAMES)
        {
            self.level = level;
        }
        if let Some(format) = env_lookup("PREFORK_LOG_FORMAT", FORMAT_NAMES) {
            self.format = format;
        }
        if let Some(rotation) = env_lookup("PREFORK_LOG_ROTATION", ROTATION_NAMES) {
            self.rotation = rotation;
        }
        if let Ok(path) = std::env::var("PREFORK_LOG_FILE") {
            self.file_path = Some(PathBuf::from(path));
        }
        self
    }

    fn env_filter(&self) -> EnvFilter {
        let by_level = || EnvFilter::new(self.level.as_str().to_ascii_lowercase());
        let Some(directives) = self.filter.as_deref() else {
            return by_level();
        };
        EnvFilter::try_new(directives).unwrap_or_else(|e| {
            eprintln!("Warning: ignoring log filter '{}': {}", directives, e);
            by_level()
        })
    }

    /// Formatting layer writing to `writer`.
    fn layer<W>(&self, writer: W, ansi: bool) -> Box<dyn Layer<Registry> + Send + Sync>
    where
        W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
    {
        let span_events = if self.span_events {
            FmtSpan::CLOSE
        } else {
            FmtSpan::NONE
        };
        let base = fmt::layer()
            .with_writer(writer)
            .with_ansi(ansi)
            .with_target(self.show_target)
            .with_span_events(span_events);
        match self.format {
            LogFormat::Json => base.json().boxed(),
            LogFormat::Compact => base.compact().boxed(),
            LogFormat::Pretty => base.boxed(),
        }
    }
}

fn env_lookup<T: Clone>(name: &str, table: &[(&str, T)]) -> Option<T> {
    std::env::var(name).ok().and_then(|value| lookup(table, &value))
}

/// Replace `%I` in a path with the worker index.
pub fn expand_worker_index(path: &Path, index: usize) -> PathBuf {
    let text = path.to_string_lossy();
    if text.contains(WORKER_INDEX_PLACEHOLDER) {
        PathBuf::from(text.replace(WORKER_INDEX_PLACEHOLDER, &index.to_string()))
    } else {
        path.to_path_buf()
    }
}

/// Install the global tracing subscriber.
///
/// Logs to stderr, and additionally to `config.file_path` when set. Only
/// the first call in a process takes effect; a forked worker keeps the
/// subscriber it inherited unless none was installed.
pub fn init(config: LogConfig) {
    let mut layers = vec![config.layer(std::io::stderr, true)];

    if let Some(path) = config.file_path.as_deref() {
        let dir = path.parent().unwrap_or(Path::new("."));
        let file_name = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("prefork.log");
        let appender = RollingFileAppender::new(config.rotation.clone(), dir, file_name);
        layers.push(config.layer(appender, false));
    }

    let _ = tracing_subscriber::registry()
        .with(layers)
        .with(config.env_filter())
        .try_init();
}
