//! Pool configuration.
//!
//! # Environment Variables
//!
//! - `PREFORK_CONCURRENCY` - Number of worker processes
//! - `PREFORK_MAX_TASKS_PER_CHILD` - Jobs a worker runs before it is replaced
//! - `PREFORK_SOFT_TIMEOUT` - Soft time limit per job, in seconds
//! - `PREFORK_HARD_TIMEOUT` - Hard time limit per job, in seconds

use crate::pool::boot::BootConfig;
use std::time::Duration;

/// Workers spawned when the machine's parallelism cannot be determined.
const FALLBACK_CONCURRENCY: usize = 4;

/// Configuration shared by both pool backends.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Number of worker processes to keep running.
    pub concurrency: usize,
    /// Jobs a worker runs before exiting (None = unlimited).
    pub max_tasks_per_child: Option<usize>,
    /// Warn the worker (SIGUSR1) once a job has run this long.
    pub soft_timeout: Option<Duration>,
    /// Kill the worker once a job has run this long.
    pub hard_timeout: Option<Duration>,
    /// Host name handed to every worker at boot.
    pub hostname: String,
    /// How often the maintenance timer runs when attached to an event loop.
    pub maintenance_interval: Duration,
    /// How long `start` waits for workers to announce themselves.
    pub startup_timeout: Duration,
    /// How long a worker gets to exit on its own before it is killed.
    pub shutdown_grace: Duration,
    /// Process setup applied inside every worker.
    pub boot: BootConfig,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            concurrency: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(FALLBACK_CONCURRENCY),
            max_tasks_per_child: None,
            soft_timeout: None,
            hard_timeout: None,
            hostname: local_hostname(),
            maintenance_interval: Duration::from_millis(100),
            startup_timeout: Duration::from_secs(10),
            shutdown_grace: Duration::from_secs(5),
            boot: BootConfig::default(),
        }
    }
}

impl PoolConfig {
    pub fn new(concurrency: usize) -> Self {
        Self {
            concurrency,
            ..Self::default()
        }
    }

    pub fn with_max_tasks_per_child(mut self, max: usize) -> Self {
        self.max_tasks_per_child = Some(max);
        self
    }

    pub fn with_timeouts(mut self, soft: Option<Duration>, hard: Option<Duration>) -> Self {
        self.soft_timeout = soft;
        self.hard_timeout = hard;
        self
    }

    pub fn with_hostname(mut self, hostname: impl Into<String>) -> Self {
        self.hostname = hostname.into();
        self
    }

    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    pub fn with_boot(mut self, boot: BootConfig) -> Self {
        self.boot = boot;
        self
    }

    /// Apply environment variable overrides. Unparseable values are ignored.
    pub fn with_env_overrides(mut self) -> Self {
        if let Some(n) = env_parse::<usize>("PREFORK_CONCURRENCY").filter(|n| *n > 0) {
            self.concurrency = n;
        }
        if let Some(n) = env_parse::<usize>("PREFORK_MAX_TASKS_PER_CHILD") {
            self.max_tasks_per_child = (n > 0).then_some(n);
        }
        if let Some(secs) = env_parse::<f64>("PREFORK_SOFT_TIMEOUT") {
            self.soft_timeout = Duration::try_from_secs_f64(secs).ok();
        }
        if let Some(secs) = env_parse::<f64>("PREFORK_HARD_TIMEOUT") {
            self.hard_timeout = Duration::try_from_secs_f64(secs).ok();
        }
        self
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok()?.trim().parse().ok()
}

fn local_hostname() -> String {
    nix::unistd::gethostname()
        .ok()
        .and_then(|name| name.into_string().ok())
        .unwrap_or_else(|| "localhost".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = PoolConfig::default();
        assert!(config.concurrency >= 1);
        assert!(config.max_tasks_per_child.is_none());
        assert!(config.soft_timeout.is_none());
        assert!(config.hard_timeout.is_none());
        assert!(!config.hostname.is_empty());
    }

    #[test]
    fn test_builder() {
        let config = PoolConfig::new(10)
            .with_max_tasks_per_child(100)
            .with_timeouts(Some(Duration::from_secs(5)), Some(Duration::from_secs(10)))
            .with_hostname("awesome.worker.com");
        assert_eq!(config.concurrency, 10);
        assert_eq!(config.max_tasks_per_child, Some(100));
        assert_eq!(config.soft_timeout, Some(Duration::from_secs(5)));
        assert_eq!(config.hard_timeout, Some(Duration::from_secs(10)));
        assert_eq!(config.hostname, "awesome.worker.com");
    }
}
