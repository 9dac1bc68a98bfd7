//! Task pool facade.
//!
//! [`TaskPool`] owns the configuration and creates a fresh backend on every
//! `start`. Everything else forwards to that backend, with `stop` and
//! `terminate` made safe to call any number of times.

use crate::config::PoolConfig;
use crate::error::{PoolError, Result};
use crate::pool::spawn::SpawnContext;
use crate::pool::{
    Args, AsyncPool, BlockingPool, Callback, EventLoop, JobId, Kwargs, NOOP, PoolBackend,
    PoolState,
};
use serde::{Serialize, Serializer};
use std::fmt;
use std::rc::Rc;
use std::time::Duration;
use tracing::{debug, info, instrument};

/// Which backend [`TaskPool::start`] creates.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Backend {
    /// Event-driven dispatch, see [`AsyncPool`].
    #[default]
    Async,
    /// Synchronous dispatch, see [`BlockingPool`].
    Blocking,
}

/// Builds a backend for a configuration.
pub type BackendFactory = Box<dyn Fn(&PoolConfig) -> Result<Rc<dyn PoolBackend>>>;

/// Per-worker task cap as reported by [`TaskPool::info`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskCap {
    Limit(usize),
    /// Workers are never recycled.
    NotApplicable,
}

impl From<Option<usize>> for TaskCap {
    fn from(cap: Option<usize>) -> Self {
        cap.map_or(Self::NotApplicable, Self::Limit)
    }
}

impl fmt::Display for TaskCap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Limit(n) => write!(f, "{}", n),
            Self::NotApplicable => write!(f, "N/A"),
        }
    }
}

impl Serialize for TaskCap {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        match self {
            Self::Limit(n) => serializer.serialize_u64(*n as u64),
            Self::NotApplicable => serializer.serialize_str("N/A"),
        }
    }
}

/// Summary of a pool's limits.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct PoolInfo {
    pub max_concurrency: usize,
    pub max_tasks_per_child: TaskCap,
    /// Soft and hard time limits in seconds.
    pub timeouts: (Option<f64>, Option<f64>),
}

/// Process pool with a start/stop lifecycle around a [`PoolBackend`].
pub struct TaskPool {
    config: PoolConfig,
    factory: BackendFactory,
    pool: Option<Rc<dyn PoolBackend>>,
}

impl fmt::Debug for TaskPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskPool")
            .field("config", &self.config)
            .field("state", &self.pool.as_ref().map(|p| p.state()))
            .finish()
    }
}

impl TaskPool {
    /// Pool whose workers are forked from `ctx`.
    pub fn new(ctx: SpawnContext, backend: Backend) -> Self {
        let config = ctx.config.clone();
        let factory: BackendFactory = Box::new(move |config: &PoolConfig| {
            let ctx = SpawnContext {
                config: config.clone(),
                ..ctx.clone()
            };
            let pool: Rc<dyn PoolBackend> = match backend {
                Backend::Async => Rc::new(AsyncPool::new(ctx)),
                Backend::Blocking => Rc::new(BlockingPool::new(ctx)),
            };
            Ok(pool)
        });
        Self::with_factory(config, factory)
    }

    /// Pool whose backend comes from `factory`.
    pub fn with_factory(config: PoolConfig, factory: BackendFactory) -> Self {
        Self {
            config,
            factory,
            pool: None,
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Configured number of workers.
    pub fn limit(&self) -> usize {
        self.config.concurrency
    }

    /// The running backend, if started.
    pub fn backend(&self) -> Option<&Rc<dyn PoolBackend>> {
        self.pool.as_ref()
    }

    fn running(&self) -> Result<&Rc<dyn PoolBackend>> {
        self.pool.as_ref().ok_or(PoolError::NotStarted)
    }

    /// Create a backend and spawn its workers.
    ///
    /// A pool that is already started is terminated and replaced.
    #[instrument(skip(self), fields(concurrency = self.config.concurrency))]
    pub fn start(&mut self) -> Result<()> {
        if let Some(old) = self.pool.take() {
            debug!("Replacing running backend");
            old.terminate()?;
        }
        let pool = (self.factory)(&self.config)?;
        if let Err(e) = pool.start() {
            let _ = pool.terminate();
            return Err(e);
        }
        info!(processes = pool.num_processes(), "Task pool started");
        self.pool = Some(pool);
        Ok(())
    }

    /// Close and join the backend. Does nothing once stopped or terminated.
    pub fn stop(&mut self) -> Result<()> {
        let Some(pool) = self.pool.as_ref() else {
            return Ok(());
        };
        let state = pool.state();
        if matches!(state, PoolState::Run | PoolState::Close) {
            if state == PoolState::Run {
                pool.close()?;
            }
            pool.join()?;
            self.pool = None;
            info!("Task pool stopped");
        }
        Ok(())
    }

    /// Terminate the backend now. Does nothing once terminated.
    pub fn terminate(&mut self) -> Result<()> {
        if let Some(pool) = self.pool.take() {
            pool.terminate()?;
            info!("Task pool terminated");
        }
        Ok(())
    }

    /// Stop accepting jobs without waiting for workers.
    pub fn close(&self) -> Result<()> {
        match self.pool.as_ref() {
            Some(pool) if pool.state() == PoolState::Run => pool.close(),
            _ => Ok(()),
        }
    }

    /// Replace every worker, then send a `noop` so the new workers are
    /// exercised right away.
    pub fn restart(&self) -> Result<()> {
        let pool = self.running()?;
        pool.restart()?;
        pool.apply_async(NOOP, Args::new(), Kwargs::new(), Box::new(|_| {}))?;
        Ok(())
    }

    pub fn apply_async(
        &self,
        action: &str,
        args: Args,
        kwargs: Kwargs,
        callback: Callback,
    ) -> Result<JobId> {
        self.running()?.apply_async(action, args, kwargs, callback)
    }

    pub fn terminate_job(&self, id: JobId) -> Result<()> {
        self.running()?.terminate_job(id)
    }

    pub fn grow(&self, n: usize) -> Result<()> {
        self.running()?.grow(n)
    }

    pub fn shrink(&self, n: usize) -> Result<()> {
        self.running()?.shrink(n)
    }

    pub fn register_with_event_loop(&self, event_loop: Rc<dyn EventLoop>) -> Result<()> {
        self.running()?.register_with_event_loop(event_loop);
        Ok(())
    }

    /// Collect results without an event loop.
    pub fn poll_once(&self, timeout: Option<Duration>) -> Result<usize> {
        self.running()?.poll_once(timeout)
    }

    pub fn did_start_ok(&self) -> bool {
        self.pool.as_ref().is_some_and(|p| p.did_start_ok())
    }

    /// Live workers, or 0 when not started.
    pub fn num_processes(&self) -> usize {
        self.pool.as_ref().map_or(0, |p| p.num_processes())
    }

    pub fn info(&self) -> PoolInfo {
        PoolInfo {
            max_concurrency: self.limit(),
            max_tasks_per_child: self.config.max_tasks_per_child.into(),
            timeouts: (
                self.config.soft_timeout.map(|d| d.as_secs_f64()),
                self.config.hard_timeout.map(|d| d.as_secs_f64()),
            ),
        }
    }
}

impl Drop for TaskPool {
    fn drop(&mut self) {
        let _ = self.terminate();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::cell::{Cell, RefCell};

    /// Backend that records calls and tracks a fake process count.
    struct MockBackend {
        calls: RefCell<Vec<&'static str>>,
        state: Cell<PoolState>,
        processes: Cell<usize>,
        fail_start: bool,
    }

    impl MockBackend {
        fn new(processes: usize) -> Self {
            Self {
                calls: RefCell::new(Vec::new()),
                state: Cell::new(PoolState::Run),
                processes: Cell::new(processes),
                fail_start: false,
            }
        }

        fn calls(&self) -> Vec<&'static str> {
            self.calls.borrow().clone()
        }

        fn record(&self, call: &'static str) {
            self.calls.borrow_mut().push(call);
        }
    }

    impl PoolBackend for MockBackend {
        fn start(&self) -> Result<()> {
            self.record("start");
            if self.fail_start {
                return Err(PoolError::Worker("boom".into()));
            }
            Ok(())
        }

        fn close(&self) -> Result<()> {
            self.record("close");
            self.state.set(PoolState::Close);
            Ok(())
        }

        fn join(&self) -> Result<()> {
            self.record("join");
            Ok(())
        }

        fn terminate(&self) -> Result<()> {
            self.record("terminate");
            self.state.set(PoolState::Terminate);
            Ok(())
        }

        fn restart(&self) -> Result<()> {
            self.record("restart");
            Ok(())
        }

        fn apply_async(
            &self,
            action: &str,
            _args: Args,
            _kwargs: Kwargs,
            _callback: Callback,
        ) -> Result<JobId> {
            self.record(if action == NOOP { "apply_noop" } else { "apply" });
            Ok(1)
        }

        fn terminate_job(&self, _id: JobId) -> Result<()> {
            self.record("terminate_job");
            Ok(())
        }

        fn grow(&self, n: usize) -> Result<()> {
            self.processes.set(self.processes.get() + n);
            Ok(())
        }

        fn shrink(&self, n: usize) -> Result<()> {
            let size = self.processes.get();
            if n >= size {
                return Err(PoolError::CannotShrink { size, by: n });
            }
            self.processes.set(size - n);
            Ok(())
        }

        fn register_with_event_loop(&self, _event_loop: Rc<dyn EventLoop>) {
            self.record("register");
        }

        fn did_start_ok(&self) -> bool {
            self.state.get() == PoolState::Run
        }

        fn state(&self) -> PoolState {
            self.state.get()
        }

        fn num_processes(&self) -> usize {
            self.processes.get()
        }
    }

    fn mock_pool(config: PoolConfig) -> (TaskPool, Rc<MockBackend>) {
        let mock = Rc::new(MockBackend::new(config.concurrency));
        let handle = mock.clone();
        let factory: BackendFactory = Box::new(move |_| {
            let pool: Rc<dyn PoolBackend> = handle.clone();
            Ok(pool)
        });
        (TaskPool::with_factory(config, factory), mock)
    }

    #[test]
    fn test_start_and_stop() {
        let (mut pool, mock) = mock_pool(PoolConfig::new(10));
        pool.start().unwrap();
        assert!(pool.did_start_ok());
        assert_eq!(pool.num_processes(), 10);

        pool.stop().unwrap();
        assert_eq!(mock.calls(), vec!["start", "close", "join"]);
        assert!(pool.backend().is_none());

        // Second stop is a no-op.
        pool.stop().unwrap();
        assert_eq!(mock.calls().len(), 3);
    }

    #[test]
    fn test_stop_skips_terminated_backend() {
        let (mut pool, mock) = mock_pool(PoolConfig::new(2));
        pool.start().unwrap();
        mock.state.set(PoolState::Terminate);

        pool.stop().unwrap();
        assert_eq!(mock.calls(), vec!["start"]);
    }

    #[test]
    fn test_stop_joins_closed_backend() {
        let (mut pool, mock) = mock_pool(PoolConfig::new(2));
        pool.start().unwrap();
        pool.close().unwrap();
        pool.stop().unwrap();
        assert_eq!(mock.calls(), vec!["start", "close", "join"]);
    }

    #[test]
    fn test_terminate_is_idempotent() {
        let (mut pool, mock) = mock_pool(PoolConfig::new(2));
        pool.start().unwrap();
        pool.terminate().unwrap();
        pool.terminate().unwrap();
        assert_eq!(mock.calls(), vec!["start", "terminate"]);
        assert!(!pool.did_start_ok());
        assert_eq!(pool.num_processes(), 0);
    }

    #[test]
    fn test_restart_sends_noop() {
        let (mut pool, mock) = mock_pool(PoolConfig::new(2));
        pool.start().unwrap();
        pool.restart().unwrap();
        assert_eq!(mock.calls(), vec!["start", "restart", "apply_noop"]);
    }

    #[test]
    fn test_operations_require_start() {
        let (pool, _mock) = mock_pool(PoolConfig::new(2));
        assert!(matches!(
            pool.apply_async("noop", Args::new(), Kwargs::new(), Box::new(|_| {})),
            Err(PoolError::NotStarted)
        ));
        assert!(matches!(pool.grow(1), Err(PoolError::NotStarted)));
        assert!(!pool.did_start_ok());
    }

    #[test]
    fn test_grow_and_shrink() {
        let (mut pool, _mock) = mock_pool(PoolConfig::new(10));
        pool.start().unwrap();
        pool.grow(1).unwrap();
        assert_eq!(pool.num_processes(), 11);
        pool.shrink(2).unwrap();
        assert_eq!(pool.num_processes(), 9);
        assert!(matches!(
            pool.shrink(9),
            Err(PoolError::CannotShrink { size: 9, by: 9 })
        ));
    }

    #[test]
    fn test_failed_start_terminates_backend() {
        let mock = Rc::new(MockBackend {
            fail_start: true,
            ..MockBackend::new(2)
        });
        let handle = mock.clone();
        let mut pool = TaskPool::with_factory(
            PoolConfig::new(2),
            Box::new(move |_| {
                let pool: Rc<dyn PoolBackend> = handle.clone();
                Ok(pool)
            }),
        );
        assert!(pool.start().is_err());
        assert_eq!(mock.calls(), vec!["start", "terminate"]);
        assert!(pool.backend().is_none());
    }

    #[test]
    fn test_info() {
        let config = PoolConfig::new(10)
            .with_max_tasks_per_child(100)
            .with_timeouts(Some(Duration::from_secs(5)), Some(Duration::from_secs(10)));
        let (pool, _mock) = mock_pool(config);
        let info = pool.info();
        assert_eq!(info.max_concurrency, 10);
        assert_eq!(info.max_tasks_per_child, TaskCap::Limit(100));
        assert_eq!(info.timeouts, (Some(5.0), Some(10.0)));
        assert_eq!(
            serde_json::to_value(&info).unwrap(),
            json!({
                "max-concurrency": 10,
                "max-tasks-per-child": 100,
                "timeouts": [5.0, 10.0],
            })
        );
    }

    #[test]
    fn test_info_without_task_cap() {
        let (pool, _mock) = mock_pool(PoolConfig::new(4));
        let value = serde_json::to_value(pool.info()).unwrap();
        assert_eq!(value["max-tasks-per-child"], "N/A");
        assert_eq!(value["timeouts"], json!([null, null]));
        assert_eq!(TaskCap::NotApplicable.to_string(), "N/A");
    }
}
