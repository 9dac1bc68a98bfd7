//! prefork - process pool for running named actions in forked workers.
//!
//! A [`TaskPool`] forks worker processes, hands each job to one of them in
//! round-robin order and delivers results through callbacks. Results are
//! collected by [`TaskPool::poll_once`] or by an [`EventLoop`] such as
//! [`Hub`].
//!
//! ```no_run
//! use prefork::{ActionRegistry, Backend, Hub, PoolConfig, SpawnContext, TaskPool};
//! use serde_json::json;
//! use std::rc::Rc;
//!
//! let mut registry = ActionRegistry::new();
//! registry.register("add", |args, _| {
//!     let sum: i64 = args.iter().filter_map(|v| v.as_i64()).sum();
//!     Ok(json!(sum))
//! });
//!
//! let ctx = SpawnContext::new(PoolConfig::new(4), registry);
//! let mut pool = TaskPool::new(ctx, Backend::Async);
//! pool.start()?;
//!
//! let hub = Rc::new(Hub::new());
//! pool.register_with_event_loop(hub.clone())?;
//! pool.apply_async("add", vec![json!(2), json!(3)], Default::default(), Box::new(|outcome| {
//!     println!("{:?}", outcome);
//! }))?;
//! hub.run_once(None)?;
//! pool.stop()?;
//! # Ok::<(), prefork::PoolError>(())
//! ```

pub mod config;
pub mod error;
pub mod logging;
pub mod pool;
pub mod task_pool;

pub use config::PoolConfig;
pub use error::{JobFailure, PoolError, Result};
pub use pool::spawn::SpawnContext;
pub use pool::{
    ActionRegistry, Args, AsyncPool, BlockingPool, EventLoop, Hub, JobId, JobOutcome, Kwargs,
    PoolBackend, PoolState,
};
pub use task_pool::{Backend, PoolInfo, TaskCap, TaskPool};
