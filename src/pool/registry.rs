//! Named actions a worker can run.
//!
//! Workers are forked from the pool process, so they inherit the registry
//! as it was when they were spawned. Jobs refer to actions by name.

use super::protocol::{Args, Job, JobOutcome, Kwargs, NOOP};
use crate::error::JobFailure;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::rc::Rc;

/// A job body: positional and keyword arguments in, JSON value or error out.
pub type Action = Rc<dyn Fn(&Args, &Kwargs) -> Result<Value, String>>;

/// Map from action name to action.
#[derive(Clone)]
pub struct ActionRegistry {
    actions: HashMap<String, Action>,
}

impl Default for ActionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ActionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names = self.names();
        names.sort_unstable();
        f.debug_struct("ActionRegistry")
            .field("actions", &names)
            .finish()
    }
}

impl ActionRegistry {
    /// Registry holding only the built-in `noop` action.
    pub fn new() -> Self {
        let mut registry = Self {
            actions: HashMap::new(),
        };
        registry.register(NOOP, |_, _| Ok(Value::Null));
        registry
    }

    pub fn register<F>(&mut self, name: impl Into<String>, action: F) -> &mut Self
    where
        F: Fn(&Args, &Kwargs) -> Result<Value, String> + 'static,
    {
        self.actions.insert(name.into(), Rc::new(action));
        self
    }

    pub fn contains(&self, name: &str) -> bool {
        self.actions.contains_key(name)
    }

    pub fn names(&self) -> Vec<&str> {
        self.actions.keys().map(String::as_str).collect()
    }

    /// Run a job. Panics inside the action become job failures.
    pub fn run(&self, job: &Job) -> JobOutcome {
        let action = self
            .actions
            .get(&job.action)
            .ok_or_else(|| JobFailure::UnknownAction {
                action: job.action.clone(),
            })?;

        match panic::catch_unwind(AssertUnwindSafe(|| action(&job.args, &job.kwargs))) {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(message)) => Err(JobFailure::Raised { message }),
            Err(payload) => Err(JobFailure::Raised {
                message: format!("panicked: {}", panic_message(payload.as_ref())),
            }),
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn job(action: &str, args: Args) -> Job {
        Job::new(1, action, args, Kwargs::new())
    }

    #[test]
    fn test_noop_is_builtin() {
        let registry = ActionRegistry::new();
        assert!(registry.contains(NOOP));
        assert_eq!(registry.run(&job(NOOP, vec![])), Ok(Value::Null));
    }

    #[test]
    fn test_registered_action_runs() {
        let mut registry = ActionRegistry::new();
        registry.register("add", |args, _| {
            let sum: i64 = args.iter().filter_map(Value::as_i64).sum();
            Ok(json!(sum))
        });
        assert_eq!(registry.run(&job("add", vec![json!(2), json!(3)])), Ok(json!(5)));
    }

    #[test]
    fn test_unknown_action() {
        let registry = ActionRegistry::new();
        assert_eq!(
            registry.run(&job("missing", vec![])),
            Err(JobFailure::UnknownAction {
                action: "missing".into()
            })
        );
    }

    #[test]
    fn test_error_and_panic_become_failures() {
        let mut registry = ActionRegistry::new();
        registry
            .register("fail", |_, _| Err("bad input".into()))
            .register("explode", |_, _| panic!("kaboom"));

        assert_eq!(
            registry.run(&job("fail", vec![])),
            Err(JobFailure::Raised {
                message: "bad input".into()
            })
        );
        match registry.run(&job("explode", vec![])) {
            Err(JobFailure::Raised { message }) => assert!(message.contains("kaboom")),
            other => panic!("Expected Raised failure, got {:?}", other),
        }
    }
}
