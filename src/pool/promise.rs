//! Single-shot deferred callbacks.

use std::fmt;

/// A callback that fires at most once.
///
/// The action is stored together with any arguments bound at construction
/// and receives the value passed to [`Promise::call`]. The first call runs
/// the action and marks the promise ready. Any later call is a no-op that
/// returns `false`.
pub struct Promise<T> {
    action: Option<Box<dyn FnOnce(T)>>,
    ready: bool,
}

impl<T: 'static> Promise<T> {
    /// Wrap an action that only needs the call-time value.
    pub fn new<F>(action: F) -> Self
    where
        F: FnOnce(T) + 'static,
    {
        Self {
            action: Some(Box::new(action)),
            ready: false,
        }
    }

    /// Wrap an action together with fixed arguments.
    pub fn bind<A, F>(action: F, args: A) -> Self
    where
        A: 'static,
        F: FnOnce(A, T) + 'static,
    {
        Self::new(move |value| action(args, value))
    }

    /// Invoke the action. Returns `false` if the promise already fired.
    pub fn call(&mut self, value: T) -> bool {
        match self.action.take() {
            Some(action) => {
                self.ready = true;
                action(value);
                true
            }
            None => false,
        }
    }

    pub fn ready(&self) -> bool {
        self.ready
    }
}

impl<T> fmt::Debug for Promise<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Promise").field("ready", &self.ready).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{Value, json};
    use std::cell::RefCell;
    use std::rc::Rc;

    #[test]
    fn test_promise_binds_args() {
        let seen: Rc<RefCell<Vec<(i64, Value)>>> = Rc::default();
        let sink = seen.clone();
        let mut p = Promise::bind(
            move |(n, kwargs): (i64, Value), ()| sink.borrow_mut().push((n, kwargs)),
            (1, json!({"foo": 1})),
        );
        assert!(!p.ready());
        assert!(p.call(()));
        assert!(p.ready());
        assert_eq!(*seen.borrow(), vec![(1, json!({"foo": 1}))]);
    }

    #[test]
    fn test_promise_receives_call_value() {
        let seen = Rc::new(RefCell::new(None));
        let sink = seen.clone();
        let mut p = Promise::new(move |v: u32| *sink.borrow_mut() = Some(v));
        p.call(7);
        assert_eq!(*seen.borrow(), Some(7));
    }

    #[test]
    fn test_second_call_is_noop() {
        let count = Rc::new(RefCell::new(0));
        let c = count.clone();
        let mut p = Promise::new(move |()| *c.borrow_mut() += 1);
        assert!(p.call(()));
        assert!(!p.call(()));
        assert!(p.ready());
        assert_eq!(*count.borrow(), 1);
    }
}
