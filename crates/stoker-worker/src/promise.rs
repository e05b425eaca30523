//! A settled-once result primitive.
//!
//! Two states, a callback queue, and `then` chaining. Not a future:
//! there is no executor and no polling. The mediator settles a promise
//! exactly once from the main loop while draining RETURN headers (or
//! reconciling dead children); callbacks run synchronously at that
//! point, on the settling thread.

use std::cell::RefCell;
use std::rc::Rc;

use serde_json::Value;

use crate::error::WorkerError;

/// The terminal state of a promise.
#[derive(Debug, Clone)]
pub enum Settled {
    /// The call produced a value.
    Fulfilled(Value),
    /// The call failed.
    Rejected(WorkerError),
}

/// What a `then` callback turns a settlement into.
pub enum Chained {
    /// Settle the derived promise with this value.
    Value(Value),
    /// Reject the derived promise with this error.
    Error(WorkerError),
    /// Adopt another promise's eventual settlement.
    Promise(Promise),
}

type Callback = Box<dyn FnOnce(&Settled)>;

#[derive(Default)]
struct Inner {
    state: Option<Settled>,
    callbacks: Vec<Callback>,
}

/// A single-settlement handle to a pending result.
///
/// Clones share the same settlement; the promise never crosses a
/// process boundary.
#[derive(Clone, Default)]
pub struct Promise {
    inner: Rc<RefCell<Inner>>,
}

impl Promise {
    /// A pending promise.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// An already-fulfilled promise.
    #[must_use]
    pub fn fulfilled(value: Value) -> Self {
        let p = Self::new();
        p.settle(Settled::Fulfilled(value));
        p
    }

    /// An already-rejected promise.
    #[must_use]
    pub fn rejected(error: WorkerError) -> Self {
        let p = Self::new();
        p.settle(Settled::Rejected(error));
        p
    }

    /// Settles the promise and runs queued callbacks.
    ///
    /// Returns false (and does nothing) when already settled; a
    /// promise settles exactly once.
    pub fn settle(&self, settled: Settled) -> bool {
        let callbacks = {
            let mut inner = self.inner.borrow_mut();
            if inner.state.is_some() {
                return false;
            }
            inner.state = Some(settled.clone());
            std::mem::take(&mut inner.callbacks)
        };
        // The borrow is released before callbacks run, so they may
        // inspect or clone this promise freely.
        for cb in callbacks {
            cb(&settled);
        }
        true
    }

    /// Sugar for settling with a value.
    pub fn fulfill(&self, value: Value) -> bool {
        self.settle(Settled::Fulfilled(value))
    }

    /// Sugar for settling with an error.
    pub fn reject(&self, error: WorkerError) -> bool {
        self.settle(Settled::Rejected(error))
    }

    /// Whether a settlement happened.
    #[must_use]
    pub fn is_settled(&self) -> bool {
        self.inner.borrow().state.is_some()
    }

    /// A copy of the settlement, if any.
    #[must_use]
    pub fn state(&self) -> Option<Settled> {
        self.inner.borrow().state.clone()
    }

    /// Runs `f` at settlement time (immediately when already settled).
    pub fn on_settle(&self, f: impl FnOnce(&Settled) + 'static) {
        let state = {
            let inner = self.inner.borrow();
            inner.state.clone()
        };
        match state {
            Some(state) => f(&state),
            None => {
                let mut inner = self.inner.borrow_mut();
                inner.callbacks.push(Box::new(f));
            }
        }
    }

    /// Derives a new promise through a pair of handlers.
    ///
    /// A handler returning [`Chained::Promise`] chains: the derived
    /// promise adopts that promise's eventual settlement.
    #[must_use]
    pub fn then(
        &self,
        on_fulfilled: impl FnOnce(Value) -> Chained + 'static,
        on_rejected: impl FnOnce(WorkerError) -> Chained + 'static,
    ) -> Self {
        let next = Self::new();
        let derived = next.clone();
        self.on_settle(move |settled| {
            let outcome = match settled {
                Settled::Fulfilled(value) => on_fulfilled(value.clone()),
                Settled::Rejected(error) => on_rejected(error.clone()),
            };
            match outcome {
                Chained::Value(value) => {
                    derived.fulfill(value);
                }
                Chained::Error(error) => {
                    derived.reject(error);
                }
                Chained::Promise(promise) => {
                    let adopter = derived.clone();
                    promise.on_settle(move |inner_settled| {
                        adopter.settle(inner_settled.clone());
                    });
                }
            }
        });
        next
    }
}

impl std::fmt::Debug for Promise {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.state() {
            Some(Settled::Fulfilled(_)) => f.write_str("Promise(fulfilled)"),
            Some(Settled::Rejected(_)) => f.write_str("Promise(rejected)"),
            None => f.write_str("Promise(pending)"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn settles_exactly_once() {
        let p = Promise::new();
        assert!(!p.is_settled());
        assert!(p.fulfill(json!(1)));
        assert!(!p.fulfill(json!(2)));
        assert!(!p.reject(WorkerError::clean("late")));
        match p.state() {
            Some(Settled::Fulfilled(v)) => assert_eq!(v, json!(1)),
            other => panic!("unexpected state {other:?}"),
        }
    }

    #[test]
    fn callbacks_run_on_settle_and_late_subscribers_immediately() {
        let p = Promise::new();
        let seen = Rc::new(RefCell::new(Vec::new()));
        {
            let seen = Rc::clone(&seen);
            p.on_settle(move |s| {
                if let Settled::Fulfilled(v) = s {
                    seen.borrow_mut().push(v.clone());
                }
            });
        }
        p.fulfill(json!("early"));
        {
            let seen = Rc::clone(&seen);
            p.on_settle(move |s| {
                if let Settled::Fulfilled(v) = s {
                    seen.borrow_mut().push(v.clone());
                }
            });
        }
        assert_eq!(seen.borrow().len(), 2);
    }

    #[test]
    fn then_transforms_values() {
        let p = Promise::new();
        let doubled = p.then(
            |v| Chained::Value(json!(v.as_i64().unwrap_or(0) * 2)),
            Chained::Error,
        );
        p.fulfill(json!(21));
        match doubled.state() {
            Some(Settled::Fulfilled(v)) => assert_eq!(v, json!(42)),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn then_propagates_rejection() {
        let p = Promise::new();
        let mapped = p.then(Chained::Value, |e| {
            Chained::Error(WorkerError::clean(format!("wrapped: {e}")))
        });
        p.reject(WorkerError::died("gone"));
        match mapped.state() {
            Some(Settled::Rejected(e)) => assert!(e.to_string().contains("wrapped")),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn then_chains_promises() {
        let first = Promise::new();
        let gate = Promise::new();
        let gate_for_chain = gate.clone();
        let chained = first.then(
            move |_| Chained::Promise(gate_for_chain.clone()),
            Chained::Error,
        );

        first.fulfill(json!("go"));
        assert!(!chained.is_settled());

        gate.fulfill(json!("finally"));
        match chained.state() {
            Some(Settled::Fulfilled(v)) => assert_eq!(v, json!("finally")),
            other => panic!("unexpected {other:?}"),
        }
    }
}
