//! The resolve/reject runtime every public operation settles through.
//!
//! A [`Continuation<T, E>`] is a value-or-error slot that settles at most
//! once; [`Settle<T, E>`] is the producer-side handle a resource keeps around
//! to settle it later, from a reactor callback. This is deliberately not
//! `std::future::Future`: there is no poll-based executor here, callbacks run
//! synchronously on the thread that settles them (ordinarily the reactor
//! thread), the way the `gj`/KJ family of event-loop promise libraries work
//! rather than the way an async/await runtime works.

mod combinators;

pub use combinators::{all, any, loop_with, race, LoopAction};

use std::cell::RefCell;
use std::rc::Rc;

struct Inner<T, E> {
    settled: bool,
    value: Option<Result<T, E>>,
    listener: Option<Box<dyn FnOnce(Result<T, E>)>>,
}

impl<T, E> Inner<T, E> {
    fn new() -> Inner<T, E> {
        Inner {
            settled: false,
            value: None,
            listener: None,
        }
    }
}

/// The producer side of a continuation. Cloning shares the same underlying
/// slot; whichever clone settles first wins, later settlements are dropped
/// silently (settlement is terminal, per the state-machine invariant every
/// resource in this crate relies on).
pub struct Settle<T, E> {
    inner: Rc<RefCell<Inner<T, E>>>,
}

impl<T, E> Clone for Settle<T, E> {
    fn clone(&self) -> Settle<T, E> {
        Settle {
            inner: self.inner.clone(),
        }
    }
}

impl<T, E> Settle<T, E> {
    pub fn fulfill(&self, value: T) {
        self.settle(Ok(value));
    }

    pub fn reject(&self, err: E) {
        self.settle(Err(err));
    }

    fn settle(&self, result: Result<T, E>) {
        let mut inner = self.inner.borrow_mut();
        if inner.settled {
            return;
        }
        inner.settled = true;
        if let Some(listener) = inner.listener.take() {
            drop(inner);
            listener(result);
        } else {
            inner.value = Some(result);
        }
    }

    /// Whether this slot has already settled (from either side).
    pub fn is_settled(&self) -> bool {
        self.inner.borrow().settled
    }

    /// Settles from a plain `Result` without the caller having to match on
    /// it, used by producers (like the DNS resolver) that already have one.
    pub fn settle_result(&self, result: Result<T, E>) {
        self.settle(result);
    }
}

/// The consumer side: subscribes one callback to the eventual outcome.
pub struct Continuation<T, E> {
    inner: Rc<RefCell<Inner<T, E>>>,
}

impl<T, E> Continuation<T, E> {
    /// Builds a fresh pending slot and its producer handle.
    pub fn new_pending() -> (Continuation<T, E>, Settle<T, E>) {
        let inner = Rc::new(RefCell::new(Inner::new()));
        (
            Continuation {
                inner: inner.clone(),
            },
            Settle { inner },
        )
    }

    pub fn resolve(value: T) -> Continuation<T, E> {
        let (cont, settle) = Continuation::new_pending();
        settle.fulfill(value);
        cont
    }

    pub fn reject(err: E) -> Continuation<T, E> {
        let (cont, settle) = Continuation::new_pending();
        settle.reject(err);
        cont
    }

    /// `chain(producer)`: the producer receives a `Settle` handle and is
    /// expected to call `fulfill`/`reject` on it, now or later.
    pub fn chain<F>(producer: F) -> Continuation<T, E>
    where
        F: FnOnce(Settle<T, E>),
    {
        let (cont, settle) = Continuation::new_pending();
        producer(settle);
        cont
    }

    /// Registers the single callback that will receive the settlement. Only
    /// ever called once per continuation by the combinators below; calling it
    /// twice on the same value is a logic error (the second call never fires,
    /// since the value was already handed to the first).
    fn subscribe<F>(self, f: F)
    where
        F: FnOnce(Result<T, E>) + 'static,
        T: 'static,
        E: 'static,
    {
        let mut inner = self.inner.borrow_mut();
        if let Some(result) = inner.value.take() {
            drop(inner);
            f(result);
        } else if !inner.settled {
            inner.listener = Some(Box::new(f));
        }
    }
}

impl<T: 'static, E: 'static> Continuation<T, E> {
    /// Chains an ok-handler; errors pass through untouched.
    pub fn then<T2, F>(self, on_ok: F) -> Continuation<T2, E>
    where
        F: FnOnce(T) -> Continuation<T2, E> + 'static,
        T2: 'static,
    {
        let (next, settle) = Continuation::new_pending();
        self.subscribe(move |result| match result {
            Ok(v) => forward(on_ok(v), settle),
            Err(e) => settle.reject(e),
        });
        next
    }

    /// `then(onOk, onErr)`: both arms in one operation.
    pub fn then_or_else<T2, F, G>(self, on_ok: F, on_err: G) -> Continuation<T2, E>
    where
        F: FnOnce(T) -> Continuation<T2, E> + 'static,
        G: FnOnce(E) -> Continuation<T2, E> + 'static,
        T2: 'static,
    {
        let (next, settle) = Continuation::new_pending();
        self.subscribe(move |result| match result {
            Ok(v) => forward(on_ok(v), settle),
            Err(e) => forward(on_err(e), settle),
        });
        next
    }

    /// Chains an error-handler that recovers, producing a new ok value.
    pub fn fail<F>(self, on_err: F) -> Continuation<T, E>
    where
        F: FnOnce(E) -> Continuation<T, E> + 'static,
    {
        let (next, settle) = Continuation::new_pending();
        self.subscribe(move |result| match result {
            Ok(v) => settle.fulfill(v),
            Err(e) => forward(on_err(e), settle),
        });
        next
    }

    /// Runs `f` on settlement without altering the outcome. `f` sees a
    /// reference so it cannot swallow the result.
    pub fn finally<F>(self, f: F) -> Continuation<T, E>
    where
        F: FnOnce() + 'static,
    {
        let (next, settle) = Continuation::new_pending();
        self.subscribe(move |result| {
            f();
            settle.settle(result);
        });
        next
    }
}

/// Forwards the settlement of `source` into `target`, used by `then`/`fail`
/// when the handler itself returns a continuation rather than a plain value.
fn forward<T: 'static, E: 'static>(source: Continuation<T, E>, target: Settle<T, E>) {
    source.subscribe(move |result| target.settle(result));
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::rc::Rc;

    #[test]
    fn resolve_then_runs_immediately_on_subscribe() {
        let seen = Rc::new(Cell::new(0));
        let seen2 = seen.clone();
        let cont: Continuation<i32, &'static str> = Continuation::resolve(41);
        let _ = cont.then(move |v| {
            seen2.set(v + 1);
            Continuation::resolve(())
        });
        assert_eq!(seen.get(), 42);
    }

    #[test]
    fn reject_skips_then_and_reaches_fail() {
        let seen = Rc::new(Cell::new(String::new()));
        let seen2 = seen.clone();
        let cont: Continuation<i32, &'static str> = Continuation::reject("boom");
        let _ = cont
            .then(|v| Continuation::resolve(v + 1))
            .fail(move |e| {
                seen2.set(e.to_string());
                Continuation::resolve(0)
            });
        assert_eq!(seen.take(), "boom");
    }

    #[test]
    fn chain_settles_later_via_settle_handle() {
        let (cont, settle) = Continuation::<i32, ()>::new_pending();
        let seen = Rc::new(Cell::new(0));
        let seen2 = seen.clone();
        let _ = cont.then(move |v| {
            seen2.set(v);
            Continuation::resolve(())
        });
        assert_eq!(seen.get(), 0);
        settle.fulfill(7);
        assert_eq!(seen.get(), 7);
    }

    #[test]
    fn finally_runs_regardless_of_outcome_and_preserves_it() {
        let ran = Rc::new(Cell::new(false));
        let ran2 = ran.clone();
        let seen = Rc::new(Cell::new(0));
        let seen2 = seen.clone();
        let cont: Continuation<i32, &'static str> = Continuation::resolve(5);
        let _ = cont
            .finally(move || ran2.set(true))
            .then(move |v| {
                seen2.set(v);
                Continuation::resolve(())
            });
        assert!(ran.get());
        assert_eq!(seen.get(), 5);
    }

    #[test]
    fn double_settle_keeps_the_first() {
        let (cont, settle) = Continuation::<i32, &'static str>::new_pending();
        settle.fulfill(1);
        settle.fulfill(2);
        let seen = Rc::new(Cell::new(0));
        let seen2 = seen.clone();
        let _ = cont.then(move |v| {
            seen2.set(v);
            Continuation::resolve(())
        });
        assert_eq!(seen.get(), 1);
    }
}
