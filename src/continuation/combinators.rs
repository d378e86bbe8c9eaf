//! `all` / `race` / `any` / `loop` — the combinators built on top of
//! [`super::Continuation`]. Implemented as free functions over values, not as
//! an inheritance hierarchy: each one wires up subscriptions on its inputs
//! and settles a single output continuation.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::rc::Rc;

use super::{Continuation, Settle};

/// Resolves with every input's result, in input order, once all have
/// resolved; rejects with the first rejection observed without waiting for
/// the rest (matching spec: "rejects on the first rejection").
pub fn all<T: 'static, E: 'static>(inputs: Vec<Continuation<T, E>>) -> Continuation<Vec<T>, E> {
    let n = inputs.len();
    let (out, settle) = Continuation::new_pending();
    if n == 0 {
        settle.fulfill(Vec::new());
        return out;
    }

    let slots: Rc<RefCell<Vec<Option<T>>>> = Rc::new(RefCell::new((0..n).map(|_| None).collect()));
    let remaining = Rc::new(Cell::new(n));

    for (i, input) in inputs.into_iter().enumerate() {
        let slots = slots.clone();
        let remaining = remaining.clone();
        let settle = settle.clone();
        input.subscribe(move |result| match result {
            Ok(v) => {
                slots.borrow_mut()[i] = Some(v);
                let left = remaining.get() - 1;
                remaining.set(left);
                if left == 0 {
                    let values = slots
                        .borrow_mut()
                        .iter_mut()
                        .map(|slot| slot.take().expect("all inputs resolved"))
                        .collect();
                    settle.fulfill(values);
                }
            }
            Err(e) => settle.reject(e),
        });
    }

    out
}

/// Settles with whichever input settles first, ok or error.
pub fn race<T: 'static, E: 'static>(inputs: Vec<Continuation<T, E>>) -> Continuation<T, E> {
    let (out, settle) = Continuation::new_pending();
    for input in inputs {
        let settle = settle.clone();
        input.subscribe(move |result| settle.settle(result));
    }
    out
}

/// Resolves on the first ok; rejects only once every input has rejected,
/// carrying the last error observed (this crate does not aggregate the full
/// error set the way `Promise.any`'s `AggregateError` does).
pub fn any<T: 'static, E: 'static>(inputs: Vec<Continuation<T, E>>) -> Continuation<T, E> {
    let n = inputs.len();
    let (out, settle) = Continuation::new_pending();
    if n == 0 {
        return out;
    }

    let remaining = Rc::new(Cell::new(n));

    for input in inputs {
        let remaining = remaining.clone();
        let settle = settle.clone();
        input.subscribe(move |result| match result {
            Ok(v) => settle.fulfill(v),
            Err(e) => {
                let left = remaining.get() - 1;
                remaining.set(left);
                if left == 0 {
                    settle.reject(e);
                }
            }
        });
    }

    out
}

/// The handle `body` receives each iteration; it must resolve to one of
/// these to tell the loop what to do next.
pub enum LoopAction<T, E> {
    Continue,
    BreakOk(T),
    BreakErr(E),
}

/// Repeatedly invokes `body`, re-entering it each time it settles with
/// `LoopAction::Continue`. Reinvocation happens through a thread-local
/// trampoline rather than direct recursion, so a long synchronous run of
/// `Continue` results never grows the call stack.
pub fn loop_with<T: 'static, E: 'static, F>(body: F) -> Continuation<T, E>
where
    F: Fn() -> Continuation<LoopAction<T, E>, E> + 'static,
{
    let (out, settle) = Continuation::new_pending();
    let body = Rc::new(body);
    step(body, settle);
    out
}

fn step<T: 'static, E: 'static>(
    body: Rc<dyn Fn() -> Continuation<LoopAction<T, E>, E>>,
    settle: Settle<T, E>,
) {
    let iteration = body();
    iteration.subscribe(move |result| match result {
        Ok(LoopAction::Continue) => {
            schedule(Box::new(move || step(body, settle)));
        }
        Ok(LoopAction::BreakOk(v)) => settle.fulfill(v),
        Ok(LoopAction::BreakErr(e)) => settle.reject(e),
        Err(e) => settle.reject(e),
    });
}

thread_local! {
    static TRAMPOLINE: RefCell<VecDeque<Box<dyn FnOnce()>>> = RefCell::new(VecDeque::new());
    static DRAINING: Cell<bool> = Cell::new(false);
}

/// Defers `task` to run after the current call stack unwinds, draining
/// iteratively rather than recursively.
pub(crate) fn schedule(task: Box<dyn FnOnce()>) {
    TRAMPOLINE.with(|q| q.borrow_mut().push_back(task));
    if DRAINING.with(Cell::get) {
        return;
    }
    DRAINING.with(|d| d.set(true));
    loop {
        let next = TRAMPOLINE.with(|q| q.borrow_mut().pop_front());
        match next {
            Some(task) => task(),
            None => break,
        }
    }
    DRAINING.with(|d| d.set(false));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::continuation::Continuation;

    #[test]
    fn all_collects_in_order() {
        let inputs = vec![
            Continuation::<i32, ()>::resolve(1),
            Continuation::resolve(2),
            Continuation::resolve(3),
        ];
        let out = all(inputs);
        let seen = Rc::new(RefCell::new(None));
        let seen2 = seen.clone();
        out.subscribe(move |r| *seen2.borrow_mut() = Some(r));
        assert_eq!(*seen.borrow(), Some(Ok(vec![1, 2, 3])));
    }

    #[test]
    fn all_short_circuits_on_first_rejection() {
        let inputs = vec![
            Continuation::<i32, &'static str>::resolve(1),
            Continuation::reject("bad"),
        ];
        let out = all(inputs);
        let seen = Rc::new(RefCell::new(None));
        let seen2 = seen.clone();
        out.subscribe(move |r| *seen2.borrow_mut() = Some(r));
        assert_eq!(*seen.borrow(), Some(Err("bad")));
    }

    #[test]
    fn race_takes_first_settlement() {
        let (a, settle_a) = Continuation::<i32, &'static str>::new_pending();
        let (b, settle_b) = Continuation::<i32, &'static str>::new_pending();
        let out = race(vec![a, b]);
        settle_b.fulfill(2);
        settle_a.fulfill(1);
        let seen = Rc::new(RefCell::new(None));
        let seen2 = seen.clone();
        out.subscribe(move |r| *seen2.borrow_mut() = Some(r));
        assert_eq!(*seen.borrow(), Some(Ok(2)));
    }

    #[test]
    fn any_rejects_only_when_all_reject() {
        let inputs = vec![
            Continuation::<i32, &'static str>::reject("first"),
            Continuation::reject("second"),
        ];
        let out = any(inputs);
        let seen = Rc::new(RefCell::new(None));
        let seen2 = seen.clone();
        out.subscribe(move |r| *seen2.borrow_mut() = Some(r));
        assert_eq!(*seen.borrow(), Some(Err("second")));
    }

    #[test]
    fn loop_runs_many_iterations_without_growing_the_stack() {
        let counter = Rc::new(Cell::new(0));
        let counter2 = counter.clone();
        let out: Continuation<i32, ()> = loop_with(move || {
            let n = counter2.get() + 1;
            counter2.set(n);
            if n >= 100_000 {
                Continuation::resolve(LoopAction::BreakOk(n))
            } else {
                Continuation::resolve(LoopAction::Continue)
            }
        });
        let seen = Rc::new(RefCell::new(None));
        let seen2 = seen.clone();
        out.subscribe(move |r| *seen2.borrow_mut() = Some(r));
        assert_eq!(*seen.borrow(), Some(Ok(100_000)));
    }
}
