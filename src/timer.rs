//! Timed continuations (spec §4.4). Built directly on
//! [`crate::reactor::Reactor`]'s deadline queue — no fd, no selector
//! involvement, unlike [`crate::readiness::ReadinessEvent`].

use std::cell::RefCell;
use std::rc::Rc;
use std::time::Duration;

use crate::continuation::{Continuation, Settle};
use crate::deadline::DeadlineId;
use crate::error::Error;
use crate::reactor::Reactor;

/// A single outstanding timeout/interval, cancellable exactly once.
pub struct Timer {
    reactor: Reactor,
    state: Rc<RefCell<Option<State>>>,
}

struct State {
    deadline: DeadlineId,
    settle: Settle<(), Error>,
}

impl Timer {
    pub fn new(reactor: &Reactor) -> Timer {
        Timer {
            reactor: reactor.clone(),
            state: Rc::new(RefCell::new(None)),
        }
    }

    pub fn pending(&self) -> bool {
        self.state.borrow().is_some()
    }

    /// Settles after `delay`. Rejects with `BUSY` if a timeout or interval
    /// is already pending on this `Timer`.
    pub fn set_timeout(&self, delay: Duration) -> Continuation<(), Error> {
        if self.pending() {
            return Continuation::reject(Error::busy());
        }
        let (cont, settle) = Continuation::new_pending();
        let state = self.state.clone();
        let settle2 = settle.clone();
        let id = self.reactor.schedule_deadline(
            delay,
            Box::new(move || {
                if state.borrow_mut().take().is_some() {
                    settle2.fulfill(());
                }
            }),
        );
        *self.state.borrow_mut() = Some(State { deadline: id, settle });
        cont
    }

    /// Persistent variant: re-arms every `delay` as long as `predicate()`
    /// returns true, settling `()` the first time it returns false.
    pub fn set_interval<F>(&self, delay: Duration, predicate: F) -> Continuation<(), Error>
    where
        F: FnMut() -> bool + 'static,
    {
        if self.pending() {
            return Continuation::reject(Error::busy());
        }
        let (cont, settle) = Continuation::new_pending();
        arm_interval(self.reactor.clone(), self.state.clone(), delay, Rc::new(RefCell::new(predicate)), settle);
        cont
    }

    /// If pending, cancels the deadline and rejects the outstanding
    /// continuation with `CANCELLED`; otherwise a no-op. Unlike
    /// [`ReadinessEvent::cancel`][crate::readiness::ReadinessEvent::cancel]
    /// the reject is delivered here directly, since there is no underlying
    /// fd event to intercept.
    pub fn cancel(&self) -> bool {
        match self.state.borrow_mut().take() {
            Some(State { deadline, settle }) => {
                self.reactor.cancel_deadline(deadline);
                settle.reject(Error::cancelled());
                true
            }
            None => false,
        }
    }
}

fn arm_interval(
    reactor: Reactor,
    state: Rc<RefCell<Option<State>>>,
    delay: Duration,
    predicate: Rc<RefCell<dyn FnMut() -> bool>>,
    settle: Settle<(), Error>,
) {
    let state2 = state.clone();
    let reactor2 = reactor.clone();
    let settle2 = settle.clone();
    let id = reactor.schedule_deadline(
        delay,
        Box::new(move || {
            if state2.borrow_mut().take().is_none() {
                return; // cancelled
            }
            if (predicate.borrow_mut())() {
                arm_interval(reactor2, state2, delay, predicate, settle2);
            } else {
                settle2.fulfill(());
            }
        }),
    );
    *state.borrow_mut() = Some(State { deadline: id, settle });
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[test]
    fn set_timeout_settles_after_the_delay() {
        let reactor = Reactor::new().expect("reactor");
        let timer = Timer::new(&reactor);
        let fired = Rc::new(Cell::new(false));
        let fired2 = fired.clone();
        let _ = timer.set_timeout(Duration::from_millis(20)).then(move |_| {
            fired2.set(true);
            Continuation::<(), Error>::resolve(())
        });

        let start = std::time::Instant::now();
        while !fired.get() && start.elapsed() < Duration::from_secs(1) {
            reactor.dispatch_once().expect("tick");
        }
        assert!(fired.get());
        assert!(start.elapsed() >= Duration::from_millis(15));
    }

    #[test]
    fn cancel_before_expiry_rejects_with_cancelled() {
        let reactor = Reactor::new().expect("reactor");
        let timer = Timer::new(&reactor);
        let outcome: Rc<RefCell<Option<Error>>> = Rc::new(RefCell::new(None));
        let outcome2 = outcome.clone();
        let _ = timer.set_timeout(Duration::from_millis(500)).fail(move |e| {
            *outcome2.borrow_mut() = Some(e);
            Continuation::<(), Error>::resolve(())
        });
        assert!(timer.cancel());
        assert!(!timer.pending());
        assert!(outcome.borrow().as_ref().expect("settled synchronously").is_cancelled());
        for _ in 0..5 {
            reactor.dispatch_once().expect("tick");
        }
        assert!(outcome.borrow().as_ref().unwrap().is_cancelled());
    }

    #[test]
    fn set_interval_reruns_predicate_until_false() {
        let reactor = Reactor::new().expect("reactor");
        let timer = Timer::new(&reactor);
        let count = Rc::new(Cell::new(0));
        let count2 = count.clone();
        let done = Rc::new(Cell::new(false));
        let done2 = done.clone();
        let _ = timer
            .set_interval(Duration::from_millis(5), move || {
                count2.set(count2.get() + 1);
                count2.get() < 3
            })
            .then(move |_| {
                done2.set(true);
                Continuation::<(), Error>::resolve(())
            });

        let start = std::time::Instant::now();
        while !done.get() && start.elapsed() < Duration::from_secs(1) {
            reactor.dispatch_once().expect("tick");
        }
        assert_eq!(count.get(), 3);
    }
}
