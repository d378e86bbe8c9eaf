//! Per-fd readiness subscription (spec §4.3). A [`ReadinessEvent`] owns
//! nothing about the fd's lifecycle — the fd is registered once, at
//! construction, with both READ and WRITE interest (the selector is
//! edge-triggered; see `sys::unix::epoll`), and every call to [`on`][ReadinessEvent::on]
//! or [`on_persist`][ReadinessEvent::on_persist] just arms or re-arms the
//! single pending-operation cell against events the reactor already
//! delivers for that fd.

use std::os::unix::io::RawFd;
use std::rc::Rc;
use std::cell::RefCell;
use std::time::Duration;

use crate::continuation::{Continuation, Settle};
use crate::deadline::DeadlineId;
use crate::error::Error;
use crate::interest::Interest;
use crate::reactor::{Reactor, SourceCallback};
use crate::token::Token;

enum Pending {
    Once {
        settle: Settle<Interest, Error>,
        deadline: Option<DeadlineId>,
    },
    Persist {
        mask: Interest,
        predicate: Rc<RefCell<dyn FnMut(Interest) -> bool>>,
        timeout: Option<Duration>,
        settle: Settle<(), Error>,
        deadline: Option<DeadlineId>,
    },
}

struct Inner {
    reactor: Reactor,
    fd: RawFd,
    token: Option<Token>,
    pending: Option<Pending>,
}

/// A readiness subscription on a single fd. At most one subscription (either
/// a one-shot [`on`][ReadinessEvent::on] or a persistent
/// [`on_persist`][ReadinessEvent::on_persist]) may be outstanding at a time;
/// a second call while one is pending fails with `BUSY`.
pub struct ReadinessEvent {
    inner: Rc<RefCell<Inner>>,
}

impl Clone for ReadinessEvent {
    fn clone(&self) -> ReadinessEvent {
        ReadinessEvent {
            inner: self.inner.clone(),
        }
    }
}

struct Source(Rc<RefCell<Inner>>);

impl SourceCallback for Source {
    fn on_ready(&self, reactor: &Reactor, bits: Interest) {
        fire(&self.0, reactor, bits);
    }
}

impl ReadinessEvent {
    /// Registers `fd` with the reactor. The fd is watched for both
    /// readability and writability for its whole lifetime; individual
    /// `on`/`on_persist` calls only change what happens when the reactor
    /// reports an edge, never the selector registration itself.
    pub fn new(reactor: &Reactor, fd: RawFd) -> Result<ReadinessEvent, Error> {
        let inner = Rc::new(RefCell::new(Inner {
            reactor: reactor.clone(),
            fd,
            token: None,
            pending: None,
        }));
        let token = reactor.register_source(fd, Interest::READ | Interest::WRITE, Rc::new(Source(inner.clone())))?;
        inner.borrow_mut().token = Some(token);
        Ok(ReadinessEvent { inner })
    }

    pub fn fd(&self) -> RawFd {
        self.inner.borrow().fd
    }

    pub fn pending(&self) -> bool {
        self.inner.borrow().pending.is_some()
    }

    /// Registers interest once; settles with the triggered bit combination
    /// (a subset of READ/WRITE/CLOSED/TIMEOUT). Fails immediately with
    /// `BUSY` if a subscription is already pending, or `INVALID` if `mask`
    /// requests the PERSIST bit (only valid for [`on_persist`][Self::on_persist]).
    pub fn on(&self, mask: Interest, timeout: Option<Duration>) -> Continuation<Interest, Error> {
        if mask.is_persist() {
            return Continuation::reject(Error::invalid_argument("PERSIST is not a valid argument to on()"));
        }
        if self.pending() {
            return Continuation::reject(Error::busy());
        }
        let (cont, settle) = Continuation::new_pending();
        let deadline = timeout.map(|d| {
            let inner = self.inner.clone();
            let settle = settle.clone();
            self.inner.borrow().reactor.schedule_deadline(
                d,
                Box::new(move || fire_timeout(&inner, settle)),
            )
        });
        self.inner.borrow_mut().pending = Some(Pending::Once { settle, deadline });
        cont
    }

    /// Repeatedly re-arms as long as `predicate(bits)` returns true; settles
    /// with `()` the first time it returns false.
    pub fn on_persist<F>(&self, mask: Interest, predicate: F, timeout: Option<Duration>) -> Continuation<(), Error>
    where
        F: FnMut(Interest) -> bool + 'static,
    {
        if self.pending() {
            return Continuation::reject(Error::busy());
        }
        let (cont, settle) = Continuation::new_pending();
        self.arm_persist(mask, Rc::new(RefCell::new(predicate)), timeout, settle);
        cont
    }

    fn arm_persist(
        &self,
        mask: Interest,
        predicate: Rc<RefCell<dyn FnMut(Interest) -> bool>>,
        timeout: Option<Duration>,
        settle: Settle<(), Error>,
    ) {
        let deadline = timeout.map(|d| {
            let inner = self.inner.clone();
            let predicate = predicate.clone();
            let settle = settle.clone();
            self.inner.borrow().reactor.schedule_deadline(
                d,
                Box::new(move || fire_persist_timeout(&inner, mask, predicate, timeout, settle)),
            )
        });
        self.inner.borrow_mut().pending = Some(Pending::Persist {
            mask,
            predicate,
            timeout,
            settle,
            deadline,
        });
    }

    /// Dequeues the pending subscription, if any, and rejects it with
    /// `CANCELLED`.
    pub fn cancel(&self) {
        let pending = self.inner.borrow_mut().pending.take();
        match pending {
            Some(Pending::Once { settle, deadline }) => {
                if let Some(id) = deadline {
                    self.inner.borrow().reactor.cancel_deadline(id);
                }
                settle.reject(Error::cancelled());
            }
            Some(Pending::Persist { settle, deadline, .. }) => {
                if let Some(id) = deadline {
                    self.inner.borrow().reactor.cancel_deadline(id);
                }
                settle.reject(Error::cancelled());
            }
            None => {}
        }
    }

    /// Synthesizes a firing as though the selector reported `bits`. Used by
    /// [`crate::channel::Channel`] to wake loop-side waiters without a real
    /// fd event.
    pub fn trigger(&self, bits: Interest) {
        let reactor = self.inner.borrow().reactor.clone();
        fire(&self.inner, &reactor, bits);
    }

    /// Changes the selector-registered interest mask for this fd (e.g. to
    /// disable READ once the input queue exceeds the back-pressure cap).
    pub(crate) fn set_interest(&self, mask: Interest) -> Result<(), Error> {
        let inner = self.inner.borrow();
        if let Some(token) = inner.token {
            inner.reactor.reregister_source(inner.fd, token, mask)?;
        }
        Ok(())
    }
}

impl Drop for ReadinessEvent {
    fn drop(&mut self) {
        // Only the last strong reference (the owning resource, since
        // `Source` also holds one) tears down the registration.
        if Rc::strong_count(&self.inner) <= 2 {
            let inner = self.inner.borrow();
            if let Some(token) = inner.token {
                let _ = inner.reactor.deregister_source(inner.fd, token);
            }
        }
    }
}

fn fire(inner: &Rc<RefCell<Inner>>, reactor: &Reactor, bits: Interest) {
    let pending = inner.borrow_mut().pending.take();
    match pending {
        None => {}
        Some(Pending::Once { settle, deadline }) => {
            if let Some(id) = deadline {
                reactor.cancel_deadline(id);
            }
            settle.fulfill(bits);
        }
        Some(Pending::Persist {
            mask,
            predicate,
            timeout,
            settle,
            deadline,
        }) => {
            if let Some(id) = deadline {
                reactor.cancel_deadline(id);
            }
            if (predicate.borrow_mut())(bits) {
                let event = ReadinessEvent { inner: inner.clone() };
                event.arm_persist(mask, predicate, timeout, settle);
            } else {
                settle.fulfill(());
            }
        }
    }
}

fn fire_timeout(inner: &Rc<RefCell<Inner>>, settle: Settle<Interest, Error>) {
    let was_pending = matches!(inner.borrow().pending, Some(Pending::Once { .. }));
    if was_pending {
        inner.borrow_mut().pending = None;
        settle.fulfill(Interest::TIMEOUT);
    }
}

fn fire_persist_timeout(
    inner: &Rc<RefCell<Inner>>,
    mask: Interest,
    predicate: Rc<RefCell<dyn FnMut(Interest) -> bool>>,
    timeout: Option<Duration>,
    settle: Settle<(), Error>,
) {
    let still_pending = matches!(inner.borrow().pending, Some(Pending::Persist { .. }));
    if !still_pending {
        return;
    }
    inner.borrow_mut().pending = None;
    if (predicate.borrow_mut())(Interest::TIMEOUT) {
        let event = ReadinessEvent { inner: inner.clone() };
        event.arm_persist(mask, predicate, timeout, settle);
    } else {
        settle.fulfill(());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::io::AsRawFd;

    #[test]
    fn on_rejects_persist_bit_as_invalid() {
        let reactor = Reactor::new().expect("reactor");
        let (r, _w) = crate::sys::self_pipe().expect("pipe");
        let event = ReadinessEvent::new(&reactor, r.as_raw_fd()).expect("register");
        let rejected = Rc::new(RefCell::new(None));
        let rejected2 = rejected.clone();
        let _ = event.on(Interest::PERSIST, None).then_or_else(
            move |_| Continuation::<(), Error>::resolve(()),
            move |e| {
                *rejected2.borrow_mut() = Some(e);
                Continuation::resolve(())
            },
        );
        assert!(rejected.borrow().as_ref().unwrap().kind() == crate::error::ErrorKind::InvalidArgument);
    }

    #[test]
    fn second_on_while_pending_rejects_busy() {
        let reactor = Reactor::new().expect("reactor");
        let (r, _w) = crate::sys::self_pipe().expect("pipe");
        let event = ReadinessEvent::new(&reactor, r.as_raw_fd()).expect("register");
        let _first = event.on(Interest::READ, None);
        let rejected = Rc::new(RefCell::new(false));
        let rejected2 = rejected.clone();
        let _ = event.on(Interest::READ, None).then_or_else(
            move |_| Continuation::<(), Error>::resolve(()),
            move |e| {
                *rejected2.borrow_mut() = e.kind() == crate::error::ErrorKind::Busy;
                Continuation::resolve(())
            },
        );
        assert!(*rejected.borrow());
    }

    #[test]
    fn cancel_then_on_succeeds_immediately() {
        let reactor = Reactor::new().expect("reactor");
        let (r, _w) = crate::sys::self_pipe().expect("pipe");
        let event = ReadinessEvent::new(&reactor, r.as_raw_fd()).expect("register");
        let _first = event.on(Interest::READ, None);
        event.cancel();
        assert!(!event.pending());
        let _second = event.on(Interest::READ, None);
        assert!(event.pending());
    }
}
