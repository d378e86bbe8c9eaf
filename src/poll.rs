//! Thin wrapper over the platform selector: register/reregister/deregister a
//! raw fd for a [`Token`], and block the calling thread until the selector
//! reports readiness or a timeout elapses. [`crate::reactor::Reactor`] is the
//! only consumer of this type; nothing above it touches a selector fd
//! directly.

use std::io;
use std::os::unix::io::RawFd;
use std::time::Duration;

use log::trace;

use crate::interest::Interest;
use crate::sys;
use crate::token::Token;

pub struct Poll {
    selector: sys::Selector,
}

impl Poll {
    pub fn new() -> io::Result<Poll> {
        Ok(Poll {
            selector: sys::Selector::new()?,
        })
    }

    pub fn register(&self, fd: RawFd, token: Token, interests: Interest) -> io::Result<()> {
        trace!("registering fd {fd} with token {token:?}, interests {interests:?}");
        self.selector.register(fd, token, interests.selector_mask())
    }

    pub fn reregister(&self, fd: RawFd, token: Token, interests: Interest) -> io::Result<()> {
        trace!("reregistering fd {fd} with token {token:?}, interests {interests:?}");
        self.selector.reregister(fd, token, interests.selector_mask())
    }

    pub fn deregister(&self, fd: RawFd) -> io::Result<()> {
        trace!("deregistering fd {fd}");
        self.selector.deregister(fd)
    }

    /// Blocks until the selector reports readiness events or `timeout`
    /// elapses (`None` blocks indefinitely, `Some(Duration::ZERO)` polls
    /// without blocking).
    pub fn poll(&self, events: &mut sys::Events, timeout: Option<Duration>) -> io::Result<()> {
        self.selector.select(events, timeout)
    }

    pub(crate) fn selector(&self) -> &sys::Selector {
        &self.selector
    }
}
