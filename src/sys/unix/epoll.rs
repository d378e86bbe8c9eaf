//! `epoll(7)`-backed selector, edge-triggered, level of detail matched to the
//! teacher's `src/sys/unix/selector/epoll.rs`.

use std::io;
use std::os::unix::io::{AsRawFd, RawFd};
use std::time::Duration;

use libc::{EPOLLERR, EPOLLET, EPOLLHUP, EPOLLIN, EPOLLOUT, EPOLLRDHUP};

use crate::interest::Interest;
use crate::sys::unix::syscall;
use crate::token::Token;

#[derive(Debug)]
pub struct Selector {
    ep: RawFd,
}

impl Selector {
    pub fn new() -> io::Result<Selector> {
        let ep = syscall!(epoll_create1(libc::EPOLL_CLOEXEC))?;
        Ok(Selector { ep })
    }

    pub fn select(&self, events: &mut Events, timeout: Option<Duration>) -> io::Result<()> {
        let timeout_ms = timeout
            .map(|d| {
                d.checked_add(Duration::from_nanos(999_999))
                    .unwrap_or(d)
                    .as_millis()
                    .min(libc::c_int::MAX as u128) as libc::c_int
            })
            .unwrap_or(-1);

        events.inner.clear();
        let n = syscall!(epoll_wait(
            self.ep,
            events.inner.as_mut_ptr(),
            events.inner.capacity() as i32,
            timeout_ms,
        ))?;
        // SAFETY: epoll_wait guarantees `n` elements were initialized.
        unsafe { events.inner.set_len(n as usize) };
        Ok(())
    }

    pub fn register(&self, fd: RawFd, token: Token, interests: Interest) -> io::Result<()> {
        let mut event = libc::epoll_event {
            events: interests_to_epoll(interests),
            u64: token.0 as u64,
        };
        syscall!(epoll_ctl(self.ep, libc::EPOLL_CTL_ADD, fd, &mut event)).map(|_| ())
    }

    pub fn reregister(&self, fd: RawFd, token: Token, interests: Interest) -> io::Result<()> {
        let mut event = libc::epoll_event {
            events: interests_to_epoll(interests),
            u64: token.0 as u64,
        };
        syscall!(epoll_ctl(self.ep, libc::EPOLL_CTL_MOD, fd, &mut event)).map(|_| ())
    }

    pub fn deregister(&self, fd: RawFd) -> io::Result<()> {
        syscall!(epoll_ctl(self.ep, libc::EPOLL_CTL_DEL, fd, std::ptr::null_mut())).map(|_| ())
    }
}

impl AsRawFd for Selector {
    fn as_raw_fd(&self) -> RawFd {
        self.ep
    }
}

impl Drop for Selector {
    fn drop(&mut self) {
        let _ = unsafe { libc::close(self.ep) };
    }
}

fn interests_to_epoll(interests: Interest) -> u32 {
    let mut kind = EPOLLET;
    if interests.is_readable() {
        kind |= EPOLLIN | EPOLLRDHUP;
    }
    if interests.is_writable() {
        kind |= EPOLLOUT;
    }
    kind as u32
}

pub struct Events {
    inner: Vec<libc::epoll_event>,
}

impl Events {
    pub fn with_capacity(capacity: usize) -> Events {
        Events {
            inner: Vec::with_capacity(capacity),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = Event> + '_ {
        self.inner.iter().map(|raw| Event { raw: *raw })
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

#[derive(Copy, Clone)]
pub struct Event {
    raw: libc::epoll_event,
}

impl Event {
    pub fn token(&self) -> Token {
        Token(self.raw.u64 as usize)
    }

    pub fn is_readable(&self) -> bool {
        self.raw.events as libc::c_int & EPOLLIN != 0
    }

    pub fn is_writable(&self) -> bool {
        self.raw.events as libc::c_int & EPOLLOUT != 0
    }

    pub fn is_error(&self) -> bool {
        self.raw.events as libc::c_int & EPOLLERR != 0
    }

    pub fn is_read_closed(&self) -> bool {
        let e = self.raw.events as libc::c_int;
        e & EPOLLHUP != 0 || (e & EPOLLIN != 0 && e & EPOLLRDHUP != 0)
    }

    pub fn is_write_closed(&self) -> bool {
        let e = self.raw.events as libc::c_int;
        e & EPOLLHUP != 0 || (e & EPOLLOUT != 0 && e & EPOLLERR != 0)
    }
}
