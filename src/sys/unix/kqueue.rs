//! `kqueue(2)`-backed selector for the BSDs and macOS.

use std::io;
use std::os::unix::io::{AsRawFd, RawFd};
use std::time::Duration;

use crate::interest::Interest;
use crate::sys::unix::syscall;
use crate::token::Token;

#[cfg(not(target_os = "netbsd"))]
type Count = libc::c_int;
#[cfg(target_os = "netbsd")]
type Count = libc::size_t;

#[derive(Debug)]
pub struct Selector {
    kq: RawFd,
}

impl Selector {
    pub fn new() -> io::Result<Selector> {
        let kq = syscall!(kqueue())?;
        syscall!(fcntl(kq, libc::F_SETFD, libc::FD_CLOEXEC))?;
        Ok(Selector { kq })
    }

    pub fn select(&self, events: &mut Events, timeout: Option<Duration>) -> io::Result<()> {
        let ts = timeout.map(|d| libc::timespec {
            tv_sec: d.as_secs() as libc::time_t,
            tv_nsec: d.subsec_nanos() as libc::c_long,
        });
        let ts_ptr = ts
            .as_ref()
            .map(|t| t as *const libc::timespec)
            .unwrap_or(std::ptr::null());

        events.inner.clear();
        let n = syscall!(kevent(
            self.kq,
            std::ptr::null(),
            0,
            events.inner.as_mut_ptr(),
            events.inner.capacity() as Count,
            ts_ptr,
        ))?;
        unsafe { events.inner.set_len(n as usize) };
        Ok(())
    }

    fn control(&self, fd: RawFd, token: Token, interests: Interest, flags: u16) -> io::Result<()> {
        let mut changes = Vec::with_capacity(2);
        if interests.is_readable() {
            changes.push(kevent_for(fd, libc::EVFILT_READ, flags, token));
        }
        if interests.is_writable() {
            changes.push(kevent_for(fd, libc::EVFILT_WRITE, flags, token));
        }
        syscall!(kevent(
            self.kq,
            changes.as_ptr(),
            changes.len() as Count,
            std::ptr::null_mut(),
            0,
            std::ptr::null(),
        ))
        .map(|_| ())
    }

    pub fn register(&self, fd: RawFd, token: Token, interests: Interest) -> io::Result<()> {
        self.control(fd, token, interests, libc::EV_ADD | libc::EV_CLEAR)
    }

    pub fn reregister(&self, fd: RawFd, token: Token, interests: Interest) -> io::Result<()> {
        // Clear both filters unconditionally, then re-add the ones wanted;
        // kqueue has no single "modify interest set" call like epoll_ctl MOD.
        let _ = self.control(fd, token, Interest::READ | Interest::WRITE, libc::EV_DELETE);
        self.control(fd, token, interests, libc::EV_ADD | libc::EV_CLEAR)
    }

    pub fn deregister(&self, fd: RawFd) -> io::Result<()> {
        self.control(fd, Token(0), Interest::READ | Interest::WRITE, libc::EV_DELETE)
    }
}

fn kevent_for(fd: RawFd, filter: i16, flags: u16, token: Token) -> libc::kevent {
    libc::kevent {
        ident: fd as libc::uintptr_t,
        filter,
        flags,
        fflags: 0,
        data: 0,
        udata: token.0 as *mut libc::c_void,
    }
}

impl AsRawFd for Selector {
    fn as_raw_fd(&self) -> RawFd {
        self.kq
    }
}

impl Drop for Selector {
    fn drop(&mut self) {
        let _ = unsafe { libc::close(self.kq) };
    }
}

pub struct Events {
    inner: Vec<libc::kevent>,
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
    raw: libc::kevent,
}

impl Event {
    pub fn token(&self) -> Token {
        Token(self.raw.udata as usize)
    }

    pub fn is_readable(&self) -> bool {
        self.raw.filter == libc::EVFILT_READ
    }

    pub fn is_writable(&self) -> bool {
        self.raw.filter == libc::EVFILT_WRITE
    }

    pub fn is_error(&self) -> bool {
        self.raw.flags & libc::EV_ERROR != 0
    }

    pub fn is_read_closed(&self) -> bool {
        self.raw.filter == libc::EVFILT_READ && self.raw.flags & libc::EV_EOF != 0
    }

    pub fn is_write_closed(&self) -> bool {
        self.raw.filter == libc::EVFILT_WRITE && self.raw.flags & libc::EV_EOF != 0
    }
}
