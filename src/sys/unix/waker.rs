//! Cross-thread wakeup primitive backing [`crate::reactor::Reactor::post`].
//!
//! Linux/Android get an `eventfd(2)`; everything else (the BSDs, macOS) gets
//! a self-pipe, matching the teacher's `sys::unix::waker::{eventfd,pipe}`
//! split.

use std::io;
use std::os::unix::io::{AsRawFd, RawFd};

use crate::interest::Interest;
use crate::sys::unix::syscall;
use crate::sys::unix::Selector;
use crate::token::Token;

#[derive(Debug)]
pub struct Waker {
    #[cfg(any(target_os = "linux", target_os = "android"))]
    fd: RawFd,
    #[cfg(not(any(target_os = "linux", target_os = "android")))]
    reader: RawFd,
    #[cfg(not(any(target_os = "linux", target_os = "android")))]
    writer: RawFd,
}

#[cfg(any(target_os = "linux", target_os = "android"))]
impl Waker {
    pub fn new(selector: &Selector, token: Token) -> io::Result<Waker> {
        let fd = syscall!(eventfd(0, libc::EFD_CLOEXEC | libc::EFD_NONBLOCK))?;
        selector.register(fd, token, Interest::READ)?;
        Ok(Waker { fd })
    }

    pub fn wake(&self) -> io::Result<()> {
        let buf: u64 = 1;
        let res = unsafe {
            libc::write(
                self.fd,
                &buf as *const u64 as *const libc::c_void,
                std::mem::size_of::<u64>(),
            )
        };
        if res == -1 {
            let err = io::Error::last_os_error();
            // A full eventfd counter (EAGAIN) means a wakeup is already
            // pending; that's equivalent to this wake succeeding.
            if err.kind() == io::ErrorKind::WouldBlock {
                return Ok(());
            }
            return Err(err);
        }
        Ok(())
    }

    pub fn ack(&self) {
        let mut buf: u64 = 0;
        let _ = unsafe {
            libc::read(
                self.fd,
                &mut buf as *mut u64 as *mut libc::c_void,
                std::mem::size_of::<u64>(),
            )
        };
    }
}

#[cfg(any(target_os = "linux", target_os = "android"))]
impl Drop for Waker {
    fn drop(&mut self) {
        let _ = unsafe { libc::close(self.fd) };
    }
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
impl Waker {
    pub fn new(selector: &Selector, token: Token) -> io::Result<Waker> {
        let mut fds = [0; 2];
        syscall!(pipe(fds.as_mut_ptr()))?;
        let (reader, writer) = (fds[0], fds[1]);
        for fd in [reader, writer] {
            let flags = syscall!(fcntl(fd, libc::F_GETFL))?;
            syscall!(fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK))?;
        }
        selector.register(reader, token, Interest::READ)?;
        Ok(Waker { reader, writer })
    }

    pub fn wake(&self) -> io::Result<()> {
        let buf: [u8; 1] = [1];
        let res = unsafe {
            libc::write(self.writer, buf.as_ptr() as *const libc::c_void, 1)
        };
        if res == -1 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::WouldBlock {
                return Ok(());
            }
            return Err(err);
        }
        Ok(())
    }

    pub fn ack(&self) {
        let mut buf = [0u8; 64];
        loop {
            let n = unsafe {
                libc::read(self.reader, buf.as_mut_ptr() as *mut libc::c_void, buf.len())
            };
            if n <= 0 {
                break;
            }
        }
    }
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
impl Drop for Waker {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.reader);
            libc::close(self.writer);
        }
    }
}

impl AsRawFd for Waker {
    fn as_raw_fd(&self) -> RawFd {
        #[cfg(any(target_os = "linux", target_os = "android"))]
        {
            self.fd
        }
        #[cfg(not(any(target_os = "linux", target_os = "android")))]
        {
            self.reader
        }
    }
}
