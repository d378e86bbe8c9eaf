//! Unix selector backends: `epoll` on Linux/Android, `kqueue` on the BSDs
//! and macOS. Exactly one of the two is compiled in.

#[cfg(any(target_os = "linux", target_os = "android"))]
#[path = "epoll.rs"]
mod selector;

#[cfg(any(
    target_os = "macos",
    target_os = "ios",
    target_os = "freebsd",
    target_os = "dragonfly",
    target_os = "netbsd",
    target_os = "openbsd"
))]
#[path = "kqueue.rs"]
mod selector;

mod waker;

pub use selector::{Event, Events, Selector};
pub use waker::Waker;

use std::io;
use std::os::fd::{FromRawFd, OwnedFd};

macro_rules! syscall {
    ($fn:ident ( $($arg:expr),* $(,)* ) ) => {{
        #[allow(unused_unsafe)]
        let res = unsafe { libc::$fn($($arg, )*) };
        if res == -1 {
            Err(std::io::Error::last_os_error())
        } else {
            Ok(res)
        }
    }};
}

pub(crate) use syscall;

/// A non-blocking pipe, used by [`crate::signal::Signal`]'s self-pipe trick
/// and by test helpers that need a pollable fd without a real socket.
pub fn self_pipe() -> io::Result<(OwnedFd, OwnedFd)> {
    let mut fds = [0; 2];
    syscall!(pipe(fds.as_mut_ptr()))?;
    for fd in fds {
        let flags = syscall!(fcntl(fd, libc::F_GETFL))?;
        syscall!(fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK))?;
    }
    // SAFETY: `pipe(2)` just handed back two freshly owned, valid fds.
    unsafe { Ok((OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1]))) }
}
