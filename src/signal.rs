//! Signal-driven continuations (spec §4.4), self-pipe trick: a
//! process-global table maps signal number to the write end of a pipe; the
//! `extern "C"` handler (async-signal-safe: one `write(2)` of a single
//! byte, nothing else) wakes the reactor through the read end registered as
//! an ordinary [`ReadinessEvent`].

use std::io::Read;
use std::os::fd::{AsRawFd, OwnedFd};
use std::sync::atomic::{AtomicI32, Ordering};
use std::time::Duration;

use crate::continuation::Continuation;
use crate::error::Error;
use crate::readiness::ReadinessEvent;
use crate::reactor::Reactor;
use crate::interest::Interest;

const MAX_SIGNUM: usize = 64;
static WRITERS: [AtomicI32; MAX_SIGNUM] = {
    const INIT: AtomicI32 = AtomicI32::new(-1);
    [INIT; MAX_SIGNUM]
};

extern "C" fn handler(signum: libc::c_int) {
    let idx = signum as usize;
    if idx >= MAX_SIGNUM {
        return;
    }
    let fd = WRITERS[idx].load(Ordering::Relaxed);
    if fd >= 0 {
        let byte: u8 = 1;
        unsafe {
            libc::write(fd, &byte as *const u8 as *const libc::c_void, 1);
        }
    }
}

/// Settles when `signum` is next delivered to the process. Only one
/// `Signal` per signal number should be live at a time: installing a second
/// silently replaces the first's handler registration (matches the
/// single-pending-subscription discipline the rest of the crate uses,
/// applied at the OS level rather than per-instance).
pub struct Signal {
    signum: libc::c_int,
    reader: OwnedFd,
    _writer: OwnedFd,
    event: ReadinessEvent,
    previous: libc::sigaction,
}

impl Signal {
    pub fn new(reactor: &Reactor, signum: libc::c_int) -> Result<Signal, Error> {
        let (reader, writer) = crate::sys::self_pipe()?;
        let idx = signum as usize;
        if idx >= MAX_SIGNUM {
            return Err(Error::invalid_argument(format!("signal number {signum} out of range")));
        }
        WRITERS[idx].store(writer.as_raw_fd(), Ordering::Relaxed);

        let mut previous: libc::sigaction = unsafe { std::mem::zeroed() };
        let mut action: libc::sigaction = unsafe { std::mem::zeroed() };
        action.sa_sigaction = handler as usize;
        action.sa_flags = libc::SA_RESTART;
        unsafe {
            libc::sigemptyset(&mut action.sa_mask);
            if libc::sigaction(signum, &action, &mut previous) != 0 {
                return Err(std::io::Error::last_os_error().into());
            }
        }

        let event = ReadinessEvent::new(reactor, reader.as_raw_fd())?;
        Ok(Signal {
            signum,
            reader,
            _writer: writer,
            event,
            previous,
        })
    }

    pub fn pending(&self) -> bool {
        self.event.pending()
    }

    /// Settles once the signal is next delivered.
    pub fn on(&self) -> Continuation<(), Error> {
        self.drain();
        self.event.on(Interest::READ, None).then(|_| Continuation::resolve(()))
    }

    /// Re-arms while `predicate()` returns true.
    pub fn on_persist<F>(&self, mut predicate: F) -> Continuation<(), Error>
    where
        F: FnMut() -> bool + 'static,
    {
        self.drain();
        self.event.on_persist(Interest::READ, move |_bits| predicate(), None)
    }

    pub fn cancel(&self) {
        self.event.cancel();
    }

    fn drain(&self) {
        let mut buf = [0u8; 64];
        let mut reader = &self.reader;
        while reader.read(&mut buf).map(|n| n > 0).unwrap_or(false) {}
    }
}

impl Drop for Signal {
    fn drop(&mut self) {
        let idx = self.signum as usize;
        if idx < MAX_SIGNUM {
            WRITERS[idx].store(-1, Ordering::Relaxed);
        }
        unsafe {
            libc::sigaction(self.signum, &self.previous, std::ptr::null_mut());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::rc::Rc;

    #[test]
    fn signal_settles_once_delivered() {
        let reactor = Reactor::new().expect("reactor");
        let signal = Signal::new(&reactor, libc::SIGUSR1).expect("install handler");
        let fired = Rc::new(Cell::new(false));
        let fired2 = fired.clone();
        let _ = signal.on().then(move |_| {
            fired2.set(true);
            Continuation::<(), Error>::resolve(())
        });

        unsafe {
            libc::raise(libc::SIGUSR1);
        }

        let start = std::time::Instant::now();
        while !fired.get() && start.elapsed() < Duration::from_secs(1) {
            reactor.dispatch_once().expect("tick");
        }
        assert!(fired.get());
    }
}
