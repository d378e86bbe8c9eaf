//! Byte Buffer: a non-blocking duplex fd wrapped in a small state machine
//! with three operation cells (read, drain, wait-closed), each holding at
//! most one outstanding continuation. Built on a single persistent
//! [`ReadinessEvent`] subscription rather than repeated one-shot `on()`
//! calls, since read- and write-side waiters need to be armed
//! simultaneously and `ReadinessEvent` only ever has one pending
//! subscription at a time.

mod eol;

pub use eol::EolStyle;
pub(crate) use eol::scan as scan_eol;

use std::cell::RefCell;
use std::collections::VecDeque;
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::rc::{Rc, Weak};
use std::time::Duration;

use crate::continuation::{Continuation, Settle};
use crate::deadline::DeadlineId;
use crate::error::Error;
use crate::interest::Interest;
use crate::reactor::Reactor;
use crate::readiness::ReadinessEvent;

/// Input queue stays below this many buffered bytes before READ interest is
/// disabled; re-enabled as soon as a new read request arrives.
const INPUT_CAP: usize = 1024 * 1024;
const CHUNK: usize = 64 * 1024;

enum ReadKind {
    Read { max: usize },
    ReadExactly { n: usize },
    Peek { n: usize },
    ReadLine { style: EolStyle },
}

struct ReadOp {
    kind: ReadKind,
    settle: Settle<Vec<u8>, Error>,
    deadline: Option<DeadlineId>,
}

struct DrainOp {
    settle: Settle<(), Error>,
    deadline: Option<DeadlineId>,
}

struct Inner {
    reactor: Reactor,
    fd: Option<OwnedFd>,
    event: ReadinessEvent,
    input: VecDeque<u8>,
    output: VecDeque<u8>,
    eof: bool,
    io_error: Option<Error>,
    closed: bool,
    read_disabled: bool,
    read_timeout: Option<Duration>,
    write_timeout: Option<Duration>,
    read_op: Option<ReadOp>,
    drain_op: Option<DrainOp>,
    wait_closed_op: Option<Settle<(), Error>>,
}

/// A duplex, non-blocking byte stream: the universal transport under
/// sockets, pipes, and anything layered on top (TLS, HTTP, WebSocket).
pub struct ByteBuffer {
    inner: Rc<RefCell<Inner>>,
}

impl Clone for ByteBuffer {
    fn clone(&self) -> ByteBuffer {
        ByteBuffer {
            inner: self.inner.clone(),
        }
    }
}

impl ByteBuffer {
    /// Takes ownership of `fd` (closed on drop unless already consumed by
    /// `close()`), registers it with the reactor, and arms a persistent
    /// subscription that never settles on its own.
    pub fn from_raw_fd(reactor: &Reactor, fd: RawFd) -> Result<ByteBuffer, Error> {
        let event = ReadinessEvent::new(reactor, fd)?;
        let inner = Rc::new(RefCell::new(Inner {
            reactor: reactor.clone(),
            fd: Some(unsafe { OwnedFd::from_raw_fd(fd) }),
            event,
            input: VecDeque::new(),
            output: VecDeque::new(),
            eof: false,
            io_error: None,
            closed: false,
            read_disabled: false,
            read_timeout: None,
            write_timeout: None,
            read_op: None,
            drain_op: None,
            wait_closed_op: None,
        }));
        let buffer = ByteBuffer { inner };
        buffer.arm();
        Ok(buffer)
    }

    /// Arms the persistent subscription with a weak back-reference so the
    /// predicate closure (owned, through the reactor's source slab, by the
    /// readiness event) never keeps this buffer's state alive on its own.
    fn arm(&self) {
        let event = self.inner.borrow().event.clone();
        let weak: Weak<RefCell<Inner>> = Rc::downgrade(&self.inner);
        event.on_persist(
            Interest::READ | Interest::WRITE,
            move |bits| match weak.upgrade() {
                Some(inner) => ByteBuffer { inner }.handle_ready(bits),
                None => false,
            },
            None,
        );
    }

    pub fn fd(&self) -> RawFd {
        self.inner.borrow().event.fd()
    }

    /// Bytes buffered for the peer that have not yet drained onto the wire.
    pub fn pending(&self) -> usize {
        self.inner.borrow().output.len()
    }

    /// Bytes read from the wire that have not yet been consumed by a read
    /// call.
    pub fn available(&self) -> usize {
        self.inner.borrow().input.len()
    }

    pub fn set_timeout(&self, read: Option<Duration>, write: Option<Duration>) {
        let mut inner = self.inner.borrow_mut();
        inner.read_timeout = read;
        inner.write_timeout = write;
    }

    fn handle_ready(&self, bits: Interest) -> bool {
        let mut inner = self.inner.borrow_mut();
        if inner.closed {
            return false;
        }
        if bits.is_readable() || bits.is_closed() {
            pump_read(&mut inner);
        }
        if bits.is_writable() || bits.is_closed() {
            pump_write(&mut inner);
        }
        drop(inner);
        self.settle_read();
        self.settle_drain();
        self.settle_wait_closed();
        true
    }

    /// Reads up to the internal chunk cap (at least 1, unless EOF/closed).
    /// The no-arg counterpart to [`Self::read_n`]; spec §4.5 lists `read()`
    /// and `read(n)` as two distinct operations rather than one with a
    /// default argument.
    pub fn read(&self) -> Continuation<Vec<u8>, Error> {
        self.start_read(ReadKind::Read { max: CHUNK })
    }

    /// Reads up to `max` bytes (at least 1, unless EOF/closed).
    pub fn read_n(&self, max: usize) -> Continuation<Vec<u8>, Error> {
        self.start_read(ReadKind::Read { max })
    }

    pub fn read_exactly(&self, n: usize) -> Continuation<Vec<u8>, Error> {
        self.start_read(ReadKind::ReadExactly { n })
    }

    pub fn peek(&self, n: usize) -> Continuation<Vec<u8>, Error> {
        self.start_read(ReadKind::Peek { n })
    }

    pub fn read_line(&self, style: EolStyle) -> Continuation<Vec<u8>, Error> {
        self.start_read(ReadKind::ReadLine { style })
    }

    fn start_read(&self, kind: ReadKind) -> Continuation<Vec<u8>, Error> {
        {
            let inner = self.inner.borrow();
            if inner.read_op.is_some() {
                return Continuation::reject(Error::busy());
            }
            if let Some(err) = inner.io_error.clone() {
                return Continuation::reject(err);
            }
            if inner.closed {
                return Continuation::reject(Error::eof());
            }
        }
        // Re-enable read interest and opportunistically pump before
        // checking whether the request is already satisfied.
        self.reenable_read_if_needed();
        {
            let mut inner = self.inner.borrow_mut();
            pump_read(&mut inner);
        }
        if let Some(value) = self.try_fulfill_read(&kind) {
            return Continuation::resolve(value);
        }
        {
            let inner = self.inner.borrow();
            if inner.eof || inner.closed {
                return Continuation::reject(Error::eof());
            }
            if let Some(err) = inner.io_error.clone() {
                return Continuation::reject(err);
            }
        }

        let (cont, settle) = Continuation::new_pending();
        let timeout = self.inner.borrow().read_timeout;
        let deadline = timeout.map(|d| {
            let this = self.clone();
            self.inner.borrow().reactor.schedule_deadline(d, Box::new(move || this.timeout_read()))
        });
        self.inner.borrow_mut().read_op = Some(ReadOp { kind, settle, deadline });
        cont
    }

    fn reenable_read_if_needed(&self) {
        let was_disabled = {
            let mut inner = self.inner.borrow_mut();
            let was = inner.read_disabled;
            inner.read_disabled = false;
            was
        };
        if was_disabled {
            let _ = self.inner.borrow().event.set_interest(Interest::READ | Interest::WRITE);
        }
    }

    fn try_fulfill_read(&self, kind: &ReadKind) -> Option<Vec<u8>> {
        let mut inner = self.inner.borrow_mut();
        match *kind {
            ReadKind::Read { max } => {
                if inner.input.is_empty() {
                    return None;
                }
                let n = max.min(inner.input.len());
                Some(inner.input.drain(..n).collect())
            }
            ReadKind::ReadExactly { n } => {
                if inner.input.len() < n {
                    return None;
                }
                Some(inner.input.drain(..n).collect())
            }
            ReadKind::Peek { n } => {
                if inner.input.len() < n {
                    return None;
                }
                Some(inner.input.iter().take(n).copied().collect())
            }
            ReadKind::ReadLine { style } => {
                let found = eol::scan(&inner.input, style);
                match found {
                    Some((len, delim)) => {
                        let line: Vec<u8> = inner.input.drain(..len).collect();
                        inner.input.drain(..delim);
                        Some(line)
                    }
                    None => None,
                }
            }
        }
    }

    fn settle_read(&self) {
        let value = self.try_fulfill_read_pending();
        match value {
            Some(Ok(bytes)) => self.complete_read(Ok(bytes)),
            Some(Err(e)) => self.complete_read(Err(e)),
            None => self.apply_backpressure(),
        }
    }

    fn try_fulfill_read_pending(&self) -> Option<Result<Vec<u8>, Error>> {
        let kind_snapshot = {
            let inner = self.inner.borrow();
            match &inner.read_op {
                None => return None,
                Some(op) => match &op.kind {
                    ReadKind::Read { max } => ReadKind::Read { max: *max },
                    ReadKind::ReadExactly { n } => ReadKind::ReadExactly { n: *n },
                    ReadKind::Peek { n } => ReadKind::Peek { n: *n },
                    ReadKind::ReadLine { style } => ReadKind::ReadLine { style: *style },
                },
            }
        };
        if let Some(bytes) = self.try_fulfill_read(&kind_snapshot) {
            return Some(Ok(bytes));
        }
        let inner = self.inner.borrow();
        if let Some(err) = inner.io_error.clone() {
            return Some(Err(err));
        }
        if inner.eof {
            return Some(Err(Error::eof()));
        }
        None
    }

    fn complete_read(&self, result: Result<Vec<u8>, Error>) {
        let op = self.inner.borrow_mut().read_op.take();
        if let Some(op) = op {
            if let Some(id) = op.deadline {
                self.inner.borrow().reactor.cancel_deadline(id);
            }
            op.settle.settle_result(result);
        }
    }

    fn timeout_read(&self) {
        let had_op = self.inner.borrow().read_op.is_some();
        if had_op {
            self.complete_read(Err(Error::timeout()));
        }
    }

    fn apply_backpressure(&self) {
        let mut inner = self.inner.borrow_mut();
        if inner.read_op.is_none() && !inner.read_disabled && inner.input.len() >= INPUT_CAP {
            inner.read_disabled = true;
            drop(inner);
            let _ = self.inner.borrow().event.set_interest(Interest::WRITE);
        }
    }

    /// Enqueues `bytes` for writing and returns once the whole output queue
    /// (including any previously queued bytes) has drained.
    pub fn write(&self, bytes: &[u8]) -> Continuation<(), Error> {
        match self.submit(bytes) {
            Ok(()) => self.drain(),
            Err(e) => Continuation::reject(e),
        }
    }

    /// Enqueues `bytes` without waiting for delivery.
    pub fn submit(&self, bytes: &[u8]) -> Result<(), Error> {
        {
            let inner = self.inner.borrow();
            if inner.closed {
                return Err(Error::eof());
            }
        }
        {
            let mut inner = self.inner.borrow_mut();
            inner.output.extend(bytes.iter().copied());
        }
        self.pump_write_and_settle();
        Ok(())
    }

    pub fn write_line(&self, line: &[u8], style: EolStyle) -> Result<(), Error> {
        self.submit(line)?;
        self.submit(style.delimiter())
    }

    fn pump_write_and_settle(&self) {
        {
            let mut inner = self.inner.borrow_mut();
            pump_write(&mut inner);
        }
        self.settle_drain();
    }

    pub fn drain(&self) -> Continuation<(), Error> {
        {
            let inner = self.inner.borrow();
            if inner.drain_op.is_some() {
                return Continuation::reject(Error::busy());
            }
            if let Some(err) = inner.io_error.clone() {
                return Continuation::reject(err);
            }
            if inner.closed {
                return Continuation::reject(Error::eof());
            }
            if inner.output.is_empty() {
                return Continuation::resolve(());
            }
        }
        let (cont, settle) = Continuation::new_pending();
        let timeout = self.inner.borrow().write_timeout;
        let deadline = timeout.map(|d| {
            let this = self.clone();
            self.inner.borrow().reactor.schedule_deadline(d, Box::new(move || this.timeout_drain()))
        });
        self.inner.borrow_mut().drain_op = Some(DrainOp { settle, deadline });
        cont
    }

    fn settle_drain(&self) {
        let done = {
            let inner = self.inner.borrow();
            if inner.drain_op.is_none() {
                return;
            }
            if let Some(err) = inner.io_error.clone() {
                Some(Err(err))
            } else if inner.eof {
                Some(Err(Error::eof()))
            } else if inner.output.is_empty() {
                Some(Ok(()))
            } else {
                None
            }
        };
        if let Some(result) = done {
            let op = self.inner.borrow_mut().drain_op.take();
            if let Some(op) = op {
                if let Some(id) = op.deadline {
                    self.inner.borrow().reactor.cancel_deadline(id);
                }
                op.settle.settle_result(result);
            }
        }
    }

    fn timeout_drain(&self) {
        let had_op = self.inner.borrow().drain_op.is_some();
        if had_op {
            let op = self.inner.borrow_mut().drain_op.take();
            if let Some(op) = op {
                op.settle.reject(Error::timeout());
            }
        }
    }

    pub fn wait_closed(&self) -> Continuation<(), Error> {
        let mut inner = self.inner.borrow_mut();
        if inner.wait_closed_op.is_some() {
            return Continuation::reject(Error::busy());
        }
        if inner.closed {
            return Continuation::reject(Error::eof());
        }
        let (cont, settle) = Continuation::new_pending();
        inner.wait_closed_op = Some(settle);
        cont
    }

    fn settle_wait_closed(&self) {
        let (fulfill, reject) = {
            let inner = self.inner.borrow();
            if inner.wait_closed_op.is_none() {
                return;
            }
            if inner.eof {
                (true, None)
            } else if let Some(err) = inner.io_error.clone() {
                (false, Some(err))
            } else {
                return;
            }
        };
        let op = self.inner.borrow_mut().wait_closed_op.take();
        if let Some(settle) = op {
            if fulfill {
                settle.fulfill(());
            } else if let Some(err) = reject {
                settle.reject(err);
            }
        }
    }

    /// Rejects outstanding read/drain with EOF, resolves an outstanding
    /// `wait_closed`, and releases the fd. A second call returns EOF rather
    /// than panicking on an already-released resource.
    pub fn close(&self) -> Result<(), Error> {
        let fd = {
            let mut inner = self.inner.borrow_mut();
            if inner.closed {
                return Err(Error::eof());
            }
            inner.closed = true;
            inner.fd.take()
        };
        self.inner.borrow().event.cancel();
        self.complete_read(Err(Error::eof()));
        let op = self.inner.borrow_mut().drain_op.take();
        if let Some(op) = op {
            if let Some(id) = op.deadline {
                self.inner.borrow().reactor.cancel_deadline(id);
            }
            op.settle.reject(Error::eof());
        }
        let waiter = self.inner.borrow_mut().wait_closed_op.take();
        if let Some(settle) = waiter {
            settle.fulfill(());
        }
        drop(fd); // closes the OS fd
        Ok(())
    }
}

fn pump_read(inner: &mut Inner) {
    if inner.eof || inner.io_error.is_some() || inner.read_op.is_none() && inner.read_disabled {
        return;
    }
    let fd = match &inner.fd {
        Some(fd) => fd.as_raw_fd(),
        None => return,
    };
    let mut buf = [0u8; CHUNK];
    loop {
        if inner.input.len() >= INPUT_CAP && inner.read_op.is_none() {
            break;
        }
        match raw_read(fd, &mut buf) {
            Ok(0) => {
                inner.eof = true;
                break;
            }
            Ok(n) => inner.input.extend(&buf[..n]),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
            Err(e) => {
                inner.io_error = Some(e.into());
                break;
            }
        }
    }
}

fn pump_write(inner: &mut Inner) {
    if inner.io_error.is_some() {
        return;
    }
    let fd = match &inner.fd {
        Some(fd) => fd.as_raw_fd(),
        None => return,
    };
    while let Some(chunk_len) = Some(inner.output.len().min(CHUNK)).filter(|&n| n > 0) {
        let chunk: Vec<u8> = inner.output.iter().take(chunk_len).copied().collect();
        match raw_write(fd, &chunk) {
            Ok(0) => break,
            Ok(n) => {
                inner.output.drain(..n);
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
            Err(e) => {
                inner.io_error = Some(e.into());
                break;
            }
        }
    }
}

fn raw_read(fd: RawFd, buf: &mut [u8]) -> io::Result<usize> {
    loop {
        let n = unsafe { libc::read(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
        if n >= 0 {
            return Ok(n as usize);
        }
        let err = io::Error::last_os_error();
        if err.kind() == io::ErrorKind::Interrupted {
            continue;
        }
        return Err(err);
    }
}

fn raw_write(fd: RawFd, buf: &[u8]) -> io::Result<usize> {
    loop {
        let n = unsafe { libc::write(fd, buf.as_ptr() as *const libc::c_void, buf.len()) };
        if n >= 0 {
            return Ok(n as usize);
        }
        let err = io::Error::last_os_error();
        if err.kind() == io::ErrorKind::Interrupted {
            continue;
        }
        return Err(err);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pair(reactor: &Reactor) -> (ByteBuffer, ByteBuffer) {
        let mut fds = [0i32; 2];
        let rc = unsafe { libc::socketpair(libc::AF_UNIX, libc::SOCK_STREAM | libc::SOCK_NONBLOCK, 0, fds.as_mut_ptr()) };
        assert_eq!(rc, 0);
        let a = ByteBuffer::from_raw_fd(reactor, fds[0]).expect("wrap a");
        let b = ByteBuffer::from_raw_fd(reactor, fds[1]).expect("wrap b");
        (a, b)
    }

    fn pump(reactor: &Reactor, done: impl Fn() -> bool) {
        let start = std::time::Instant::now();
        while !done() && start.elapsed() < Duration::from_secs(2) {
            reactor.dispatch_once().expect("tick");
        }
    }

    #[test]
    fn write_then_read_round_trips_bytes() {
        let reactor = Reactor::new().expect("reactor");
        let (a, b) = pair(&reactor);
        let _ = a.write(b"hello world");
        let received = Rc::new(RefCell::new(None));
        let received2 = received.clone();
        let _ = b.read_exactly(11).then(move |bytes| {
            *received2.borrow_mut() = Some(bytes);
            Continuation::<(), Error>::resolve(())
        });
        pump(&reactor, || received.borrow().is_some());
        assert_eq!(received.borrow().as_ref().unwrap(), b"hello world");
    }

    #[test]
    fn no_arg_read_returns_whatever_is_available_up_to_the_chunk_cap() {
        let reactor = Reactor::new().expect("reactor");
        let (a, b) = pair(&reactor);
        let _ = a.write(b"hi");
        let received = Rc::new(RefCell::new(None));
        let received2 = received.clone();
        let _ = b.read().then(move |bytes| {
            *received2.borrow_mut() = Some(bytes);
            Continuation::<(), Error>::resolve(())
        });
        pump(&reactor, || received.borrow().is_some());
        assert_eq!(received.borrow().as_ref().unwrap(), b"hi");
    }

    #[test]
    fn read_line_strips_delimiter() {
        let reactor = Reactor::new().expect("reactor");
        let (a, b) = pair(&reactor);
        let _ = a.write(b"first line\nsecond");
        let line = Rc::new(RefCell::new(None));
        let line2 = line.clone();
        let _ = b.read_line(EolStyle::Lf).then(move |bytes| {
            *line2.borrow_mut() = Some(bytes);
            Continuation::<(), Error>::resolve(())
        });
        pump(&reactor, || line.borrow().is_some());
        assert_eq!(line.borrow().as_ref().unwrap(), b"first line");
    }

    #[test]
    fn close_rejects_outstanding_read_with_eof() {
        let reactor = Reactor::new().expect("reactor");
        let (a, _b) = pair(&reactor);
        let rejected = Rc::new(RefCell::new(None));
        let rejected2 = rejected.clone();
        let _ = a.read_n(1024).then_or_else(
            move |_| Continuation::<(), Error>::resolve(()),
            move |e| {
                *rejected2.borrow_mut() = Some(e);
                Continuation::resolve(())
            },
        );
        a.close().expect("close");
        pump(&reactor, || rejected.borrow().is_some());
        assert_eq!(rejected.borrow().as_ref().unwrap().kind(), crate::error::ErrorKind::Eof);
    }

    #[test]
    fn second_close_returns_eof() {
        let reactor = Reactor::new().expect("reactor");
        let (a, _b) = pair(&reactor);
        a.close().expect("first close");
        assert_eq!(a.close().unwrap_err().kind(), crate::error::ErrorKind::Eof);
    }

    #[test]
    fn peer_eof_settles_wait_closed() {
        let reactor = Reactor::new().expect("reactor");
        let (a, b) = pair(&reactor);
        let closed = Rc::new(std::cell::Cell::new(false));
        let closed2 = closed.clone();
        let _ = b.wait_closed().then(move |_| {
            closed2.set(true);
            Continuation::<(), Error>::resolve(())
        });
        a.close().expect("close a");
        pump(&reactor, || closed.get());
        assert!(closed.get());
    }
}
