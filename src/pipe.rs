//! Paired Buffer: two [`crate::buffer::ByteBuffer`]-shaped endpoints
//! connected without an OS pipe or socketpair. Delivery is deferred to the
//! reactor's next loop iteration (via a zero-duration deadline) so callers
//! observe the same asynchronous hand-off they'd see across a real fd.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::rc::{Rc, Weak};
use std::time::Duration;

use crate::buffer::{scan_eol, EolStyle};
use crate::continuation::{Continuation, Settle};
use crate::deadline::DeadlineId;
use crate::error::{Error, ErrorKind};
use crate::reactor::Reactor;

#[derive(Copy, Clone, Eq, PartialEq)]
enum Side {
    A,
    B,
}

struct Flags {
    a_closed: Cell<bool>,
    b_closed: Cell<bool>,
    error: RefCell<Option<String>>,
}

impl Flags {
    fn self_closed(&self, side: Side) -> bool {
        match side {
            Side::A => self.a_closed.get(),
            Side::B => self.b_closed.get(),
        }
    }

    fn peer_closed(&self, side: Side) -> bool {
        match side {
            Side::A => self.b_closed.get(),
            Side::B => self.a_closed.get(),
        }
    }

    fn set_self_closed(&self, side: Side) {
        match side {
            Side::A => self.a_closed.set(true),
            Side::B => self.b_closed.set(true),
        }
    }
}

/// Cap used by the no-arg [`PairedBuffer::read`]; mirrors
/// [`crate::buffer::ByteBuffer`]'s `CHUNK` constant even though a pipe has
/// no syscall-sized read to cap, so both transports expose the same shape.
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
    side: Side,
    flags: Rc<Flags>,
    /// Bytes this side has written, visible to the peer's `read_queue`.
    write_queue: Rc<RefCell<VecDeque<u8>>>,
    /// The peer's `write_queue` — what this side reads from.
    read_queue: Rc<RefCell<VecDeque<u8>>>,
    /// Bytes submitted but not yet delivered into `write_queue`; delivery
    /// (and therefore drain completion) happens on the next reactor tick.
    staged: VecDeque<u8>,
    flush_scheduled: bool,
    peer: Weak<RefCell<Inner>>,
    read_timeout: Option<Duration>,
    write_timeout: Option<Duration>,
    read_op: Option<ReadOp>,
    drain_op: Option<DrainOp>,
    wait_closed_op: Option<Settle<(), Error>>,
}

/// One end of a [`pipe`]. Shares the other end's read/write queues without
/// touching the OS; otherwise behaves like a [`crate::buffer::ByteBuffer`].
pub struct PairedBuffer {
    inner: Rc<RefCell<Inner>>,
}

impl Clone for PairedBuffer {
    fn clone(&self) -> PairedBuffer {
        PairedBuffer { inner: self.inner.clone() }
    }
}

/// Connects two [`PairedBuffer`]s so that writes on one side appear as
/// reads on the other, one reactor tick later.
pub fn pipe(reactor: &Reactor) -> (PairedBuffer, PairedBuffer) {
    let q_ab = Rc::new(RefCell::new(VecDeque::new()));
    let q_ba = Rc::new(RefCell::new(VecDeque::new()));
    let flags = Rc::new(Flags {
        a_closed: Cell::new(false),
        b_closed: Cell::new(false),
        error: RefCell::new(None),
    });

    let a = Rc::new(RefCell::new(Inner {
        reactor: reactor.clone(),
        side: Side::A,
        flags: flags.clone(),
        write_queue: q_ab.clone(),
        read_queue: q_ba.clone(),
        staged: VecDeque::new(),
        flush_scheduled: false,
        peer: Weak::new(),
        read_timeout: None,
        write_timeout: None,
        read_op: None,
        drain_op: None,
        wait_closed_op: None,
    }));
    let b = Rc::new(RefCell::new(Inner {
        reactor: reactor.clone(),
        side: Side::B,
        flags,
        write_queue: q_ba,
        read_queue: q_ab,
        staged: VecDeque::new(),
        flush_scheduled: false,
        peer: Rc::downgrade(&a),
        read_timeout: None,
        write_timeout: None,
        read_op: None,
        drain_op: None,
        wait_closed_op: None,
    }));
    a.borrow_mut().peer = Rc::downgrade(&b);

    (PairedBuffer { inner: a }, PairedBuffer { inner: b })
}

impl PairedBuffer {
    pub fn pending(&self) -> usize {
        self.inner.borrow().staged.len()
    }

    pub fn available(&self) -> usize {
        self.inner.borrow().read_queue.borrow().len()
    }

    pub fn set_timeout(&self, read: Option<Duration>, write: Option<Duration>) {
        let mut inner = self.inner.borrow_mut();
        inner.read_timeout = read;
        inner.write_timeout = write;
    }

    fn sticky_error(&self) -> Option<Error> {
        self.inner
            .borrow()
            .flags
            .error
            .borrow()
            .as_ref()
            .map(|msg| Error::new(ErrorKind::Io, msg.clone()))
    }

    fn is_closed(&self) -> bool {
        let inner = self.inner.borrow();
        inner.flags.self_closed(inner.side)
    }

    fn peer_is_closed(&self) -> bool {
        let inner = self.inner.borrow();
        inner.flags.peer_closed(inner.side)
    }

    /// Reads up to the internal chunk cap (at least 1, unless EOF/closed).
    /// The no-arg counterpart to [`Self::read_n`]; spec §4.5 lists `read()`
    /// and `read(n)` as two distinct operations rather than one with a
    /// default argument.
    pub fn read(&self) -> Continuation<Vec<u8>, Error> {
        self.start_read(ReadKind::Read { max: CHUNK })
    }

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
        if let Some(err) = self.sticky_error() {
            return Continuation::reject(err);
        }
        if self.inner.borrow().read_op.is_some() {
            return Continuation::reject(Error::busy());
        }
        if let Some(value) = try_fulfill_read(&self.inner, &kind) {
            return Continuation::resolve(value);
        }
        if self.is_closed() || self.peer_is_closed() {
            return Continuation::reject(Error::eof());
        }

        let (cont, settle) = Continuation::new_pending();
        let timeout = self.inner.borrow().read_timeout;
        let deadline = timeout.map(|d| {
            let inner = self.inner.clone();
            self.inner.borrow().reactor.schedule_deadline(d, Box::new(move || timeout_read(&inner)))
        });
        self.inner.borrow_mut().read_op = Some(ReadOp { kind, settle, deadline });
        cont
    }

    pub fn write(&self, bytes: &[u8]) -> Continuation<(), Error> {
        match self.submit(bytes) {
            Ok(()) => self.drain(),
            Err(e) => Continuation::reject(e),
        }
    }

    pub fn submit(&self, bytes: &[u8]) -> Result<(), Error> {
        if let Some(err) = self.sticky_error() {
            return Err(err);
        }
        if self.is_closed() {
            return Err(Error::eof());
        }
        {
            let mut inner = self.inner.borrow_mut();
            inner.staged.extend(bytes.iter().copied());
        }
        schedule_flush(&self.inner);
        Ok(())
    }

    pub fn write_line(&self, line: &[u8], style: EolStyle) -> Result<(), Error> {
        self.submit(line)?;
        self.submit(style.delimiter())
    }

    pub fn drain(&self) -> Continuation<(), Error> {
        if let Some(err) = self.sticky_error() {
            return Continuation::reject(err);
        }
        if self.inner.borrow().drain_op.is_some() {
            return Continuation::reject(Error::busy());
        }
        if self.is_closed() {
            return Continuation::reject(Error::eof());
        }
        if self.inner.borrow().staged.is_empty() {
            return Continuation::resolve(());
        }
        let (cont, settle) = Continuation::new_pending();
        let timeout = self.inner.borrow().write_timeout;
        let deadline = timeout.map(|d| {
            let inner = self.inner.clone();
            self.inner.borrow().reactor.schedule_deadline(d, Box::new(move || timeout_drain(&inner)))
        });
        self.inner.borrow_mut().drain_op = Some(DrainOp { settle, deadline });
        schedule_flush(&self.inner);
        cont
    }

    pub fn wait_closed(&self) -> Continuation<(), Error> {
        if self.peer_is_closed() {
            return Continuation::reject(Error::eof());
        }
        let mut inner = self.inner.borrow_mut();
        if inner.wait_closed_op.is_some() {
            return Continuation::reject(Error::busy());
        }
        let (cont, settle) = Continuation::new_pending();
        inner.wait_closed_op = Some(settle);
        cont
    }

    /// Flushes any staged writes immediately, marks this side closed, and
    /// wakes the peer so its pending read/wait_closed sees EOF right away
    /// rather than on the next tick.
    pub fn close(&self) -> Result<(), Error> {
        {
            let mut inner = self.inner.borrow_mut();
            if inner.flags.self_closed(inner.side) {
                return Err(Error::eof());
            }
            let staged: Vec<u8> = inner.staged.drain(..).collect();
            inner.write_queue.borrow_mut().extend(staged);
            inner.flags.set_self_closed(inner.side);
        }
        reject_read(&self.inner, Error::eof());
        reject_drain(&self.inner, Error::eof());
        if let Some(peer) = self.inner.borrow().peer.upgrade() {
            settle_peer(&peer);
        }
        Ok(())
    }

    /// Sets a sticky error on the pair: any outstanding or future read,
    /// write, or drain on either side rejects with it.
    pub fn throws(&self, message: impl Into<String>) {
        let message = message.into();
        *self.inner.borrow().flags.error.borrow_mut() = Some(message.clone());
        let err = || Error::new(ErrorKind::Io, message.clone());
        reject_read(&self.inner, err());
        reject_drain(&self.inner, err());
        if let Some(waiter) = self.inner.borrow_mut().wait_closed_op.take() {
            waiter.reject(err());
        }
        if let Some(peer) = self.inner.borrow().peer.upgrade() {
            reject_read(&peer, err());
            reject_drain(&peer, err());
            if let Some(waiter) = peer.borrow_mut().wait_closed_op.take() {
                waiter.reject(err());
            }
        }
    }
}

fn schedule_flush(inner: &Rc<RefCell<Inner>>) {
    let already = inner.borrow().flush_scheduled;
    if already {
        return;
    }
    inner.borrow_mut().flush_scheduled = true;
    let inner2 = inner.clone();
    let reactor = inner.borrow().reactor.clone();
    reactor.schedule_deadline(Duration::ZERO, Box::new(move || flush(&inner2)));
}

fn flush(inner: &Rc<RefCell<Inner>>) {
    {
        let mut guard = inner.borrow_mut();
        guard.flush_scheduled = false;
        let staged: Vec<u8> = guard.staged.drain(..).collect();
        guard.write_queue.borrow_mut().extend(staged);
    }
    settle_drain(inner);
    if let Some(peer) = inner.borrow().peer.upgrade() {
        settle_peer(&peer);
    }
}

fn settle_peer(inner: &Rc<RefCell<Inner>>) {
    settle_read(inner);
    settle_wait_closed(inner);
}

fn try_fulfill_read(inner: &Rc<RefCell<Inner>>, kind: &ReadKind) -> Option<Vec<u8>> {
    let guard = inner.borrow();
    let mut queue = guard.read_queue.borrow_mut();
    match *kind {
        ReadKind::Read { max } => {
            if queue.is_empty() {
                return None;
            }
            let n = max.min(queue.len());
            Some(queue.drain(..n).collect())
        }
        ReadKind::ReadExactly { n } => {
            if queue.len() < n {
                return None;
            }
            Some(queue.drain(..n).collect())
        }
        ReadKind::Peek { n } => {
            if queue.len() < n {
                return None;
            }
            Some(queue.iter().take(n).copied().collect())
        }
        ReadKind::ReadLine { style } => match scan_eol(&queue, style) {
            Some((len, delim)) => {
                let line: Vec<u8> = queue.drain(..len).collect();
                queue.drain(..delim);
                Some(line)
            }
            None => None,
        },
    }
}

fn settle_read(inner: &Rc<RefCell<Inner>>) {
    let kind_snapshot = {
        let guard = inner.borrow();
        match &guard.read_op {
            None => return,
            Some(op) => match &op.kind {
                ReadKind::Read { max } => ReadKind::Read { max: *max },
                ReadKind::ReadExactly { n } => ReadKind::ReadExactly { n: *n },
                ReadKind::Peek { n } => ReadKind::Peek { n: *n },
                ReadKind::ReadLine { style } => ReadKind::ReadLine { style: *style },
            },
        }
    };
    if let Some(bytes) = try_fulfill_read(inner, &kind_snapshot) {
        complete_read(inner, Ok(bytes));
        return;
    }
    let (closed, peer_closed) = {
        let guard = inner.borrow();
        (guard.flags.self_closed(guard.side), guard.flags.peer_closed(guard.side))
    };
    if closed || peer_closed {
        complete_read(inner, Err(Error::eof()));
    }
}

fn complete_read(inner: &Rc<RefCell<Inner>>, result: Result<Vec<u8>, Error>) {
    let op = inner.borrow_mut().read_op.take();
    if let Some(op) = op {
        if let Some(id) = op.deadline {
            inner.borrow().reactor.cancel_deadline(id);
        }
        op.settle.settle_result(result);
    }
}

fn reject_read(inner: &Rc<RefCell<Inner>>, err: Error) {
    complete_read(inner, Err(err));
}

fn timeout_read(inner: &Rc<RefCell<Inner>>) {
    if inner.borrow().read_op.is_some() {
        complete_read(inner, Err(Error::timeout()));
    }
}

fn settle_drain(inner: &Rc<RefCell<Inner>>) {
    let done = {
        let guard = inner.borrow();
        guard.drain_op.is_some() && guard.staged.is_empty()
    };
    if done {
        let op = inner.borrow_mut().drain_op.take();
        if let Some(op) = op {
            if let Some(id) = op.deadline {
                inner.borrow().reactor.cancel_deadline(id);
            }
            op.settle.fulfill(());
        }
    }
}

fn reject_drain(inner: &Rc<RefCell<Inner>>, err: Error) {
    let op = inner.borrow_mut().drain_op.take();
    if let Some(op) = op {
        if let Some(id) = op.deadline {
            inner.borrow().reactor.cancel_deadline(id);
        }
        op.settle.reject(err);
    }
}

fn timeout_drain(inner: &Rc<RefCell<Inner>>) {
    if inner.borrow().drain_op.is_some() {
        reject_drain(inner, Error::timeout());
    }
}

fn settle_wait_closed(inner: &Rc<RefCell<Inner>>) {
    let peer_closed = {
        let guard = inner.borrow();
        guard.flags.peer_closed(guard.side)
    };
    if !peer_closed {
        return;
    }
    let waiter = inner.borrow_mut().wait_closed_op.take();
    if let Some(settle) = waiter {
        settle.fulfill(());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pump(reactor: &Reactor, done: impl Fn() -> bool) {
        let start = std::time::Instant::now();
        while !done() && start.elapsed() < Duration::from_secs(2) {
            reactor.dispatch_once().expect("tick");
        }
    }

    #[test]
    fn no_arg_read_returns_whatever_is_available() {
        let reactor = Reactor::new().expect("reactor");
        let (a, b) = pipe(&reactor);
        let _ = a.write(b"ping");
        let got = Rc::new(RefCell::new(None));
        let got2 = got.clone();
        let _ = b.read().then(move |bytes| {
            *got2.borrow_mut() = Some(bytes);
            Continuation::<(), Error>::resolve(())
        });
        pump(&reactor, || got.borrow().is_some());
        assert_eq!(got.borrow().as_ref().unwrap(), b"ping");
    }

    #[test]
    fn write_is_visible_to_peer_after_next_tick() {
        let reactor = Reactor::new().expect("reactor");
        let (a, b) = pipe(&reactor);
        let _ = a.write(b"ping");
        let got = Rc::new(RefCell::new(None));
        let got2 = got.clone();
        let _ = b.read_exactly(4).then(move |bytes| {
            *got2.borrow_mut() = Some(bytes);
            Continuation::<(), Error>::resolve(())
        });
        assert!(got.borrow().is_none());
        pump(&reactor, || got.borrow().is_some());
        assert_eq!(got.borrow().as_ref().unwrap(), b"ping");
    }

    #[test]
    fn throws_rejects_pending_read_on_both_ends() {
        let reactor = Reactor::new().expect("reactor");
        let (a, b) = pipe(&reactor);
        let rejected = Rc::new(RefCell::new(None));
        let rejected2 = rejected.clone();
        let _ = b.read_n(16).then_or_else(
            move |_| Continuation::<(), Error>::resolve(()),
            move |e| {
                *rejected2.borrow_mut() = Some(e);
                Continuation::resolve(())
            },
        );
        a.throws("boom");
        assert_eq!(rejected.borrow().as_ref().unwrap().kind(), ErrorKind::Io);
    }

    #[test]
    fn closing_one_end_delivers_eof_to_the_other() {
        let reactor = Reactor::new().expect("reactor");
        let (a, b) = pipe(&reactor);
        let closed = Rc::new(Cell::new(false));
        let closed2 = closed.clone();
        let _ = b.wait_closed().then(move |_| {
            closed2.set(true);
            Continuation::<(), Error>::resolve(())
        });
        a.close().expect("close a");
        assert!(closed.get());
    }
}
