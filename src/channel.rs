//! Cross-context channel (spec §4.10): a bounded MPMC queue that is one of
//! the three primitives safe to touch from a thread other than the one
//! running the [`Reactor`], alongside [`Reactor::post`] and
//! [`Reactor::loop_break`].
//!
//! The fast paths (`try_send`/`try_receive`) are lock-free: the ring itself
//! is the bounded MPMC array queue described by Dmitry Vyukov, the same
//! algorithm `crossbeam::ArrayQueue` is built on, reimplemented here by hand
//! since nothing in this crate's dependency stack already provides it. The
//! slow paths (blocked sender, blocked receiver) take a mutex only long
//! enough to enroll or drain a waiter list; waking a waiter never happens
//! while holding it.
//!
//! A loop-side waiter is woken by posting a task to the reactor that invokes
//! a previously [`Reactor::register_completion`]-ed retry closure (the same
//! mechanism [`crate::worker::Worker`] uses to bridge a result back onto the
//! loop thread). A thread-side waiter parks on a plain [`Condvar`]. Both
//! kinds of waiter are consumed from the channel's own waiter lists before
//! being dispatched, so nothing is ever woken twice for the same event.

use std::cell::Cell;
use std::error;
use std::fmt;
use std::mem::MaybeUninit;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use crate::continuation::Continuation;
use crate::continuation::Settle;
use crate::deadline::DeadlineId;
use crate::error::Error;
use crate::reactor::{Reactor, ReactorHandle};
use crate::token::Token;

struct Slot<T> {
    sequence: AtomicUsize,
    value: std::cell::UnsafeCell<MaybeUninit<T>>,
}

/// Fixed-capacity MPMC ring, the Vyukov bounded queue algorithm. Every slot
/// carries its own sequence number so producers and consumers never need to
/// agree on a single head/tail pair under a lock.
struct Ring<T> {
    buffer: Box<[Slot<T>]>,
    capacity: usize,
    enqueue_pos: AtomicUsize,
    dequeue_pos: AtomicUsize,
}

unsafe impl<T: Send> Sync for Ring<T> {}

impl<T> Ring<T> {
    fn with_capacity(capacity: usize) -> Ring<T> {
        assert!(capacity > 0, "channel capacity must be at least 1");
        let buffer: Vec<Slot<T>> = (0..capacity)
            .map(|i| Slot {
                sequence: AtomicUsize::new(i),
                value: std::cell::UnsafeCell::new(MaybeUninit::uninit()),
            })
            .collect();
        Ring {
            buffer: buffer.into_boxed_slice(),
            capacity,
            enqueue_pos: AtomicUsize::new(0),
            dequeue_pos: AtomicUsize::new(0),
        }
    }

    fn try_push(&self, value: T) -> Result<(), T> {
        let mut pos = self.enqueue_pos.load(Ordering::Relaxed);
        loop {
            let slot = &self.buffer[pos % self.capacity];
            let seq = slot.sequence.load(Ordering::Acquire);
            let diff = seq as isize - pos as isize;
            if diff == 0 {
                if self
                    .enqueue_pos
                    .compare_exchange_weak(pos, pos + 1, Ordering::Relaxed, Ordering::Relaxed)
                    .is_ok()
                {
                    unsafe { (*slot.value.get()).write(value) };
                    slot.sequence.store(pos + 1, Ordering::Release);
                    return Ok(());
                }
                pos = self.enqueue_pos.load(Ordering::Relaxed);
            } else if diff < 0 {
                return Err(value);
            } else {
                pos = self.enqueue_pos.load(Ordering::Relaxed);
            }
        }
    }

    fn try_pop(&self) -> Option<T> {
        let mut pos = self.dequeue_pos.load(Ordering::Relaxed);
        loop {
            let slot = &self.buffer[pos % self.capacity];
            let seq = slot.sequence.load(Ordering::Acquire);
            let diff = seq as isize - (pos as isize + 1);
            if diff == 0 {
                if self
                    .dequeue_pos
                    .compare_exchange_weak(pos, pos + 1, Ordering::Relaxed, Ordering::Relaxed)
                    .is_ok()
                {
                    let value = unsafe { (*slot.value.get()).assume_init_read() };
                    slot.sequence.store(pos + self.capacity, Ordering::Release);
                    return Some(value);
                }
                pos = self.dequeue_pos.load(Ordering::Relaxed);
            } else if diff < 0 {
                return None;
            } else {
                pos = self.dequeue_pos.load(Ordering::Relaxed);
            }
        }
    }
}

impl<T> Drop for Ring<T> {
    fn drop(&mut self) {
        while self.try_pop().is_some() {}
    }
}

/// A oneshot thread-park primitive for blocking waiters. Plain mutex plus
/// condvar; no attempt at anything fancier, since a channel wakeup is
/// already the slow path.
struct Latch {
    signaled: Mutex<bool>,
    cv: Condvar,
}

impl Latch {
    fn new() -> Latch {
        Latch {
            signaled: Mutex::new(false),
            cv: Condvar::new(),
        }
    }

    fn signal(&self) {
        let mut signaled = self.signaled.lock().unwrap();
        *signaled = true;
        self.cv.notify_one();
    }

    /// Returns `true` if signaled before `timeout` elapsed (or if `timeout`
    /// is `None`, blocks until signaled).
    fn wait(&self, timeout: Option<Duration>) -> bool {
        let signaled = self.signaled.lock().unwrap();
        match timeout {
            None => *self.cv.wait_while(signaled, |s| !*s).unwrap(),
            Some(d) => *self.cv.wait_timeout_while(signaled, d, |s| !*s).unwrap().0,
        }
    }
}

enum Waiter {
    /// A retry closure already registered with the reactor; waking it means
    /// posting a task that invokes it on the loop thread.
    Loop(Token),
    /// A blocked thread parked on a latch.
    Sync(Arc<Latch>),
}

struct Waiters {
    senders: Vec<Waiter>,
    receivers: Vec<Waiter>,
}

struct Inner<T> {
    ring: Ring<T>,
    closed: AtomicBool,
    waiters: Mutex<Waiters>,
    reactor_handle: ReactorHandle,
}

fn dispatch(handle: &ReactorHandle, waiters: Vec<Waiter>) {
    for waiter in waiters {
        match waiter {
            Waiter::Loop(token) => handle.post(move |reactor| reactor.run_completion(token)),
            Waiter::Sync(latch) => latch.signal(),
        }
    }
}

fn wake_receivers<T>(inner: &Inner<T>) {
    let drained = std::mem::take(&mut inner.waiters.lock().unwrap().receivers);
    dispatch(&inner.reactor_handle, drained);
}

fn wake_senders<T>(inner: &Inner<T>) {
    let drained = std::mem::take(&mut inner.waiters.lock().unwrap().senders);
    dispatch(&inner.reactor_handle, drained);
}

fn cancel_deadline(reactor: &Reactor, slot: &Rc<Cell<Option<DeadlineId>>>) {
    if let Some(id) = slot.take() {
        reactor.cancel_deadline(id);
    }
}

/// The sending half of a [`channel`]. Cheaply `Clone`-able; every clone
/// shares the same ring and waiter lists.
pub struct Sender<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for Sender<T> {
    fn clone(&self) -> Sender<T> {
        Sender { inner: self.inner.clone() }
    }
}

/// The receiving half of a [`channel`].
pub struct Receiver<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for Receiver<T> {
    fn clone(&self) -> Receiver<T> {
        Receiver { inner: self.inner.clone() }
    }
}

/// Creates a bounded channel of the given capacity. `capacity` must be at
/// least 1; `reactor` is only used to obtain a [`ReactorHandle`] for waking
/// loop-side waiters — the channel itself does not borrow the reactor and
/// may outlive any particular tick of it.
pub fn channel<T>(reactor: &Reactor, capacity: usize) -> (Sender<T>, Receiver<T>) {
    let inner = Arc::new(Inner {
        ring: Ring::with_capacity(capacity),
        closed: AtomicBool::new(false),
        waiters: Mutex::new(Waiters { senders: Vec::new(), receivers: Vec::new() }),
        reactor_handle: reactor.handle(),
    });
    (Sender { inner: inner.clone() }, Receiver { inner })
}

/// Returned by [`Sender::try_send`] when the ring is full or the channel is
/// closed; carries the value back so nothing is lost.
pub enum TrySendError<T> {
    Full(T),
    Closed(T),
}

impl<T> TrySendError<T> {
    pub fn into_inner(self) -> T {
        match self {
            TrySendError::Full(v) => v,
            TrySendError::Closed(v) => v,
        }
    }
}

impl<T> fmt::Debug for TrySendError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrySendError::Full(_) => write!(f, "TrySendError::Full(..)"),
            TrySendError::Closed(_) => write!(f, "TrySendError::Closed(..)"),
        }
    }
}

impl<T> fmt::Display for TrySendError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrySendError::Full(_) => write!(f, "channel full"),
            TrySendError::Closed(_) => write!(f, "channel closed"),
        }
    }
}

impl<T> error::Error for TrySendError<T> {}

/// Returned by [`Receiver::try_receive`].
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum TryRecvError {
    Empty,
    Closed,
}

impl fmt::Display for TryRecvError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TryRecvError::Empty => write!(f, "channel empty"),
            TryRecvError::Closed => write!(f, "channel closed"),
        }
    }
}

impl error::Error for TryRecvError {}

impl<T: Send + 'static> Sender<T> {
    /// Non-blocking, lock-free unless the ring happens to be full (in which
    /// case it never blocks — it just reports [`TrySendError::Full`]).
    pub fn try_send(&self, value: T) -> Result<(), TrySendError<T>> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(TrySendError::Closed(value));
        }
        match self.inner.ring.try_push(value) {
            Ok(()) => {
                wake_receivers(&self.inner);
                Ok(())
            }
            Err(value) => Err(TrySendError::Full(value)),
        }
    }

    /// Blocks the calling OS thread until there is room, the channel
    /// closes, or `timeout` elapses. Safe to call from any thread,
    /// including one that never touches the reactor.
    pub fn send_sync(&self, value: T, timeout: Option<Duration>) -> Result<(), Error> {
        let deadline = timeout.map(|d| Instant::now() + d);
        let mut value = value;
        loop {
            if self.inner.closed.load(Ordering::Acquire) {
                return Err(Error::closed());
            }
            value = match self.inner.ring.try_push(value) {
                Ok(()) => {
                    wake_receivers(&self.inner);
                    return Ok(());
                }
                Err(v) => v,
            };

            let latch = Arc::new(Latch::new());
            {
                let mut guard = self.inner.waiters.lock().unwrap();
                if self.inner.closed.load(Ordering::Acquire) {
                    drop(guard);
                    return Err(Error::closed());
                }
                value = match self.inner.ring.try_push(value) {
                    Ok(()) => {
                        drop(guard);
                        wake_receivers(&self.inner);
                        return Ok(());
                    }
                    Err(v) => v,
                };
                guard.senders.push(Waiter::Sync(latch.clone()));
            }

            let remaining = match deadline {
                Some(dl) => {
                    let now = Instant::now();
                    if now >= dl {
                        return Err(Error::timeout());
                    }
                    Some(dl - now)
                }
                None => None,
            };
            if !latch.wait(remaining) {
                return Err(Error::timeout());
            }
        }
    }

    /// Loop-side send: returns a [`Continuation`] that settles once the
    /// value is accepted, the channel closes, or `timeout` elapses. Must be
    /// called on the thread running `reactor`.
    pub fn send(&self, reactor: &Reactor, value: T, timeout: Option<Duration>) -> Continuation<(), Error> {
        let (cont, settle) = Continuation::new_pending();
        let deadline_slot: Rc<Cell<Option<DeadlineId>>> = Rc::new(Cell::new(None));
        if let Some(d) = timeout {
            let settle_timeout = settle.clone();
            let id = reactor.schedule_deadline(d, Box::new(move || {
                if !settle_timeout.is_settled() {
                    settle_timeout.reject(Error::timeout());
                }
            }));
            deadline_slot.set(Some(id));
        }
        send_attempt(reactor.clone(), self.inner.clone(), value, settle, deadline_slot);
        cont
    }

    /// Marks the channel closed. Idempotent; wakes every waiter on both
    /// sides so they can observe `CLOSED` rather than wait forever.
    pub fn close(&self) {
        close_inner(&self.inner);
    }
}

fn send_attempt<T: 'static>(
    reactor: Reactor,
    inner: Arc<Inner<T>>,
    value: T,
    settle: Settle<(), Error>,
    deadline_slot: Rc<Cell<Option<DeadlineId>>>,
) {
    if settle.is_settled() {
        return;
    }
    if inner.closed.load(Ordering::Acquire) {
        cancel_deadline(&reactor, &deadline_slot);
        settle.reject(Error::closed());
        return;
    }
    let value = match inner.ring.try_push(value) {
        Ok(()) => {
            cancel_deadline(&reactor, &deadline_slot);
            wake_receivers(&inner);
            settle.fulfill(());
            return;
        }
        Err(v) => v,
    };

    let mut guard = inner.waiters.lock().unwrap();
    if inner.closed.load(Ordering::Acquire) {
        drop(guard);
        cancel_deadline(&reactor, &deadline_slot);
        settle.reject(Error::closed());
        return;
    }
    let value = match inner.ring.try_push(value) {
        Ok(()) => {
            drop(guard);
            cancel_deadline(&reactor, &deadline_slot);
            wake_receivers(&inner);
            settle.fulfill(());
            return;
        }
        Err(v) => v,
    };

    let inner2 = inner.clone();
    let reactor2 = reactor.clone();
    let settle2 = settle.clone();
    let deadline_slot2 = deadline_slot.clone();
    let token = reactor.register_completion(Box::new(move |_reactor| {
        send_attempt(reactor2, inner2, value, settle2, deadline_slot2);
    }));
    guard.senders.push(Waiter::Loop(token));
}

impl<T: Send + 'static> Receiver<T> {
    /// Non-blocking; never parks.
    pub fn try_receive(&self) -> Result<T, TryRecvError> {
        match self.inner.ring.try_pop() {
            Some(value) => {
                wake_senders(&self.inner);
                Ok(value)
            }
            None => {
                if self.inner.closed.load(Ordering::Acquire) {
                    Err(TryRecvError::Closed)
                } else {
                    Err(TryRecvError::Empty)
                }
            }
        }
    }

    /// Blocks the calling OS thread until a value is available, the channel
    /// closes and drains, or `timeout` elapses.
    pub fn receive_sync(&self, timeout: Option<Duration>) -> Result<T, Error> {
        let deadline = timeout.map(|d| Instant::now() + d);
        loop {
            if let Some(value) = self.inner.ring.try_pop() {
                wake_senders(&self.inner);
                return Ok(value);
            }
            if self.inner.closed.load(Ordering::Acquire) {
                return Err(Error::closed());
            }

            let latch = Arc::new(Latch::new());
            {
                let mut guard = self.inner.waiters.lock().unwrap();
                if let Some(value) = self.inner.ring.try_pop() {
                    drop(guard);
                    wake_senders(&self.inner);
                    return Ok(value);
                }
                if self.inner.closed.load(Ordering::Acquire) {
                    drop(guard);
                    return Err(Error::closed());
                }
                guard.receivers.push(Waiter::Sync(latch.clone()));
            }

            let remaining = match deadline {
                Some(dl) => {
                    let now = Instant::now();
                    if now >= dl {
                        return Err(Error::timeout());
                    }
                    Some(dl - now)
                }
                None => None,
            };
            if !latch.wait(remaining) {
                return Err(Error::timeout());
            }
        }
    }

    /// Loop-side receive. Must be called on the thread running `reactor`.
    pub fn receive(&self, reactor: &Reactor, timeout: Option<Duration>) -> Continuation<T, Error> {
        let (cont, settle) = Continuation::new_pending();
        let deadline_slot: Rc<Cell<Option<DeadlineId>>> = Rc::new(Cell::new(None));
        if let Some(d) = timeout {
            let settle_timeout = settle.clone();
            let id = reactor.schedule_deadline(d, Box::new(move || {
                if !settle_timeout.is_settled() {
                    settle_timeout.reject(Error::timeout());
                }
            }));
            deadline_slot.set(Some(id));
        }
        receive_attempt(reactor.clone(), self.inner.clone(), settle, deadline_slot);
        cont
    }

    /// Marks the channel closed. Idempotent; identical to [`Sender::close`]
    /// since both halves share one [`Inner`].
    pub fn close(&self) {
        close_inner(&self.inner);
    }
}

fn receive_attempt<T: 'static>(
    reactor: Reactor,
    inner: Arc<Inner<T>>,
    settle: Settle<T, Error>,
    deadline_slot: Rc<Cell<Option<DeadlineId>>>,
) {
    if settle.is_settled() {
        return;
    }
    if let Some(value) = inner.ring.try_pop() {
        cancel_deadline(&reactor, &deadline_slot);
        wake_senders(&inner);
        settle.fulfill(value);
        return;
    }
    if inner.closed.load(Ordering::Acquire) {
        cancel_deadline(&reactor, &deadline_slot);
        settle.reject(Error::closed());
        return;
    }

    let mut guard = inner.waiters.lock().unwrap();
    if let Some(value) = inner.ring.try_pop() {
        drop(guard);
        cancel_deadline(&reactor, &deadline_slot);
        wake_senders(&inner);
        settle.fulfill(value);
        return;
    }
    if inner.closed.load(Ordering::Acquire) {
        drop(guard);
        cancel_deadline(&reactor, &deadline_slot);
        settle.reject(Error::closed());
        return;
    }

    let inner2 = inner.clone();
    let reactor2 = reactor.clone();
    let settle2 = settle.clone();
    let deadline_slot2 = deadline_slot.clone();
    let token = reactor.register_completion(Box::new(move |_reactor| {
        receive_attempt(reactor2, inner2, settle2, deadline_slot2);
    }));
    guard.receivers.push(Waiter::Loop(token));
}

fn close_inner<T>(inner: &Arc<Inner<T>>) {
    if inner.closed.swap(true, Ordering::AcqRel) {
        return;
    }
    let (senders, receivers) = {
        let mut guard = inner.waiters.lock().unwrap();
        (std::mem::take(&mut guard.senders), std::mem::take(&mut guard.receivers))
    };
    dispatch(&inner.reactor_handle, senders);
    dispatch(&inner.reactor_handle, receivers);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn ring_is_fifo_under_single_producer_single_consumer() {
        let ring: Ring<u32> = Ring::with_capacity(4);
        for i in 0..4 {
            ring.try_push(i).unwrap();
        }
        assert!(ring.try_push(99).is_err());
        for i in 0..4 {
            assert_eq!(ring.try_pop(), Some(i));
        }
        assert_eq!(ring.try_pop(), None);
    }

    #[test]
    fn try_send_reports_full_then_succeeds_after_drain() {
        let reactor = Reactor::new().expect("reactor");
        let (tx, rx) = channel::<u32>(&reactor, 1);
        tx.try_send(1).expect("first send fits");
        match tx.try_send(2) {
            Err(TrySendError::Full(2)) => {}
            _ => panic!("expected Full"),
        }
        assert_eq!(rx.try_receive().unwrap(), 1);
        tx.try_send(2).expect("send after drain");
        assert_eq!(rx.try_receive().unwrap(), 2);
    }

    #[test]
    fn try_receive_reports_empty_then_closed() {
        let reactor = Reactor::new().expect("reactor");
        let (tx, rx) = channel::<u32>(&reactor, 4);
        assert_eq!(rx.try_receive().unwrap_err(), TryRecvError::Empty);
        tx.close();
        assert_eq!(rx.try_receive().unwrap_err(), TryRecvError::Closed);
    }

    #[test]
    fn close_wakes_a_blocked_receiver() {
        let reactor = Reactor::new().expect("reactor");
        let (tx, rx) = channel::<u32>(&reactor, 1);
        let handle = thread::spawn(move || rx.receive_sync(Some(Duration::from_secs(5))));
        thread::sleep(Duration::from_millis(50));
        tx.close();
        let result = handle.join().unwrap();
        assert!(result.unwrap_err().is_eof() == false);
        assert!(result.is_err());
    }

    #[test]
    fn send_sync_blocks_until_a_slot_frees_then_delivers_fifo() {
        let reactor = Reactor::new().expect("reactor");
        let (tx, rx) = channel::<u32>(&reactor, 1);
        tx.try_send(1).unwrap();
        let tx2 = tx.clone();
        let handle = thread::spawn(move || tx2.send_sync(2, Some(Duration::from_secs(5))));
        thread::sleep(Duration::from_millis(50));
        assert_eq!(rx.try_receive().unwrap(), 1);
        handle.join().unwrap().expect("second send completes");
        assert_eq!(rx.try_receive().unwrap(), 2);
    }

    #[test]
    fn mpmc_stress_preserves_every_message_exactly_once() {
        let reactor = Reactor::new().expect("reactor");
        let (tx, rx) = channel::<u32>(&reactor, 64);
        const PER_PRODUCER: u32 = 2_000;
        let producers: Vec<_> = (0..4)
            .map(|_| {
                let tx = tx.clone();
                thread::spawn(move || {
                    for i in 0..PER_PRODUCER {
                        tx.send_sync(i, None).expect("send");
                    }
                })
            })
            .collect();
        let consumers: Vec<_> = (0..4)
            .map(|_| {
                let rx = rx.clone();
                thread::spawn(move || {
                    let mut count = 0u32;
                    loop {
                        match rx.receive_sync(Some(Duration::from_millis(500))) {
                            Ok(_) => count += 1,
                            Err(_) => break,
                        }
                    }
                    count
                })
            })
            .collect();
        for p in producers {
            p.join().unwrap();
        }
        tx.close();
        let total: u32 = consumers.into_iter().map(|c| c.join().unwrap()).sum();
        assert_eq!(total, 4 * PER_PRODUCER);
    }
}
