//! The single-threaded event loop: owns the OS multiplexer, the pending
//! deadline queue, and the cross-thread post queue. Every other component in
//! this crate is driven by calling back into sources this module dispatches
//! to from [`Reactor::dispatch`].

use std::cell::RefCell;
use std::collections::VecDeque;
use std::os::unix::io::RawFd;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use log::{debug, trace};

use crate::deadline::{DeadlineId, DeadlineQueue};
use crate::dns::{Resolver, StubResolver};
use crate::error::{Error, Result};
use crate::interest::Interest;
use crate::poll::Poll;
use crate::slab::Slab;
use crate::sys;
use crate::token::Token;

/// Anything registered in the reactor's source slab: [`crate::readiness::ReadinessEvent`]
/// is the only implementor, but the trait keeps the slab homogeneous without
/// depending on that module's concrete type.
pub(crate) trait SourceCallback {
    fn on_ready(&self, reactor: &Reactor, bits: Interest);
}

type PostedTask = Box<dyn FnOnce(&Reactor) + Send>;

/// Construction-time tuning, mirroring the teacher's `EventLoopConfig`.
#[derive(Copy, Clone, Debug)]
pub struct ReactorConfig {
    /// Upper bound on how long a single `poll` call may block when no timer
    /// is sooner, in milliseconds.
    pub poll_timeout_ms: u64,
    /// Initial capacity hint for the source slab.
    pub source_capacity: usize,
    /// Number of OS threads the `Worker` primitive may have in flight before
    /// new work queues behind them. `0` means unbounded.
    pub worker_threads: usize,
}

impl Default for ReactorConfig {
    fn default() -> ReactorConfig {
        ReactorConfig {
            poll_timeout_ms: 1_000,
            source_capacity: 1_024,
            worker_threads: 0,
        }
    }
}

/// Snapshot returned by [`Reactor::metrics`].
#[derive(Copy, Clone, Debug, Default)]
pub struct Metrics {
    pub registered_sources: usize,
    pub pending_deadlines: usize,
    pub queued_posts: usize,
}

struct Inner {
    poll: Poll,
    events: sys::Events,
    sources: Slab<Rc<dyn SourceCallback>>,
    /// One-shot completions registered by [`crate::worker::Worker`]: a worker
    /// thread can only reach the loop thread with `Send` data (a `Token`), so
    /// the actual (possibly `!Send`) settle closure lives here, keyed by that
    /// token, until the loop thread runs it.
    completions: Slab<Box<dyn FnOnce(&Reactor)>>,
    deadlines: DeadlineQueue,
    resolver: Rc<dyn Resolver>,
    config: ReactorConfig,
}

/// Loop-thread-only handle. Not `Send`/`Sync`: cross-thread callers use
/// [`Reactor::handle`] instead, the way the teacher's `EventLoop` hands out a
/// `Send` `EventLoopSender` rather than being `Send` itself.
#[derive(Clone)]
pub struct Reactor {
    inner: Rc<RefCell<Inner>>,
    waker: Arc<sys::Waker>,
    waker_token: Token,
    posted: Arc<Mutex<VecDeque<PostedTask>>>,
    running: Arc<AtomicBool>,
}

impl Reactor {
    pub fn new() -> Result<Reactor> {
        Reactor::with_config(ReactorConfig::default())
    }

    pub fn with_config(config: ReactorConfig) -> Result<Reactor> {
        let poll = Poll::new().map_err(Error::from)?;
        let waker_token = Token::WAKER;
        let waker = sys::Waker::new(poll.selector(), waker_token).map_err(Error::from)?;

        let inner = Inner {
            events: sys::Events::with_capacity(256),
            poll,
            sources: Slab::with_capacity(config.source_capacity),
            completions: Slab::with_capacity(32),
            deadlines: DeadlineQueue::new(),
            resolver: Rc::new(StubResolver::new()),
            config,
        };

        Ok(Reactor {
            inner: Rc::new(RefCell::new(inner)),
            waker: Arc::new(waker),
            waker_token,
            posted: Arc::new(Mutex::new(VecDeque::new())),
            running: Arc::new(AtomicBool::new(false)),
        })
    }

    /// A `Send + Sync` handle usable from any thread. This is the rendition
    /// of spec's "`Reactor.post`/`Reactor.loopBreak` are safe from any
    /// thread": a bare `Reactor` is `Rc`-based and loop-thread-only, so
    /// cross-thread callers go through this instead.
    pub fn handle(&self) -> ReactorHandle {
        ReactorHandle {
            posted: self.posted.clone(),
            waker: self.waker.clone(),
            running: self.running.clone(),
        }
    }

    /// Runs the loop until [`ReactorHandle::loop_break`] is called or there
    /// is nothing left registered, pending, or queued.
    pub fn dispatch(&self) -> Result<()> {
        self.running.store(true, Ordering::SeqCst);
        while self.running.load(Ordering::SeqCst) {
            self.tick()?;
            if self.is_idle() {
                break;
            }
        }
        Ok(())
    }

    /// Runs exactly one iteration; used by tests and by callers embedding
    /// the reactor inside another loop.
    pub fn dispatch_once(&self) -> Result<()> {
        self.tick()
    }

    pub fn post<F>(&self, task: F)
    where
        F: FnOnce(&Reactor) + Send + 'static,
    {
        self.handle().post(task);
    }

    pub fn loop_break(&self) {
        self.handle().loop_break();
    }

    pub fn add_nameserver(&self, ip: std::net::IpAddr) {
        self.inner.borrow().resolver.add_nameserver(ip);
    }

    pub fn dns_handle(&self) -> Rc<dyn Resolver> {
        self.inner.borrow().resolver.clone()
    }

    /// The multiplexer's raw fd, for embedding alongside an external
    /// transfer library's own epoll/kqueue integration.
    pub fn base(&self) -> RawFd {
        use std::os::unix::io::AsRawFd;
        self.inner.borrow().poll.selector().as_raw_fd()
    }

    pub fn metrics(&self) -> Metrics {
        let inner = self.inner.borrow();
        Metrics {
            registered_sources: inner.sources.len(),
            pending_deadlines: inner.deadlines.len(),
            queued_posts: self.posted.lock().unwrap().len(),
        }
    }

    fn is_idle(&self) -> bool {
        let inner = self.inner.borrow();
        inner.sources.is_empty() && inner.deadlines.is_empty() && self.posted.lock().unwrap().is_empty()
    }

    fn tick(&self) -> Result<()> {
        let timeout = self.poll_timeout();

        {
            let mut inner = self.inner.borrow_mut();
            let (poll, events) = (&inner.poll, &mut inner.events);
            poll.poll(events, Some(timeout)).map_err(Error::from)?;
        }

        if log::max_level() >= log::LevelFilter::Debug {
            debug!("reactor tick: {:?}", self.metrics());
        }

        self.process_io_events();
        self.process_deadlines();
        self.process_posted();

        Ok(())
    }

    fn poll_timeout(&self) -> Duration {
        let inner = self.inner.borrow();
        let mut timeout = Duration::from_millis(inner.config.poll_timeout_ms);
        if let Some(deadline) = inner.deadlines.next_deadline() {
            let now = Instant::now();
            let until = deadline.saturating_duration_since(now);
            timeout = timeout.min(until);
        }
        drop(inner);
        if !self.posted.lock().unwrap().is_empty() {
            timeout = Duration::ZERO;
        }
        timeout
    }

    fn process_io_events(&self) {
        let fired: Vec<(Token, Interest)> = {
            let inner = self.inner.borrow();
            inner
                .events
                .iter()
                .map(|event| (event.token(), translate(&event)))
                .collect()
        };

        for (token, bits) in fired {
            if token == self.waker_token {
                self.waker.ack();
                continue;
            }
            let source = {
                let inner = self.inner.borrow();
                inner.sources.get(token).cloned()
            };
            if let Some(source) = source {
                trace!("dispatching token {token:?} bits {bits:?}");
                source.on_ready(self, bits);
            }
        }
    }

    fn process_deadlines(&self) {
        let expired = {
            let mut inner = self.inner.borrow_mut();
            inner.deadlines.drain_expired(Instant::now())
        };
        for callback in expired {
            callback();
        }
    }

    fn process_posted(&self) {
        loop {
            let task = self.posted.lock().unwrap().pop_front();
            match task {
                Some(task) => task(self),
                None => break,
            }
        }
    }

    pub(crate) fn register_source(
        &self,
        fd: RawFd,
        interest: Interest,
        source: Rc<dyn SourceCallback>,
    ) -> Result<Token> {
        let token = self.inner.borrow_mut().sources.insert(source);
        self.inner
            .borrow()
            .poll
            .register(fd, token, interest)
            .map_err(Error::from)?;
        Ok(token)
    }

    pub(crate) fn reregister_source(&self, fd: RawFd, token: Token, interest: Interest) -> Result<()> {
        self.inner.borrow().poll.reregister(fd, token, interest).map_err(Error::from)
    }

    pub(crate) fn deregister_source(&self, fd: RawFd, token: Token) -> Result<()> {
        self.inner.borrow_mut().sources.remove(token);
        self.inner.borrow().poll.deregister(fd).map_err(Error::from)
    }

    pub(crate) fn schedule_deadline(&self, after: Duration, callback: Box<dyn FnOnce()>) -> DeadlineId {
        let deadline = Instant::now() + after;
        self.inner.borrow_mut().deadlines.schedule(deadline, callback)
    }

    pub(crate) fn cancel_deadline(&self, id: DeadlineId) {
        self.inner.borrow_mut().deadlines.cancel(id);
    }

    /// Registers a one-shot completion callback and returns the token a
    /// worker thread can carry across via [`ReactorHandle::post`] to have it
    /// run here, on the loop thread.
    pub(crate) fn register_completion(&self, callback: Box<dyn FnOnce(&Reactor)>) -> Token {
        self.inner.borrow_mut().completions.insert(callback)
    }

    pub(crate) fn run_completion(&self, token: Token) {
        let callback = self.inner.borrow_mut().completions.remove(token);
        if let Some(callback) = callback {
            callback(self);
        }
    }
}

fn translate(event: &sys::Event) -> Interest {
    let mut bits = Interest::NONE;
    if event.is_readable() {
        bits |= Interest::READ;
    }
    if event.is_writable() {
        bits |= Interest::WRITE;
    }
    if event.is_read_closed() || event.is_write_closed() || event.is_error() {
        bits |= Interest::CLOSED;
    }
    bits
}

/// `Send + Sync` cross-thread counterpart to [`Reactor`]. Handed out by
/// [`Reactor::handle`]; `Channel` and `Worker` hold one of these, never a
/// bare `Reactor`.
#[derive(Clone)]
pub struct ReactorHandle {
    posted: Arc<Mutex<VecDeque<PostedTask>>>,
    waker: Arc<sys::Waker>,
    running: Arc<AtomicBool>,
}

impl ReactorHandle {
    pub fn post<F>(&self, task: F)
    where
        F: FnOnce(&Reactor) + Send + 'static,
    {
        self.posted.lock().unwrap().push_back(Box::new(task));
        let _ = self.waker.wake();
    }

    pub fn loop_break(&self) {
        self.running.store(false, Ordering::SeqCst);
        let _ = self.waker.wake();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::rc::Rc;

    #[test]
    fn idle_reactor_dispatch_returns_immediately() {
        let reactor = Reactor::new().expect("reactor");
        reactor.dispatch().expect("dispatch");
    }

    #[test]
    fn post_runs_on_next_tick() {
        let reactor = Reactor::new().expect("reactor");
        let ran = Rc::new(Cell::new(false));
        let ran2 = ran.clone();
        reactor.post(move |_| ran2.set(true));
        reactor.dispatch_once().expect("tick");
        assert!(ran.get());
    }

    #[test]
    fn handle_post_wakes_a_blocked_dispatch() {
        let reactor = Reactor::new().expect("reactor");
        let handle = reactor.handle();
        let ran = Rc::new(Cell::new(false));
        let ran2 = ran.clone();

        std::thread::spawn(move || {
            handle.post(move |_| ran2.set(true));
        })
        .join()
        .expect("poster thread");

        reactor.dispatch_once().expect("tick");
        assert!(ran.get());
    }
}
