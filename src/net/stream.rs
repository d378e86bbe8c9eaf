//! Stream sockets (spec §4.7): TCP and Unix-domain `listen`/`accept`/`connect`,
//! producing [`StreamBuffer`]s — a [`ByteBuffer`] augmented with
//! `local_address()`/`remote_address()`.

use std::cell::{Cell, RefCell};
use std::io;
use std::ops::Deref;
use std::os::fd::{AsRawFd, IntoRawFd};
use std::rc::Rc;
use std::time::Duration;

use socket2::{Domain, Socket, Type};

use crate::buffer::ByteBuffer;
use crate::continuation::{loop_with, Continuation, LoopAction};
use crate::error::Error;
use crate::interest::Interest;
use crate::net::address::Address;
use crate::readiness::ReadinessEvent;
use crate::reactor::Reactor;

/// A connected duplex stream, with the addresses of both ends attached.
/// Derefs to [`ByteBuffer`] so every read/write/drain/close call reads the
/// way it would on a bare buffer.
#[derive(Clone)]
pub struct StreamBuffer {
    buffer: ByteBuffer,
    local: Address,
    remote: Address,
}

impl StreamBuffer {
    pub fn local_address(&self) -> &Address {
        &self.local
    }

    pub fn remote_address(&self) -> &Address {
        &self.remote
    }

    pub fn buffer(&self) -> &ByteBuffer {
        &self.buffer
    }
}

impl Deref for StreamBuffer {
    type Target = ByteBuffer;
    fn deref(&self) -> &ByteBuffer {
        &self.buffer
    }
}

fn domain_for(addr: &Address) -> Domain {
    match addr {
        Address::V4 { .. } => Domain::IPV4,
        Address::V6 { .. } => Domain::IPV6,
        Address::Unix { .. } => Domain::UNIX,
    }
}

fn new_nonblocking(addr: &Address) -> io::Result<Socket> {
    let socket = Socket::new(domain_for(addr), Type::STREAM, None)?;
    socket.set_nonblocking(true)?;
    Ok(socket)
}

const LISTEN_BACKLOG: i32 = 1024;

struct ListenerInner {
    socket: RefCell<Option<Socket>>,
    event: ReadinessEvent,
    local: Address,
    accept_pending: Cell<bool>,
}

/// Owns the listening socket and a disabled-by-default readiness
/// subscription: interest is enabled only while an `accept()` is
/// outstanding and disabled the instant it settles, the fairness discipline
/// spec §4.7 calls for.
#[derive(Clone)]
pub struct Listener {
    reactor: Reactor,
    inner: Rc<ListenerInner>,
}

impl Listener {
    fn from_socket(reactor: &Reactor, socket: Socket, local: Address) -> Result<Listener, Error> {
        socket.listen(LISTEN_BACKLOG)?;
        let event = ReadinessEvent::new(reactor, socket.as_raw_fd())?;
        event.set_interest(Interest::NONE)?;
        Ok(Listener {
            reactor: reactor.clone(),
            inner: Rc::new(ListenerInner {
                socket: RefCell::new(Some(socket)),
                event,
                local,
                accept_pending: Cell::new(false),
            }),
        })
    }

    /// Binds and listens on a pre-resolved address. `net::listen`/`listen_unix`
    /// below are the host-string-resolving conveniences spec §4.7 describes.
    pub fn bind(reactor: &Reactor, addr: Address) -> Result<Listener, Error> {
        let socket = new_nonblocking(&addr)?;
        let raw = addr.to_raw()?;
        socket.bind(&raw)?;
        let local = Address::from_raw(&socket.local_addr()?)?;
        Listener::from_socket(reactor, socket, local)
    }

    pub fn local_address(&self) -> &Address {
        &self.inner.local
    }

    /// Yields the next inbound connection. Only one `accept()` may be
    /// outstanding at a time (rejects with `BUSY` otherwise); `close()`
    /// rejects an outstanding accept with `EOF`.
    pub fn accept(&self) -> Continuation<StreamBuffer, Error> {
        let reactor = self.reactor.clone();
        self.accept_raw().then(move |(socket, local, remote)| {
            let fd = socket.into_raw_fd();
            match ByteBuffer::from_raw_fd(&reactor, fd) {
                Ok(buffer) => Continuation::resolve(StreamBuffer { buffer, local, remote }),
                Err(e) => Continuation::reject(e),
            }
        })
    }

    /// Same acceptance loop as [`accept`][Self::accept], stopping short of
    /// wrapping the connected socket into a [`ByteBuffer`] — the hook
    /// [`crate::tls`] uses to hand the raw fd to a TLS handshake instead.
    pub(crate) fn accept_raw(&self) -> Continuation<(Socket, Address, Address), Error> {
        if self.inner.accept_pending.get() {
            return Continuation::reject(Error::busy());
        }
        if self.inner.socket.borrow().is_none() {
            return Continuation::reject(Error::eof());
        }
        self.inner.accept_pending.set(true);
        if let Err(e) = self.inner.event.set_interest(Interest::READ) {
            self.inner.accept_pending.set(false);
            return Continuation::reject(e);
        }

        let this = self.clone();
        let result = loop_with(move || {
            let this = this.clone();
            this.inner.event.on(Interest::READ | Interest::CLOSED, None).then_or_else(
                move |bits| {
                    if bits.is_closed() {
                        return Continuation::resolve(LoopAction::BreakErr(Error::eof()));
                    }
                    match this.try_accept() {
                        Ok(Some(conn)) => Continuation::resolve(LoopAction::BreakOk(conn)),
                        Ok(None) => Continuation::resolve(LoopAction::Continue),
                        Err(e) => Continuation::resolve(LoopAction::BreakErr(e)),
                    }
                },
                |e| Continuation::resolve(LoopAction::BreakErr(e)),
            )
        });

        let this2 = self.clone();
        result.finally(move || {
            this2.inner.accept_pending.set(false);
            let _ = this2.inner.event.set_interest(Interest::NONE);
        })
    }

    fn try_accept(&self) -> Result<Option<(Socket, Address, Address)>, Error> {
        let guard = self.inner.socket.borrow();
        let socket = match guard.as_ref() {
            Some(s) => s,
            None => return Err(Error::eof()),
        };
        match socket.accept() {
            Ok((peer, raw_addr)) => {
                peer.set_nonblocking(true)?;
                let local = Address::from_raw(&peer.local_addr()?)?;
                let remote = Address::from_raw(&raw_addr)?;
                Ok(Some((peer, local, remote)))
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Rejects an outstanding accept with `EOF`, closes the listening fd,
    /// and makes every later `accept()` fail with `EOF` too.
    pub fn close(&self) {
        if self.inner.accept_pending.get() {
            self.inner.event.trigger(Interest::CLOSED);
        }
        self.inner.socket.borrow_mut().take();
    }
}

fn check_connect_error(fd: std::os::fd::RawFd) -> io::Result<()> {
    let mut err: libc::c_int = 0;
    let mut len = std::mem::size_of::<libc::c_int>() as libc::socklen_t;
    let rc = unsafe {
        libc::getsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_ERROR,
            &mut err as *mut _ as *mut libc::c_void,
            &mut len,
        )
    };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    if err == 0 {
        Ok(())
    } else {
        Err(io::Error::from_raw_os_error(err))
    }
}

/// Connects to a pre-resolved address, resolving on the CONNECTED event and
/// rejecting on any other terminal event with a formatted error (spec
/// §4.7). `net::connect`/`connect_unix` are the host-string conveniences.
pub fn connect_addr(reactor: &Reactor, addr: Address, timeout: Option<Duration>) -> Continuation<StreamBuffer, Error> {
    let reactor = reactor.clone();
    connect_raw(&reactor, addr, timeout).then(move |(socket, local, remote)| {
        let fd = socket.into_raw_fd();
        match ByteBuffer::from_raw_fd(&reactor, fd) {
            Ok(buffer) => Continuation::resolve(StreamBuffer { buffer, local, remote }),
            Err(e) => Continuation::reject(e),
        }
    })
}

/// Same connect sequence as [`connect_addr`], stopping short of wrapping the
/// connected socket into a [`ByteBuffer`] — the hook [`crate::tls`] uses to
/// run a client handshake over the raw fd instead.
pub(crate) fn connect_raw(
    reactor: &Reactor,
    addr: Address,
    timeout: Option<Duration>,
) -> Continuation<(Socket, Address, Address), Error> {
    let socket = match new_nonblocking(&addr) {
        Ok(s) => s,
        Err(e) => return Continuation::reject(e.into()),
    };
    let raw = match addr.to_raw() {
        Ok(r) => r,
        Err(e) => return Continuation::reject(e),
    };

    match socket.connect(&raw) {
        Ok(()) => {}
        Err(e) if e.raw_os_error() == Some(libc::EINPROGRESS) => {}
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
        Err(e) => return Continuation::reject(e.into()),
    }

    let fd = socket.as_raw_fd();
    let event = match ReadinessEvent::new(reactor, fd) {
        Ok(e) => e,
        Err(e) => return Continuation::reject(e),
    };

    event.on(Interest::WRITE | Interest::CLOSED, timeout).then_or_else(
        move |bits| {
            // Drop the connecting-phase registration before handing the raw
            // fd off to whatever re-registers it next (a `ByteBuffer` or a
            // TLS pump).
            drop(event);
            if bits.is_timeout() {
                return Continuation::reject(Error::timeout());
            }
            match check_connect_error(fd) {
                Ok(()) => match socket.local_addr().map_err(Error::from).and_then(|a| Address::from_raw(&a)) {
                    Ok(local) => Continuation::resolve((socket, local, addr)),
                    Err(e) => Continuation::reject(e),
                },
                Err(e) => Continuation::reject(e.into()),
            }
        },
        move |e| Continuation::reject(e),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn pump(reactor: &Reactor, done: impl Fn() -> bool) {
        let start = std::time::Instant::now();
        while !done() && start.elapsed() < Duration::from_secs(2) {
            reactor.dispatch_once().expect("tick");
        }
    }

    #[test]
    fn tcp_listener_accepts_a_connecting_client() {
        let reactor = Reactor::new().expect("reactor");
        let listener = Listener::bind(&reactor, Address::v4(Ipv4Addr::LOCALHOST, 0)).expect("bind");
        let local_port = match listener.local_address() {
            Address::V4 { port, .. } => *port,
            _ => unreachable!(),
        };

        let accepted = Rc::new(RefCell::new(None));
        let accepted2 = accepted.clone();
        let _ = listener.accept().then(move |conn| {
            *accepted2.borrow_mut() = Some(conn);
            Continuation::<(), Error>::resolve(())
        });

        let connected = Rc::new(RefCell::new(None));
        let connected2 = connected.clone();
        let client_addr = Address::v4(Ipv4Addr::LOCALHOST, local_port);
        let _ = connect_addr(&reactor, client_addr, Some(Duration::from_secs(2))).then(move |conn| {
            *connected2.borrow_mut() = Some(conn);
            Continuation::<(), Error>::resolve(())
        });

        pump(&reactor, || accepted.borrow().is_some() && connected.borrow().is_some());
        let server_side = accepted.borrow_mut().take().expect("accepted");
        let client_side = connected.borrow_mut().take().expect("connected");
        assert_eq!(server_side.remote_address().port(), client_side.local_address().port());
    }

    #[test]
    fn closing_listener_rejects_outstanding_accept_with_eof() {
        let reactor = Reactor::new().expect("reactor");
        let listener = Listener::bind(&reactor, Address::v4(Ipv4Addr::LOCALHOST, 0)).expect("bind");
        let rejected = Rc::new(RefCell::new(None));
        let rejected2 = rejected.clone();
        let _ = listener.accept().then_or_else(
            move |_| Continuation::<(), Error>::resolve(()),
            move |e| {
                *rejected2.borrow_mut() = Some(e);
                Continuation::resolve(())
            },
        );
        listener.close();
        pump(&reactor, || rejected.borrow().is_some());
        assert_eq!(rejected.borrow().as_ref().unwrap().kind(), crate::error::ErrorKind::Eof);
    }
}
