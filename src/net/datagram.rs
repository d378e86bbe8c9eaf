//! Datagram sockets (spec §4.8): connectionless send/recv with independent
//! read- and write-side readiness, each with its own timeout.
//!
//! "Independent" is taken literally: a single fd can only ever have one
//! pending subscription per [`ReadinessEvent`] (spec §4.3's invariant), so a
//! read wait and a write wait on the same socket would contend for one slot.
//! Instead this wraps two `dup(2)`-ed descriptors of the same underlying
//! socket — one registered purely for read readiness, one purely for write
//! — so `read_from` and `write_to` can be outstanding at the same time
//! without touching each other's pending cell.

use std::cell::{Cell, RefCell};
use std::io;
use std::mem::MaybeUninit;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::rc::Rc;
use std::time::Duration;

use socket2::{Domain, Socket, Type};

use crate::continuation::{loop_with, Continuation, LoopAction};
use crate::error::Error;
use crate::interest::Interest;
use crate::net::address::Address;
use crate::readiness::ReadinessEvent;
use crate::reactor::Reactor;

/// Address family for [`DatagramSocket::new_socket`].
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum Family {
    V4,
    V6,
}

impl Family {
    fn domain(self) -> Domain {
        match self {
            Family::V4 => Domain::IPV4,
            Family::V6 => Domain::IPV6,
        }
    }
}

struct Inner {
    socket: Socket,
    read_fd: OwnedFd,
    write_fd: OwnedFd,
    read_event: ReadinessEvent,
    write_event: ReadinessEvent,
    connected_peer: RefCell<Option<Address>>,
    read_timeout: Cell<Option<Duration>>,
    write_timeout: Cell<Option<Duration>>,
    closed: Cell<bool>,
}

/// A non-blocking UDP (or Unix `SOCK_DGRAM`) socket.
#[derive(Clone)]
pub struct DatagramSocket {
    inner: Rc<Inner>,
}

fn dup_fd(fd: RawFd) -> io::Result<OwnedFd> {
    let dup = unsafe { libc::dup(fd) };
    if dup < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(unsafe { OwnedFd::from_raw_fd(dup) })
}

impl DatagramSocket {
    /// Creates an unbound, unconnected socket for `family`.
    pub fn new_socket(reactor: &Reactor, family: Family) -> Result<DatagramSocket, Error> {
        let socket = Socket::new(family.domain(), Type::DGRAM, None)?;
        socket.set_nonblocking(true)?;
        DatagramSocket::from_socket(reactor, socket)
    }

    pub fn bind(reactor: &Reactor, addr: Address) -> Result<DatagramSocket, Error> {
        let family = match addr {
            Address::V6 { .. } => Family::V6,
            _ => Family::V4,
        };
        let socket = Socket::new(family.domain(), Type::DGRAM, None)?;
        socket.set_nonblocking(true)?;
        socket.bind(&addr.to_raw()?)?;
        DatagramSocket::from_socket(reactor, socket)
    }

    fn from_socket(reactor: &Reactor, socket: Socket) -> Result<DatagramSocket, Error> {
        let fd = socket.as_raw_fd();
        let read_fd = dup_fd(fd)?;
        let write_fd = dup_fd(fd)?;
        let read_event = ReadinessEvent::new(reactor, read_fd.as_raw_fd())?;
        let write_event = ReadinessEvent::new(reactor, write_fd.as_raw_fd())?;
        Ok(DatagramSocket {
            inner: Rc::new(Inner {
                socket,
                read_fd,
                write_fd,
                read_event,
                write_event,
                connected_peer: RefCell::new(None),
                read_timeout: Cell::new(None),
                write_timeout: Cell::new(None),
                closed: Cell::new(false),
            }),
        })
    }

    /// Sets the default peer used by [`read`][Self::read]/[`write`][Self::write].
    /// UDP "connect" only records a default destination locally; it never
    /// touches the wire, so this settles synchronously.
    pub fn connect(&self, addr: Address) -> Result<(), Error> {
        self.inner.socket.connect(&addr.to_raw()?)?;
        *self.inner.connected_peer.borrow_mut() = Some(addr);
        Ok(())
    }

    pub fn local_address(&self) -> Result<Address, Error> {
        Address::from_raw(&self.inner.socket.local_addr()?)
    }

    pub fn set_timeout(&self, read: Option<Duration>, write: Option<Duration>) {
        self.inner.read_timeout.set(read);
        self.inner.write_timeout.set(write);
    }

    /// Receives one datagram, reporting the sender's address. EAGAIN-polls
    /// against the read-side event until data arrives, the deadline
    /// expires, or the socket closes.
    pub fn read_from(&self, n: usize) -> Continuation<(Vec<u8>, Address), Error> {
        if self.inner.closed.get() {
            return Continuation::reject(Error::eof());
        }
        let timeout = self.inner.read_timeout.get();
        let this = self.clone();
        loop_with(move || {
            let this = this.clone();
            this.inner.read_event.on(Interest::READ | Interest::CLOSED, timeout).then_or_else(
                move |bits| {
                    if bits.is_timeout() {
                        return Continuation::resolve(LoopAction::BreakErr(Error::timeout()));
                    }
                    if bits.is_closed() {
                        return Continuation::resolve(LoopAction::BreakErr(Error::closed()));
                    }
                    match this.try_recv(n) {
                        Ok(Some(v)) => Continuation::resolve(LoopAction::BreakOk(v)),
                        Ok(None) => Continuation::resolve(LoopAction::Continue),
                        Err(e) => Continuation::resolve(LoopAction::BreakErr(e)),
                    }
                },
                |e| Continuation::resolve(LoopAction::BreakErr(e)),
            )
        })
    }

    fn try_recv(&self, n: usize) -> Result<Option<(Vec<u8>, Address)>, Error> {
        let mut buf = vec![MaybeUninit::uninit(); n];
        match self.inner.socket.recv_from(&mut buf) {
            Ok((0, _)) => Err(Error::eof()),
            Ok((len, raw_addr)) => {
                let bytes: Vec<u8> = buf[..len].iter().map(|slot| unsafe { slot.assume_init() }).collect();
                let addr = Address::from_raw(&raw_addr).map_err(|_| Error::invalid_argument("unparseable peer address"))?;
                Ok(Some((bytes, addr)))
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Sends one datagram to `to`. EAGAIN-polls against the write-side
    /// event until the kernel accepts the whole buffer.
    pub fn write_to(&self, bytes: &[u8], to: Address) -> Continuation<(), Error> {
        if self.inner.closed.get() {
            return Continuation::reject(Error::eof());
        }
        let timeout = self.inner.write_timeout.get();
        let this = self.clone();
        let payload: Rc<Vec<u8>> = Rc::new(bytes.to_vec());
        loop_with(move || {
            let this = this.clone();
            let payload = payload.clone();
            let to = to.clone();
            this.inner.write_event.on(Interest::WRITE | Interest::CLOSED, timeout).then_or_else(
                move |bits| {
                    if bits.is_timeout() {
                        return Continuation::resolve(LoopAction::BreakErr(Error::timeout()));
                    }
                    if bits.is_closed() {
                        return Continuation::resolve(LoopAction::BreakErr(Error::closed()));
                    }
                    match this.try_send(&payload, &to) {
                        Ok(true) => Continuation::resolve(LoopAction::BreakOk(())),
                        Ok(false) => Continuation::resolve(LoopAction::Continue),
                        Err(e) => Continuation::resolve(LoopAction::BreakErr(e)),
                    }
                },
                |e| Continuation::resolve(LoopAction::BreakErr(e)),
            )
        })
    }

    fn try_send(&self, bytes: &[u8], to: &Address) -> Result<bool, Error> {
        let raw = to.to_raw()?;
        match self.inner.socket.send_to(bytes, &raw) {
            Ok(_) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Receives using the connected peer; `bytes` only, since the sender is
    /// already known.
    pub fn read(&self, n: usize) -> Continuation<Vec<u8>, Error> {
        self.read_from(n).then(|(bytes, _from)| Continuation::resolve(bytes))
    }

    /// Sends to the connected peer.
    pub fn write(&self, bytes: &[u8]) -> Continuation<(), Error> {
        match self.inner.connected_peer.borrow().clone() {
            Some(peer) => self.write_to(bytes, peer),
            None => Continuation::reject(Error::invalid_argument("socket has no connected peer")),
        }
    }

    /// Cancels any pending events with `CLOSED` and releases all three fds
    /// (the socket and its two readiness dups).
    pub fn close(&self) {
        if self.inner.closed.replace(true) {
            return;
        }
        self.inner.read_event.trigger(Interest::CLOSED);
        self.inner.write_event.trigger(Interest::CLOSED);
    }
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
    fn round_trip_reports_peer_address() {
        let reactor = Reactor::new().expect("reactor");
        let server = DatagramSocket::bind(&reactor, Address::v4(Ipv4Addr::LOCALHOST, 0)).expect("bind server");
        let client = DatagramSocket::bind(&reactor, Address::v4(Ipv4Addr::LOCALHOST, 0)).expect("bind client");
        let server_addr = server.local_address().expect("server addr");
        let client_addr = client.local_address().expect("client addr");

        let _ = client.write_to(&[0x01, 0x02], server_addr.clone());

        let received = Rc::new(RefCell::new(None));
        let received2 = received.clone();
        let _ = server.read_from(16).then(move |(bytes, from)| {
            *received2.borrow_mut() = Some((bytes, from));
            Continuation::<(), Error>::resolve(())
        });

        pump(&reactor, || received.borrow().is_some());
        let (bytes, from) = received.borrow_mut().take().expect("received");
        assert_eq!(bytes, vec![0x01, 0x02]);
        assert_eq!(from.port(), client_addr.port());
    }
}
