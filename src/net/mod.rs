//! Stream and datagram sockets (spec §4.7, §4.8): TCP/Unix `connect`/`listen`/
//! `accept` producing [`buffer::ByteBuffer`]-shaped streams, and connectionless
//! datagram sockets. Gated behind the `net` feature, the way the teacher
//! gates its own platform-specific pieces behind Cargo features.

pub mod address;
pub mod datagram;
pub mod stream;

pub use address::Address;
pub use datagram::{DatagramSocket, Family};
pub use stream::{connect_addr, Listener, StreamBuffer};

use std::time::Duration;

use crate::continuation::Continuation;
use crate::error::Error;
use crate::reactor::Reactor;

/// Resolves `host` via the reactor's resolver and connects to the first
/// address that accepts, the way spec §4.7 describes hostname `connect`
/// delegating resolution to the reactor.
pub fn connect(reactor: &Reactor, host: &str, port: u16) -> Continuation<StreamBuffer, Error> {
    let reactor2 = reactor.clone();
    reactor
        .dns_handle()
        .lookup_ip(reactor, host)
        .then(move |addrs| match addrs.into_iter().next() {
            Some(ip) => connect_addr(&reactor2, Address::from_std(std::net::SocketAddr::new(ip, port)), None),
            None => Continuation::reject(Error::new(crate::error::ErrorKind::Dns, "no addresses returned")),
        })
}

/// Connects to a Unix-domain stream socket at `path`.
pub fn connect_unix(reactor: &Reactor, path: impl AsRef<std::path::Path>) -> Continuation<StreamBuffer, Error> {
    connect_addr(reactor, Address::unix(path), None)
}

/// Connects with an explicit timeout applied to the CONNECTED wait.
pub fn connect_timeout(
    reactor: &Reactor,
    host: &str,
    port: u16,
    timeout: Duration,
) -> Continuation<StreamBuffer, Error> {
    let reactor2 = reactor.clone();
    reactor
        .dns_handle()
        .lookup_ip(reactor, host)
        .then(move |addrs| match addrs.into_iter().next() {
            Some(ip) => connect_addr(&reactor2, Address::from_std(std::net::SocketAddr::new(ip, port)), Some(timeout)),
            None => Continuation::reject(Error::new(crate::error::ErrorKind::Dns, "no addresses returned")),
        })
}

/// Resolves `host` via the reactor's resolver and binds/listens on the
/// first address returned.
pub fn listen(reactor: &Reactor, host: &str, port: u16) -> Continuation<Listener, Error> {
    let reactor2 = reactor.clone();
    reactor.dns_handle().lookup_ip(reactor, host).then(move |addrs| match addrs.into_iter().next() {
        Some(ip) => match Listener::bind(&reactor2, Address::from_std(std::net::SocketAddr::new(ip, port))) {
            Ok(listener) => Continuation::resolve(listener),
            Err(e) => Continuation::reject(e),
        },
        None => Continuation::reject(Error::new(crate::error::ErrorKind::Dns, "no addresses returned")),
    })
}

/// Listens on a Unix-domain path.
pub fn listen_unix(reactor: &Reactor, path: impl AsRef<std::path::Path>) -> Result<Listener, Error> {
    Listener::bind(reactor, Address::unix(path))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::net::Ipv4Addr;
    use std::rc::Rc;

    #[test]
    fn tcp_echo_round_trip_sees_matching_addresses() {
        let reactor = Reactor::new().expect("reactor");
        let listener = Listener::bind(&reactor, Address::v4(Ipv4Addr::LOCALHOST, 0)).expect("bind");
        let port = listener.local_address().port().expect("port");

        let server_seen = Rc::new(RefCell::new(None));
        let server_seen2 = server_seen.clone();
        let _ = listener.accept().then(move |conn| {
            let _ = conn.write_line(b"hello", crate::buffer::EolStyle::Lf);
            *server_seen2.borrow_mut() = Some(conn);
            Continuation::<(), Error>::resolve(())
        });

        let client_seen = Rc::new(RefCell::new(None));
        let client_seen2 = client_seen.clone();
        let _ = connect_addr(&reactor, Address::v4(Ipv4Addr::LOCALHOST, port), None).then(move |conn| {
            *client_seen2.borrow_mut() = Some(conn);
            Continuation::<(), Error>::resolve(())
        });

        let start = std::time::Instant::now();
        while (server_seen.borrow().is_none() || client_seen.borrow().is_none())
            && start.elapsed() < Duration::from_secs(2)
        {
            reactor.dispatch_once().expect("tick");
        }

        let server = server_seen.borrow_mut().take().expect("server side");
        let client = client_seen.borrow_mut().take().expect("client side");
        assert_eq!(server.local_address(), client.remote_address());
    }
}
