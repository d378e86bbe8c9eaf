//! Name resolution is an external collaborator (spec §1): this module
//! declares only the contract `net::stream`/`net::datagram` host-string
//! resolution (and a caller-supplied HTTP client) consume, plus a minimal
//! stub implementation so the core is self-testable without pulling in a
//! real asynchronous resolver crate.

use std::cell::RefCell;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, ToSocketAddrs};

use crate::continuation::Continuation;
use crate::error::{Error, ErrorKind};
use crate::reactor::Reactor;
use crate::worker::Worker;

/// What `getAddressInfo` and the typed lookups resolve to.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AddressInfo {
    pub addresses: Vec<IpAddr>,
}

/// The contract `net::stream`/`net::datagram` host-string resolution and an
/// out-of-scope HTTP client consume. A real implementation would wrap
/// something like `c-ares` or `trust-dns-resolver`; this crate ships only the
/// contract plus a stub built on [`Worker`] and the platform resolver libc
/// already links (`getaddrinfo`, via `std::net::ToSocketAddrs`).
pub trait Resolver {
    fn add_nameserver(&self, ip: IpAddr);

    fn get_address_info(&self, reactor: &Reactor, node: &str, service: u16) -> Continuation<AddressInfo, Error>;

    fn lookup_ip(&self, reactor: &Reactor, node: &str) -> Continuation<Vec<IpAddr>, Error> {
        self.get_address_info(reactor, node, 0)
            .then(|info| Continuation::resolve(info.addresses))
    }

    fn lookup_ipv4(&self, reactor: &Reactor, node: &str) -> Continuation<Vec<Ipv4Addr>, Error> {
        self.get_address_info(reactor, node, 0).then(|info| {
            Continuation::resolve(
                info.addresses
                    .into_iter()
                    .filter_map(|a| match a {
                        IpAddr::V4(v4) => Some(v4),
                        IpAddr::V6(_) => None,
                    })
                    .collect(),
            )
        })
    }

    fn lookup_ipv6(&self, reactor: &Reactor, node: &str) -> Continuation<Vec<Ipv6Addr>, Error> {
        self.get_address_info(reactor, node, 0).then(|info| {
            Continuation::resolve(
                info.addresses
                    .into_iter()
                    .filter_map(|a| match a {
                        IpAddr::V6(v6) => Some(v6),
                        IpAddr::V4(_) => None,
                    })
                    .collect(),
            )
        })
    }
}

/// Resolves hostnames via the platform's blocking `getaddrinfo`, bridged
/// through [`Worker`] so the blocking call never runs on the loop thread.
/// `add_nameserver` is accepted for interface completeness but has no effect
/// on this stub: `getaddrinfo` always consults system configuration, not an
/// explicit server list.
pub struct StubResolver {
    nameservers: RefCell<Vec<IpAddr>>,
}

impl StubResolver {
    pub fn new() -> StubResolver {
        StubResolver {
            nameservers: RefCell::new(Vec::new()),
        }
    }
}

impl Default for StubResolver {
    fn default() -> StubResolver {
        StubResolver::new()
    }
}

impl Resolver for StubResolver {
    fn add_nameserver(&self, ip: IpAddr) {
        self.nameservers.borrow_mut().push(ip);
    }

    fn get_address_info(&self, reactor: &Reactor, node: &str, service: u16) -> Continuation<AddressInfo, Error> {
        let query = format!("{node}:{service}");
        let node_for_error = node.to_string();
        Worker::new(reactor.clone()).run(move || {
            query
                .to_socket_addrs()
                .map(|iter| AddressInfo {
                    addresses: iter.map(|sa| sa.ip()).collect(),
                })
                .map_err(|_| Error::new(ErrorKind::Dns, format!("could not resolve '{node_for_error}'")))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn localhost_v4_resolves_to_loopback() {
        let reactor = Reactor::new().expect("reactor");
        let resolver = StubResolver::new();
        let cont = resolver.lookup_ipv4(&reactor, "localhost");

        let seen = std::rc::Rc::new(std::cell::RefCell::new(None));
        let seen2 = seen.clone();
        let _ = cont.then(move |addrs| {
            *seen2.borrow_mut() = Some(addrs);
            Continuation::<(), Error>::resolve(())
        });

        for _ in 0..50 {
            if seen.borrow().is_some() {
                break;
            }
            reactor.dispatch_once().expect("tick");
            std::thread::sleep(std::time::Duration::from_millis(5));
        }
        let addrs = seen.borrow_mut().take().expect("resolver settles");
        assert!(addrs.contains(&Ipv4Addr::LOCALHOST));
    }
}
