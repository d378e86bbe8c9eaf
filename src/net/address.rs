//! Address tagged union (spec §4.7): `IPv4{port, 4 bytes}`, `IPv6{port, 16
//! bytes, optional zone}`, `Unix{path}`. Round-trips to/from the OS
//! `sockaddr` representation (via `socket2::SockAddr`) and supports the
//! IPv4-to-IPv6-mapped conversion spec §3 calls out.

use std::fmt;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr as StdSocketAddr, SocketAddrV4, SocketAddrV6};
use std::path::{Path, PathBuf};

use socket2::SockAddr as RawSockAddr;

use crate::error::{Error, ErrorKind};

/// A socket endpoint: IPv4, IPv6 (with an optional scope/zone id), or a
/// Unix-domain path.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Address {
    V4 { ip: Ipv4Addr, port: u16 },
    V6 { ip: Ipv6Addr, port: u16, zone: Option<u32> },
    Unix { path: PathBuf },
}

impl Address {
    pub fn v4(ip: Ipv4Addr, port: u16) -> Address {
        Address::V4 { ip, port }
    }

    pub fn v6(ip: Ipv6Addr, port: u16, zone: Option<u32>) -> Address {
        Address::V6 { ip, port, zone }
    }

    pub fn unix(path: impl AsRef<Path>) -> Address {
        Address::Unix { path: path.as_ref().to_path_buf() }
    }

    pub fn is_unix(&self) -> bool {
        matches!(self, Address::Unix { .. })
    }

    pub fn port(&self) -> Option<u16> {
        match self {
            Address::V4 { port, .. } => Some(*port),
            Address::V6 { port, .. } => Some(*port),
            Address::Unix { .. } => None,
        }
    }

    /// Maps a plain IPv4 address into the IPv4-mapped-IPv6 range
    /// (`::ffff:A.B.C.D`), used by dual-stack sockets.
    pub fn to_ipv6_mapped(&self) -> Address {
        match self {
            Address::V4 { ip, port } => Address::V6 {
                ip: ip.to_ipv6_mapped(),
                port: *port,
                zone: None,
            },
            other => other.clone(),
        }
    }

    pub fn to_std(&self) -> Result<StdSocketAddr, Error> {
        match self {
            Address::V4 { ip, port } => Ok(StdSocketAddr::V4(SocketAddrV4::new(*ip, *port))),
            Address::V6 { ip, port, zone } => {
                Ok(StdSocketAddr::V6(SocketAddrV6::new(*ip, *port, 0, zone.unwrap_or(0))))
            }
            Address::Unix { .. } => Err(Error::invalid_argument("unix addresses have no std::net representation")),
        }
    }

    pub fn from_std(addr: StdSocketAddr) -> Address {
        match addr {
            StdSocketAddr::V4(v4) => Address::V4 { ip: *v4.ip(), port: v4.port() },
            StdSocketAddr::V6(v6) => Address::V6 {
                ip: *v6.ip(),
                port: v6.port(),
                zone: if v6.scope_id() == 0 { None } else { Some(v6.scope_id()) },
            },
        }
    }

    /// Round-trips to the OS `sockaddr` representation `socket2` uses at the
    /// syscall boundary.
    pub fn to_raw(&self) -> Result<RawSockAddr, Error> {
        match self {
            Address::Unix { path } => {
                RawSockAddr::unix(path).map_err(|e| Error::new(ErrorKind::InvalidArgument, e.to_string()))
            }
            _ => Ok(RawSockAddr::from(self.to_std()?)),
        }
    }

    pub fn from_raw(raw: &RawSockAddr) -> Result<Address, Error> {
        if let Some(std_addr) = raw.as_socket() {
            return Ok(Address::from_std(std_addr));
        }
        if raw.is_unix() {
            let path = raw
                .as_pathname()
                .ok_or_else(|| Error::invalid_argument("unnamed or abstract unix address"))?;
            return Ok(Address::Unix { path: path.to_path_buf() });
        }
        Err(Error::invalid_argument("unrecognized address family"))
    }
}

impl PartialEq<StdSocketAddr> for Address {
    fn eq(&self, other: &StdSocketAddr) -> bool {
        self.to_std().map(|a| a == *other).unwrap_or(false)
    }
}

/// `A.B.C.D:port` for IPv4, `[hex:...%zone]:port` for IPv6, raw path for
/// Unix — the diagnostic wire format from spec §6.
impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Address::V4 { ip, port } => write!(f, "{ip}:{port}"),
            Address::V6 { ip, port, zone: Some(zone) } => write!(f, "[{ip}%{zone}]:{port}"),
            Address::V6 { ip, port, zone: None } => write!(f, "[{ip}]:{port}"),
            Address::Unix { path } => write!(f, "{}", path.display()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ipv4_round_trips_through_raw_sockaddr() {
        let addr = Address::v4(Ipv4Addr::new(127, 0, 0, 1), 30000);
        let raw = addr.to_raw().expect("to_raw");
        assert_eq!(Address::from_raw(&raw).expect("from_raw"), addr);
    }

    #[test]
    fn unix_round_trips_through_raw_sockaddr() {
        let addr = Address::unix("/tmp/reactor-io-test.sock");
        let raw = addr.to_raw().expect("to_raw");
        assert_eq!(Address::from_raw(&raw).expect("from_raw"), addr);
    }

    #[test]
    fn ipv4_maps_into_ipv6_mapped_range() {
        let addr = Address::v4(Ipv4Addr::new(1, 2, 3, 4), 80);
        let mapped = addr.to_ipv6_mapped();
        assert_eq!(mapped, Address::v6(Ipv4Addr::new(1, 2, 3, 4).to_ipv6_mapped(), 80, None));
    }

    #[test]
    fn display_matches_wire_format() {
        assert_eq!(Address::v4(Ipv4Addr::new(10, 0, 0, 1), 443).to_string(), "10.0.0.1:443");
        assert_eq!(Address::unix("/tmp/x.sock").to_string(), "/tmp/x.sock");
    }
}
