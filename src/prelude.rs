//! Re-exports of the surface an external collaborator — a DNS resolver, an
//! HTTP client, a WebSocket framer — would build against (spec §11): the
//! reactor, continuations, the duplex transports, the channel, and the
//! error type. None of those collaborators live in this crate; this module
//! just collects what they'd `use` into one place, the way the teacher's own
//! crate root re-exports its public surface from `lib.rs`.
//!
//! ```
//! use reactor_io::prelude::*;
//! ```

pub use crate::buffer::{ByteBuffer, EolStyle};
pub use crate::channel::{channel, Receiver, Sender, TryRecvError, TrySendError};
pub use crate::continuation::{all, any, loop_with, race, Continuation, LoopAction, Settle};
pub use crate::dns::{AddressInfo, Resolver};
pub use crate::error::{Error, ErrorKind, Result};
pub use crate::interest::Interest;
pub use crate::io::{copy, read_all, tunnel, Transport};
pub use crate::pipe::{pipe, PairedBuffer};
pub use crate::reactor::{Metrics, Reactor, ReactorConfig, ReactorHandle};
pub use crate::signal::Signal;
pub use crate::timer::Timer;
pub use crate::worker::Worker;

#[cfg(feature = "net")]
pub use crate::net::{
    connect, connect_addr, connect_unix, listen, listen_unix, Address, DatagramSocket, Family, Listener, StreamBuffer,
};

#[cfg(feature = "tls")]
pub use crate::tls::{self, Role as TlsRole, TlsBuffer, TlsConfig, TlsContext, TlsVersion};
