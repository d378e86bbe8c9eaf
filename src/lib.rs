//! A single-threaded event reactor, a resolve/reject continuation runtime,
//! and the non-blocking I/O primitives built on top of them: byte buffers,
//! in-process paired buffers, a bounded MPMC channel, and (behind Cargo
//! features) TCP/Unix/datagram sockets and TLS transport.
//!
//! Nothing here is `async`/`await` — continuations settle synchronously on
//! whichever thread resolves or rejects them, the way a KJ- or gj-style
//! promise library works, and the reactor drives everything by repeatedly
//! calling [`Reactor::dispatch`] (or `dispatch_once` for callers who embed
//! their own loop). DNS resolution, HTTP, and WebSocket framing are treated
//! as external collaborators: [`dns::Resolver`] is the thin contract this
//! crate depends on, and [`prelude`] collects the surface those collaborators
//! would build against.
//!
//! ```no_run
//! use reactor_io::{Continuation, Reactor, Timer};
//!
//! let reactor = Reactor::new().expect("reactor");
//! let timer = Timer::new(&reactor);
//! let _ = timer.set_timeout(std::time::Duration::from_millis(10)).then(|_| {
//!     println!("fired");
//!     Continuation::<(), reactor_io::Error>::resolve(())
//! });
//! reactor.dispatch_once().expect("tick");
//! ```

#![warn(rust_2018_idioms)]

mod deadline;
mod interest;
mod poll;
mod slab;
mod sys;
mod token;

pub mod buffer;
pub mod channel;
pub mod continuation;
pub mod dns;
pub mod error;
pub mod io;
pub mod pipe;
pub mod reactor;
pub mod readiness;
pub mod signal;
pub mod timer;
pub mod worker;

pub mod prelude;

#[cfg(feature = "net")]
pub mod net;

#[cfg(feature = "tls")]
pub mod tls;

pub use buffer::ByteBuffer;
pub use channel::{channel, Receiver, Sender};
pub use continuation::{all, any, loop_with, race, Continuation, LoopAction, Settle};
pub use error::{Error, ErrorKind, Result};
pub use interest::Interest;
pub use pipe::{pipe, PairedBuffer};
pub use reactor::{Metrics, Reactor, ReactorConfig, ReactorHandle};
pub use readiness::ReadinessEvent;
pub use signal::Signal;
pub use timer::Timer;
pub use worker::Worker;

#[cfg(feature = "net")]
pub use net::{connect, connect_addr, connect_unix, listen, listen_unix, Address, DatagramSocket, Listener, StreamBuffer};
