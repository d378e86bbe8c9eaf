//! Platform multiplexer backends.
//!
//! The reactor is generic over nothing: it picks exactly one `Selector` type
//! at compile time, the way the teacher crate picks `epoll` or `kqueue`
//! rather than abstracting over "a poller." Only Unix targets (Linux,
//! Android, macOS, iOS, and the BSDs) are populated; there is no portable
//! fallback for platforms without one of these two readiness APIs.

#[cfg(unix)]
mod unix;

#[cfg(unix)]
pub use unix::{self_pipe, Event, Events, Selector, Waker};
