use std::usize;

/// Associates an I/O source (or timer, or channel waiter) registered with a
/// [`crate::poll::Poll`] with the readiness events the selector reports for
/// it. Opaque to the selector; the reactor hands these out and interprets
/// them on the way back.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug, PartialOrd, Ord)]
pub struct Token(pub usize);

impl Token {
    /// Reserved token for the cross-thread wakeup source (`Reactor::post`).
    pub const WAKER: Token = Token(usize::MAX);
}

impl From<usize> for Token {
    fn from(val: usize) -> Token {
        Token(val)
    }
}

impl From<Token> for usize {
    fn from(val: Token) -> usize {
        val.0
    }
}
