//! Stream-copying helpers (spec §11): `read_all`, `copy`, and `tunnel`,
//! built on nothing but the `read`/`write` surface every transport in this
//! crate already exposes. Grounded on `aio::readAll`/`aio::copy`/`aio::tunnel`
//! from the reference implementation's `include/aio/io.h` — a promise `loop`
//! that reads, writes, and repeats until EOF, rewritten here as a
//! [`crate::continuation::loop_with`] driven off [`Transport`] instead of a
//! hand-rolled reader/writer template pair.

use crate::continuation::{loop_with, race, Continuation, LoopAction};
use crate::error::Error;

/// Minimal transport surface `copy`/`tunnel`/`read_all` need: read up to
/// `max` bytes, or write a whole chunk and wait for it to drain. Every
/// duplex stream type in this crate implements it.
pub trait Transport {
    fn read_chunk(&self, max: usize) -> Continuation<Vec<u8>, Error>;
    fn write_chunk(&self, bytes: &[u8]) -> Continuation<(), Error>;
}

const COPY_CHUNK: usize = 64 * 1024;

impl Transport for crate::buffer::ByteBuffer {
    fn read_chunk(&self, max: usize) -> Continuation<Vec<u8>, Error> {
        self.read_n(max)
    }
    fn write_chunk(&self, bytes: &[u8]) -> Continuation<(), Error> {
        self.write(bytes)
    }
}

impl Transport for crate::pipe::PairedBuffer {
    fn read_chunk(&self, max: usize) -> Continuation<Vec<u8>, Error> {
        self.read_n(max)
    }
    fn write_chunk(&self, bytes: &[u8]) -> Continuation<(), Error> {
        self.write(bytes)
    }
}

#[cfg(feature = "net")]
impl Transport for crate::net::stream::StreamBuffer {
    fn read_chunk(&self, max: usize) -> Continuation<Vec<u8>, Error> {
        self.buffer().read_n(max)
    }
    fn write_chunk(&self, bytes: &[u8]) -> Continuation<(), Error> {
        self.buffer().write(bytes)
    }
}

#[cfg(feature = "tls")]
impl Transport for crate::tls::TlsBuffer {
    fn read_chunk(&self, max: usize) -> Continuation<Vec<u8>, Error> {
        self.read_n(max)
    }
    fn write_chunk(&self, bytes: &[u8]) -> Continuation<(), Error> {
        self.write(bytes)
    }
}

/// Reads `reader` to completion, concatenating every chunk. Settles with
/// the accumulated bytes on EOF; any other error short-circuits the
/// accumulation and rejects with it.
pub fn read_all<R: Transport + Clone + 'static>(reader: R) -> Continuation<Vec<u8>, Error> {
    let data: std::rc::Rc<std::cell::RefCell<Vec<u8>>> = std::rc::Rc::new(std::cell::RefCell::new(Vec::new()));
    loop_with(move || {
        let reader = reader.clone();
        let data = data.clone();
        reader.read_chunk(COPY_CHUNK).then_or_else(
            move |chunk| {
                data.borrow_mut().extend_from_slice(&chunk);
                Continuation::resolve(LoopAction::Continue)
            },
            move |e| {
                if e.is_eof() {
                    Continuation::resolve(LoopAction::BreakOk(std::mem::take(&mut *data.borrow_mut())))
                } else {
                    Continuation::resolve(LoopAction::BreakErr(e))
                }
            },
        )
    })
}

/// Pumps bytes from `src` to `dst` until `src` hits EOF, then settles `()`.
/// A write error, or `dst` already being closed, rejects immediately. This
/// is the one-directional half `tunnel` runs in both directions at once.
pub fn copy<S, D>(src: S, dst: D) -> Continuation<(), Error>
where
    S: Transport + Clone + 'static,
    D: Transport + Clone + 'static,
{
    loop_with(move || {
        let src = src.clone();
        let dst = dst.clone();
        src.read_chunk(COPY_CHUNK).then_or_else(
            move |chunk| {
                dst.write_chunk(&chunk).then(|_| Continuation::resolve(LoopAction::Continue))
            },
            |e| {
                if e.is_eof() {
                    Continuation::resolve(LoopAction::BreakOk(()))
                } else {
                    Continuation::resolve(LoopAction::BreakErr(e))
                }
            },
        )
    })
}

/// Runs `copy(first, second)` and `copy(second, first)` concurrently,
/// settling as soon as either direction finishes (or fails) — the same
/// `race` of two loops the reference implementation's `aio::tunnel` builds,
/// since once either side reaches EOF the other side's writes have nowhere
/// left to go.
pub fn tunnel<A, B>(first: A, second: B) -> Continuation<(), Error>
where
    A: Transport + Clone + 'static,
    B: Transport + Clone + 'static,
{
    race(vec![copy(first.clone(), second.clone()), copy(second, first)])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reactor::Reactor;
    use std::cell::RefCell;
    use std::rc::Rc;
    use std::time::Duration;

    fn pump(reactor: &Reactor, done: impl Fn() -> bool) {
        let start = std::time::Instant::now();
        while !done() && start.elapsed() < Duration::from_secs(2) {
            reactor.dispatch_once().expect("tick");
        }
    }

    #[test]
    fn read_all_accumulates_until_peer_closes() {
        let reactor = Reactor::new().expect("reactor");
        let (a, b) = crate::pipe::pipe(&reactor);
        let _ = a.write(b"hello ");
        let _ = a.write(b"world");
        a.close().expect("close writer");

        let result: Rc<RefCell<Option<Vec<u8>>>> = Rc::new(RefCell::new(None));
        let result2 = result.clone();
        let _ = read_all(b).then(move |bytes| {
            *result2.borrow_mut() = Some(bytes);
            Continuation::<(), Error>::resolve(())
        });

        pump(&reactor, || result.borrow().is_some());
        assert_eq!(result.borrow().as_ref().unwrap(), b"hello world");
    }

    #[test]
    fn copy_forwards_bytes_until_source_closes() {
        let reactor = Reactor::new().expect("reactor");
        let (src_a, src_b) = crate::pipe::pipe(&reactor);
        let (dst_a, dst_b) = crate::pipe::pipe(&reactor);

        let done = Rc::new(std::cell::Cell::new(false));
        let done2 = done.clone();
        let _ = copy(src_b, dst_a).then(move |_| {
            done2.set(true);
            Continuation::<(), Error>::resolve(())
        });

        let _ = src_a.write(b"piped");
        src_a.close().expect("close source");

        let received = Rc::new(RefCell::new(None));
        let received2 = received.clone();
        let _ = dst_b.read_exactly(5).then(move |bytes| {
            *received2.borrow_mut() = Some(bytes);
            Continuation::<(), Error>::resolve(())
        });

        pump(&reactor, || done.get() && received.borrow().is_some());
        assert_eq!(received.borrow().as_ref().unwrap(), b"piped");
    }
}
