//! Bridges a CPU-bound or blocking native call onto a dedicated OS thread and
//! settles a reactor-hosted [`Continuation`] with its result, per spec §5's
//! description of the third cross-thread-safe primitive (after
//! `Reactor::post` and `Reactor::loop_break`).
//!
//! The settle handle never leaves the loop thread: a worker thread can only
//! carry `Send` data back, so it hands the reactor a plain [`Token`] via
//! [`crate::reactor::Reactor::register_completion`] and the loop thread does
//! the actual settling when it sees that token again.

use std::sync::{Arc, Mutex};

use crate::continuation::Continuation;
use crate::reactor::Reactor;

pub struct Worker {
    reactor: Reactor,
}

impl Worker {
    pub fn new(reactor: Reactor) -> Worker {
        Worker { reactor }
    }

    /// Runs `task` on a new OS thread; the returned continuation settles on
    /// the loop thread once it finishes.
    pub fn run<T, E, F>(&self, task: F) -> Continuation<T, E>
    where
        F: FnOnce() -> Result<T, E> + Send + 'static,
        T: Send + 'static,
        E: Send + 'static,
    {
        let (cont, settle) = Continuation::new_pending();
        let slot: Arc<Mutex<Option<Result<T, E>>>> = Arc::new(Mutex::new(None));

        let token = {
            let slot = slot.clone();
            self.reactor.register_completion(Box::new(move |_reactor| {
                if let Some(result) = slot.lock().expect("worker result mutex poisoned").take() {
                    settle.settle_result(result);
                }
            }))
        };

        let handle = self.reactor.handle();
        std::thread::spawn(move || {
            let value = task();
            *slot.lock().expect("worker result mutex poisoned") = Some(value);
            handle.post(move |reactor| reactor.run_completion(token));
        });

        cont
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;

    #[test]
    fn run_settles_on_the_loop_thread_with_the_task_result() {
        let reactor = Reactor::new().expect("reactor");
        let worker = Worker::new(reactor.clone());

        let cont: Continuation<i32, Error> = worker.run(|| {
            std::thread::sleep(std::time::Duration::from_millis(10));
            Ok(21 * 2)
        });

        let seen = std::rc::Rc::new(std::cell::Cell::new(None));
        let seen2 = seen.clone();
        let _ = cont.then(move |v| {
            seen2.set(Some(v));
            Continuation::resolve(())
        });

        // The worker thread posts back via the waker; dispatching drives it.
        for _ in 0..50 {
            if seen.get().is_some() {
                break;
            }
            reactor.dispatch_once().expect("tick");
            std::thread::sleep(std::time::Duration::from_millis(5));
        }
        assert_eq!(seen.get(), Some(42));
    }
}
