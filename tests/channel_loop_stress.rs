//! Covers spec §8 scenario 1: capacity-bounded channel driven entirely from
//! loop-side `send`/`receive` continuations (no blocking thread involved),
//! with several producers and consumers interleaved on one reactor tick
//! loop. The `*_sync` stress case already lives next to the ring in
//! `src/channel.rs`; this one exercises the other half of the dual API.

use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::time::Duration;

use reactor_io::prelude::*;

fn pump(reactor: &Reactor, done: impl Fn() -> bool, budget: Duration) {
    let start = std::time::Instant::now();
    while !done() && start.elapsed() < budget {
        reactor.dispatch_once().expect("tick");
    }
}

#[test]
fn two_loop_producers_two_loop_consumers_exchange_every_element() {
    const PER_PRODUCER: u32 = 2_000;
    const TOTAL: u32 = PER_PRODUCER * 2;

    let reactor = Reactor::new().expect("reactor");
    let (tx, rx) = channel::<u32>(&reactor, 100);

    let sent = Rc::new(Cell::new(0u32));
    let received = Rc::new(RefCell::new(Vec::<u32>::new()));

    fn drive_producer(reactor: Reactor, tx: Sender<u32>, sent: Rc<Cell<u32>>) {
        let next = sent.get();
        if next >= TOTAL {
            return;
        }
        sent.set(next + 1);
        let reactor2 = reactor.clone();
        let tx2 = tx.clone();
        let sent2 = sent.clone();
        let _ = tx.send(&reactor, next, None).then_or_else(
            move |_| {
                drive_producer(reactor2, tx2, sent2);
                Continuation::<(), Error>::resolve(())
            },
            |e| Continuation::reject(e),
        );
    }

    fn drive_consumer(reactor: Reactor, rx: Receiver<u32>, received: Rc<RefCell<Vec<u32>>>) {
        let reactor2 = reactor.clone();
        let rx2 = rx.clone();
        let received2 = received.clone();
        let _ = rx.receive(&reactor, Some(Duration::from_secs(5))).then_or_else(
            move |v| {
                received2.borrow_mut().push(v);
                drive_consumer(reactor2, rx2, received2);
                Continuation::<(), Error>::resolve(())
            },
            |e| Continuation::reject(e),
        );
    }

    // Two producer chains and two consumer chains all racing on one loop.
    for _ in 0..2 {
        drive_producer(reactor.clone(), tx.clone(), sent.clone());
    }
    for _ in 0..2 {
        drive_consumer(reactor.clone(), rx.clone(), received.clone());
    }

    // Stop feeding once every element has been produced, then let the
    // channel drain and close so the consumer chains terminate on CLOSED.
    let tx_closer = tx.clone();
    let sent_watch = sent.clone();
    let closed = Rc::new(Cell::new(false));
    let closed2 = closed.clone();
    let received_watch = received.clone();
    pump(
        &reactor,
        move || {
            if sent_watch.get() >= TOTAL && !closed2.get() {
                tx_closer.close();
                closed2.set(true);
            }
            received_watch.borrow().len() as u32 == TOTAL
        },
        Duration::from_secs(10),
    );

    assert_eq!(sent.get(), TOTAL);
    assert_eq!(received.borrow().len() as u32, TOTAL);
    let mut got = received.borrow().clone();
    got.sort_unstable();
    let expected: Vec<u32> = (0..TOTAL).collect();
    assert_eq!(got, expected);
}
