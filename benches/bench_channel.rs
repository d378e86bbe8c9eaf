//! Manual timing harness for the bounded MPMC channel (spec §4.5):
//! throughput of `try_send`/`try_receive` on a single thread, and of
//! `send_sync`/`receive_sync` across a producer/consumer thread pair. Same
//! `Instant`-based approach as `bench_poll.rs`; no `criterion`.

use std::thread;
use std::time::Instant;

use reactor_io::channel::channel;
use reactor_io::Reactor;

const CAPACITY: usize = 1024;
const MESSAGES: usize = 500_000;

fn bench_try_send_single_thread() {
    let reactor = Reactor::new().expect("reactor");
    let (tx, rx) = channel::<usize>(&reactor, CAPACITY);

    let start = Instant::now();
    let mut sent = 0usize;
    let mut received = 0usize;
    while received < MESSAGES {
        while sent < MESSAGES && tx.try_send(sent).is_ok() {
            sent += 1;
        }
        while rx.try_receive().is_ok() {
            received += 1;
        }
    }
    let elapsed = start.elapsed();
    println!(
        "bench_channel try_send/try_receive: {MESSAGES} messages in {elapsed:?} ({:.0}/s)",
        MESSAGES as f64 / elapsed.as_secs_f64()
    );
}

fn bench_send_sync_across_threads() {
    let reactor = Reactor::new().expect("reactor");
    let (tx, rx) = channel::<usize>(&reactor, CAPACITY);

    let start = Instant::now();
    let producer = thread::spawn(move || {
        for i in 0..MESSAGES {
            tx.send_sync(i).expect("send");
        }
    });
    let mut received = 0usize;
    while received < MESSAGES {
        rx.receive_sync().expect("receive");
        received += 1;
    }
    producer.join().expect("producer thread");
    let elapsed = start.elapsed();
    println!(
        "bench_channel send_sync/receive_sync: {MESSAGES} messages in {elapsed:?} ({:.0}/s)",
        MESSAGES as f64 / elapsed.as_secs_f64()
    );
}

fn main() {
    bench_try_send_single_thread();
    bench_send_sync_across_threads();
}
