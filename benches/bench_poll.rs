//! Manual timing harness for readiness-event round trips. No `criterion`,
//! no `#[bench]` — just `Instant` around a fixed number of iterations,
//! matching how this crate's benches are run (`cargo bench`, `harness =
//! false` in Cargo.toml). Measures how many write-then-notice-readable
//! round trips the reactor can drive per second over a single fd pair.

use std::os::fd::AsRawFd;
use std::os::unix::net::UnixStream;
use std::time::{Duration, Instant};

use reactor_io::{Continuation, Interest, Reactor, ReadinessEvent};

const ROUND_TRIPS: usize = 50_000;

fn main() {
    let reactor = Reactor::new().expect("reactor");
    let (a, b) = UnixStream::pair().expect("socketpair");
    a.set_nonblocking(true).expect("nonblocking");
    b.set_nonblocking(true).expect("nonblocking");
    let event = ReadinessEvent::new(&reactor, b.as_raw_fd()).expect("register");

    let mut observed = 0usize;
    let start = Instant::now();

    for i in 0..ROUND_TRIPS {
        use std::io::Write;
        (&a).write_all(&[0u8]).expect("write byte");

        let fired = std::rc::Rc::new(std::cell::Cell::new(false));
        let fired2 = fired.clone();
        let _ = event.on(Interest::READ, None).then(move |_| {
            fired2.set(true);
            Continuation::<(), reactor_io::Error>::resolve(())
        });

        while !fired.get() {
            reactor.dispatch_once().expect("tick");
        }

        use std::io::Read;
        let mut buf = [0u8; 1];
        let _ = (&b).read(&mut buf);
        observed += 1;

        if i % 10_000 == 0 && i > 0 {
            print_rate(observed, start.elapsed());
        }
    }

    print_rate(observed, start.elapsed());
}

fn print_rate(count: usize, elapsed: Duration) {
    let per_sec = count as f64 / elapsed.as_secs_f64();
    println!("bench_poll: {count} round trips in {elapsed:?} ({per_sec:.0}/s)");
}
