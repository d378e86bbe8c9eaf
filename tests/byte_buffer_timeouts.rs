//! Integration coverage for the read/drain timeout paths (spec §8): cases
//! that need either a peer who never writes, or real backpressure, neither
//! of which fit comfortably inside the `#[cfg(test)]` modules that already
//! cover the rest of `ByteBuffer`'s/`PairedBuffer`'s state machine.

use std::cell::RefCell;
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
fn read_timeout_fires_when_peer_never_writes() {
    let reactor = Reactor::new().expect("reactor");
    let (_a, b) = pipe(&reactor);
    b.set_timeout(Some(Duration::from_millis(20)), None);

    let outcome: Rc<RefCell<Option<Error>>> = Rc::new(RefCell::new(None));
    let outcome2 = outcome.clone();
    let _ = b.read_exactly(5).then_or_else(
        |_| Continuation::<(), Error>::resolve(()),
        move |e| {
            *outcome2.borrow_mut() = Some(e);
            Continuation::resolve(())
        },
    );

    pump(&reactor, || outcome.borrow().is_some(), Duration::from_secs(2));
    let err = outcome.borrow_mut().take().expect("timed out");
    assert!(err.is_timeout());
}

#[test]
fn drain_timeout_fires_under_real_backpressure() {
    let reactor = Reactor::new().expect("reactor");
    let listener = Listener::bind(&reactor, Address::v4(std::net::Ipv4Addr::LOCALHOST, 0)).expect("bind");
    let port = listener.local_address().port().expect("port");

    // Accept and hold the server side open, but never read from it — the
    // client's writes have nowhere to drain to once both socket buffers fill.
    let server_side: Rc<RefCell<Option<StreamBuffer>>> = Rc::new(RefCell::new(None));
    let server_side2 = server_side.clone();
    let _ = listener.accept().then(move |conn| {
        *server_side2.borrow_mut() = Some(conn);
        Continuation::<(), Error>::resolve(())
    });

    let client_side: Rc<RefCell<Option<StreamBuffer>>> = Rc::new(RefCell::new(None));
    let client_side2 = client_side.clone();
    let addr = Address::v4(std::net::Ipv4Addr::LOCALHOST, port);
    let _ = connect_addr(&reactor, addr, Some(Duration::from_secs(2))).then(move |conn| {
        *client_side2.borrow_mut() = Some(conn);
        Continuation::<(), Error>::resolve(())
    });

    pump(&reactor, || server_side.borrow().is_some() && client_side.borrow().is_some(), Duration::from_secs(2));
    let server = server_side.borrow_mut().take().expect("accepted");
    let client = client_side.borrow_mut().take().expect("connected");

    // Shrink the kernel send buffer so a few megabytes of writes cannot
    // possibly drain without the peer reading.
    let fd = client.fd();
    let tiny: libc::c_int = 4096;
    unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_SNDBUF,
            &tiny as *const _ as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        );
    }

    client.set_timeout(None, Some(Duration::from_millis(50)));
    let payload = vec![0xABu8; 8 * 1024 * 1024];

    let outcome: Rc<RefCell<Option<Error>>> = Rc::new(RefCell::new(None));
    let outcome2 = outcome.clone();
    let _ = client.write(&payload).then_or_else(
        |_| Continuation::<(), Error>::resolve(()),
        move |e| {
            *outcome2.borrow_mut() = Some(e);
            Continuation::resolve(())
        },
    );

    pump(&reactor, || outcome.borrow().is_some(), Duration::from_secs(5));
    let err = outcome.borrow_mut().take().expect("drain timed out");
    assert!(err.is_timeout());

    drop(server);
    let _ = client.close();
    let _ = fd;
}
