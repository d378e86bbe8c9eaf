//! Covers spec §8 scenario 7: a line-echoing listener and a client that
//! writes one line, reads the echo back verbatim, then closes. Checks that
//! both ends see the same local/remote address pairing the OS reports.

use std::cell::RefCell;
use std::net::Ipv4Addr;
use std::rc::Rc;
use std::time::Duration;

use reactor_io::prelude::*;

fn pump(reactor: &Reactor, done: impl Fn() -> bool, budget: Duration) {
    let start = std::time::Instant::now();
    while !done() && start.elapsed() < budget {
        reactor.dispatch_once().expect("tick");
    }
}

fn echo_one_line(conn: StreamBuffer) {
    let conn2 = conn.clone();
    let _ = conn.read_line(EolStyle::Lf).then(move |line| {
        let _ = conn2.write_line(&line, EolStyle::Lf);
        Continuation::<(), Error>::resolve(())
    });
}

#[test]
fn client_writes_a_line_and_reads_back_the_same_line() {
    let reactor = Reactor::new().expect("reactor");
    let listener = Listener::bind(&reactor, Address::v4(Ipv4Addr::LOCALHOST, 0)).expect("bind");
    let port = listener.local_address().port().expect("port");

    let server_addrs: Rc<RefCell<Option<(Address, Address)>>> = Rc::new(RefCell::new(None));
    let server_addrs2 = server_addrs.clone();
    let _ = listener.accept().then(move |conn| {
        *server_addrs2.borrow_mut() = Some((conn.local_address().clone(), conn.remote_address().clone()));
        echo_one_line(conn);
        Continuation::<(), Error>::resolve(())
    });

    let client: Rc<RefCell<Option<StreamBuffer>>> = Rc::new(RefCell::new(None));
    let client2 = client.clone();
    let addr = Address::v4(Ipv4Addr::LOCALHOST, port);
    let _ = connect_addr(&reactor, addr, Some(Duration::from_secs(2))).then(move |conn| {
        *client2.borrow_mut() = Some(conn);
        Continuation::<(), Error>::resolve(())
    });

    pump(&reactor, || client.borrow().is_some() && server_addrs.borrow().is_some(), Duration::from_secs(2));
    let client = client.borrow_mut().take().expect("connected");
    let (server_local, server_remote) = server_addrs.borrow_mut().take().expect("accepted");

    assert_eq!(server_local.port(), client.remote_address().port());
    assert_eq!(server_remote.port(), client.local_address().port());

    client.write_line(b"hello", EolStyle::Lf).expect("write line");

    let echoed: Rc<RefCell<Option<Vec<u8>>>> = Rc::new(RefCell::new(None));
    let echoed2 = echoed.clone();
    let _ = client.read_line(EolStyle::Lf).then(move |line| {
        *echoed2.borrow_mut() = Some(line);
        Continuation::<(), Error>::resolve(())
    });

    pump(&reactor, || echoed.borrow().is_some(), Duration::from_secs(2));
    assert_eq!(echoed.borrow().as_ref().unwrap(), b"hello");

    let _ = client.close();
}
