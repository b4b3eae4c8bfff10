//! State-machine behavior at the edges: failed connects, repeated
//! `end`, reactor shutdown.

use evsock::{ConnState, Connection, Reactor, ReactorHandle};

use std::net::TcpListener;
use std::sync::mpsc::channel;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

fn start_reactor() -> (ReactorHandle, thread::JoinHandle<()>) {
    let (mut reactor, handle) = Reactor::new().expect("failed to create reactor");
    let join = thread::spawn(move || {
        reactor.run().expect("reactor loop failed");
    });
    (handle, join)
}

fn wait_until(what: &str, mut pred: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !pred() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        thread::sleep(Duration::from_millis(5));
    }
}

/// Reserves a port with no listener behind it.
fn dead_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").expect("failed to bind");
    let port = listener.local_addr().unwrap().port();
    drop(listener);
    port
}

#[test]
fn refused_connect_reports_error_once_then_closes() {
    let (handle, join) = start_reactor();

    let (err_tx, err_rx) = channel::<i32>();
    let client = Connection::connect(
        &handle,
        "127.0.0.1",
        dead_port(),
        |_conn, bytes| bytes.len(),
        move |_conn, errno| {
            err_tx.send(errno).unwrap();
        },
    )
    .expect("connect issue failed");

    let errno = err_rx
        .recv_timeout(Duration::from_secs(5))
        .expect("no error callback");
    assert_eq!(errno, libc::ECONNREFUSED);

    wait_until("client closed", || client.state() == ConnState::Closed);

    // Reported once: the sender was dropped with the callback slot.
    assert!(err_rx.recv_timeout(Duration::from_millis(100)).is_err());
    assert_eq!(client.stats().sys_errors, 1);

    handle.shutdown();
    join.join().unwrap();
}

#[test]
fn end_is_idempotent_and_terminal() {
    let (handle, join) = start_reactor();

    let server = Connection::listen(&handle, "127.0.0.1", 0, |_conn| {}).expect("listen failed");
    let addr = server.local_addr().unwrap();

    let client = Connection::connect(
        &handle,
        "127.0.0.1",
        addr.port(),
        |_conn, bytes| bytes.len(),
        |_conn, errno| panic!("unexpected error: {errno}"),
    )
    .expect("connect failed");

    wait_until("client connected", || {
        client.state() == ConnState::Connected
    });

    client.end();
    wait_until("client closed", || client.state() == ConnState::Closed);

    // Further end/send calls stay no-ops; the state never leaves Closed.
    client.end();
    client.end();
    assert_eq!(client.send(b"late"), 0);
    assert_eq!(client.state(), ConnState::Closed);

    handle.shutdown();
    join.join().unwrap();
}

#[test]
fn end_while_connecting_closes() {
    let (handle, join) = start_reactor();

    let client = Connection::connect(
        &handle,
        "127.0.0.1",
        dead_port(),
        |_conn, bytes| bytes.len(),
        |_conn, _errno| {},
    )
    .expect("connect issue failed");

    client.end();
    wait_until("client closed", || client.state() == ConnState::Closed);

    handle.shutdown();
    join.join().unwrap();
}

#[test]
fn send_to_listener_is_rejected() {
    let (handle, join) = start_reactor();

    let server = Connection::listen(&handle, "127.0.0.1", 0, |_conn| {}).expect("listen failed");
    assert_eq!(server.send(b"nope"), 0);

    handle.shutdown();
    join.join().unwrap();
}

#[test]
fn listen_bind_failure_surfaces() {
    let (handle, join) = start_reactor();

    // Hold the port with a std listener, then try to bind it again.
    let taken = TcpListener::bind("127.0.0.1:0").expect("failed to bind");
    let port = taken.local_addr().unwrap().port();

    let result = Connection::listen(&handle, "127.0.0.1", port, |_conn| {});
    assert!(result.is_err());

    handle.shutdown();
    join.join().unwrap();
}

/// A connection closed while its registration still sits in the
/// command queue must never reach the poller: its descriptor is gone,
/// and the number typically belongs to the next socket created.
#[test]
fn close_before_registration_spares_descriptor_reuse() {
    let (mut reactor, handle) = Reactor::new().expect("failed to create reactor");

    let server = Connection::listen(&handle, "127.0.0.1", 0, |_conn| {}).expect("listen failed");
    let addr = server.local_addr().unwrap();

    // The loop is not running yet, so the first client closes with its
    // registration command still queued.
    let first = Connection::connect(
        &handle,
        "127.0.0.1",
        addr.port(),
        |_conn, bytes| bytes.len(),
        |_conn, _errno| {},
    )
    .expect("connect failed");
    first.end();
    assert_eq!(first.state(), ConnState::Closed);

    // This socket reuses the freed descriptor number; the stale
    // registration must not disturb it.
    let (err_tx, err_rx) = channel::<i32>();
    let second = Connection::connect(
        &handle,
        "127.0.0.1",
        addr.port(),
        |_conn, bytes| bytes.len(),
        move |_conn, errno| {
            err_tx.send(errno).unwrap();
        },
    )
    .expect("connect failed");

    let deadline = Instant::now() + Duration::from_secs(5);
    while second.state() != ConnState::Connected {
        assert!(Instant::now() < deadline, "second connect never completed");
        reactor
            .poll_once(Some(Duration::from_millis(10)))
            .expect("poll failed");
    }

    assert!(
        err_rx.try_recv().is_err(),
        "healthy connection saw an error"
    );
    assert_eq!(second.stats().sys_errors, 0);

    handle.shutdown();
    while reactor
        .poll_once(Some(Duration::from_millis(10)))
        .expect("poll failed")
    {}
}

/// Bytes the callback declines to consume are redelivered while the
/// connection is open, but the peer's EOF is final: the last delivery
/// happens, the rest is discarded, and the connection closes cleanly.
#[test]
fn eof_discards_unconsumed_remainder() {
    let (handle, join) = start_reactor();

    let accepted: Arc<Mutex<Vec<Connection>>> = Arc::new(Mutex::new(Vec::new()));

    let server = {
        let accepted = accepted.clone();
        Connection::listen(&handle, "127.0.0.1", 0, move |conn| {
            // Never consume; the remainder stays pending.
            conn.set_recv_fn(|_conn, _bytes| 0);
            accepted.lock().unwrap().push(conn);
        })
        .expect("listen failed")
    };
    let addr = server.local_addr().unwrap();

    let client = Connection::connect(
        &handle,
        "127.0.0.1",
        addr.port(),
        |_conn, bytes| bytes.len(),
        |_conn, errno| panic!("client error: {errno}"),
    )
    .expect("connect failed");

    assert_eq!(client.send(b"LEFTOVER"), 8);
    wait_until("peer buffered the bytes", || {
        accepted
            .lock()
            .unwrap()
            .first()
            .is_some_and(|c| c.stats().recv_bytes == 8)
    });

    let peer = accepted.lock().unwrap().pop().unwrap();
    client.end();

    // The pending remainder does not hold the connection open.
    wait_until("peer closed", || peer.state() == ConnState::Closed);
    assert_eq!(peer.stats().recv_bytes, 8);

    handle.shutdown();
    join.join().unwrap();
}

#[test]
fn shutdown_closes_registered_connections() {
    let (handle, join) = start_reactor();

    let server = Connection::listen(&handle, "127.0.0.1", 0, |_conn| {}).expect("listen failed");
    let addr = server.local_addr().unwrap();

    let client = Connection::connect(
        &handle,
        "127.0.0.1",
        addr.port(),
        |_conn, bytes| bytes.len(),
        |_conn, _errno| {},
    )
    .expect("connect failed");

    wait_until("client connected", || {
        client.state() == ConnState::Connected
    });

    handle.shutdown();
    join.join().unwrap();

    assert_eq!(server.state(), ConnState::Closed);
    assert_eq!(client.state(), ConnState::Closed);
}
