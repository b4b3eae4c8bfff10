//! Flow control on both directions: partial consumption on the read
//! side, ring backpressure and drain on the write side.

use evsock::{ConnState, Connection, Reactor, ReactorHandle};

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
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
    let deadline = Instant::now() + Duration::from_secs(10);
    while !pred() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        thread::sleep(Duration::from_millis(5));
    }
}

/// A consumer that takes fewer bytes than delivered must see exactly
/// the unconsumed remainder prepended to newly arrived bytes.
#[test]
fn partial_consume_redelivers_remainder_in_order() {
    let (handle, join) = start_reactor();

    let deliveries: Arc<Mutex<Vec<Vec<u8>>>> = Arc::new(Mutex::new(Vec::new()));

    let server = {
        let deliveries = deliveries.clone();
        Connection::listen(&handle, "127.0.0.1", 0, move |conn| {
            let deliveries = deliveries.clone();
            conn.set_recv_fn(move |_conn, bytes| {
                deliveries.lock().unwrap().push(bytes.to_vec());
                // Take a single byte per invocation.
                1
            });
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

    assert_eq!(client.send(b"HEL"), 3);
    wait_until("first delivery", || !deliveries.lock().unwrap().is_empty());

    // The second write triggers the next read cycle; the remainder
    // "EL" must come back in front of the new bytes.
    assert_eq!(client.send(b"LO"), 2);
    wait_until("second delivery", || deliveries.lock().unwrap().len() >= 2);

    {
        let seen = deliveries.lock().unwrap();
        assert_eq!(seen[0], b"HEL");
        assert_eq!(seen[1], b"ELLO");
    }

    handle.shutdown();
    join.join().unwrap();
}

/// Replacing the receive callback hands the pending remainder to the
/// new callback immediately, without waiting for more traffic.
#[test]
fn set_recv_fn_delivers_pending_remainder() {
    let (handle, join) = start_reactor();

    let accepted: Arc<Mutex<Vec<Connection>>> = Arc::new(Mutex::new(Vec::new()));

    let server = {
        let accepted = accepted.clone();
        Connection::listen(&handle, "127.0.0.1", 0, move |conn| {
            // Consume nothing; everything stays pending.
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

    assert_eq!(client.send(b"STUCK"), 5);

    wait_until("peer buffered the bytes", || {
        accepted
            .lock()
            .unwrap()
            .first()
            .is_some_and(|c| c.stats().recv_bytes == 5)
    });

    let peer = accepted.lock().unwrap().pop().unwrap();
    let (tx, rx) = channel::<Vec<u8>>();
    peer.set_recv_fn(move |_conn, bytes| {
        tx.send(bytes.to_vec()).unwrap();
        bytes.len()
    });

    let pending = rx
        .recv_timeout(Duration::from_secs(5))
        .expect("pending bytes not redelivered");
    assert_eq!(pending, b"STUCK");

    handle.shutdown();
    join.join().unwrap();
}

/// With the peer not consuming, the writer's ring fills; the drain
/// callback must stay silent until a writability event actually empties
/// the buffer again.
#[test]
fn drain_fires_only_after_buffer_empties() {
    let (handle, join) = start_reactor();

    let accepted: Arc<Mutex<Vec<Connection>>> = Arc::new(Mutex::new(Vec::new()));

    let server = {
        let accepted = accepted.clone();
        Connection::listen(&handle, "127.0.0.1", 0, move |conn| {
            // Stall the read side completely until told otherwise.
            conn.set_recv_fn(|_conn, _bytes| 0);
            accepted.lock().unwrap().push(conn);
        })
        .expect("listen failed")
    };
    let addr = server.local_addr().unwrap();

    let consumed = Arc::new(AtomicUsize::new(0));
    let client = {
        let consumed = consumed.clone();
        Connection::connect(
            &handle,
            "127.0.0.1",
            addr.port(),
            move |_conn, bytes| {
                consumed.fetch_add(bytes.len(), Ordering::Relaxed);
                bytes.len()
            },
            |_conn, errno| panic!("client error: {errno}"),
        )
        .expect("connect failed")
    };

    wait_until("client connected", || {
        client.state() == ConnState::Connected
    });

    // Pump until the ring rejects input: the peer's scratch region,
    // both socket buffers, and our ring are all full at that point.
    let chunk = vec![0xA5u8; 64 * 1024];
    let mut queued = 0usize;
    let mut stalls = 0;
    while stalls < 5 {
        let accepted_now = client.send(&chunk);
        queued += accepted_now;
        if accepted_now == 0 {
            stalls += 1;
            thread::sleep(Duration::from_millis(20));
        } else {
            stalls = 0;
        }
        assert!(queued < 64 * 1024 * 1024, "backpressure never engaged");
    }

    // The ring is stuck full. A drain callback registered now must not
    // fire until writability actually empties the buffer.
    let drained = Arc::new(AtomicBool::new(false));
    {
        let drained = drained.clone();
        client.set_drain_fn(move |_conn| {
            drained.store(true, Ordering::Relaxed);
        });
    }

    thread::sleep(Duration::from_millis(100));
    assert!(
        !drained.load(Ordering::Relaxed),
        "drain fired while the ring was still backed up"
    );

    // Unstick the peer; everything flows and the writer's ring empties.
    let peer = accepted.lock().unwrap().pop().unwrap();
    peer.set_recv_fn(|_conn, bytes| bytes.len());

    wait_until("drain after writability", || {
        drained.load(Ordering::Relaxed)
    });
    wait_until("all queued bytes delivered", || {
        peer.stats().recv_bytes as usize >= queued
    });

    handle.shutdown();
    join.join().unwrap();
}
