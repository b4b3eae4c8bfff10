//! Example: TCP echo server with evsock

use evsock::{Connection, Reactor};

fn main() -> std::io::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let (mut reactor, handle) = Reactor::new()?;

    // Every accepted connection echoes whatever it receives.
    let _server = Connection::listen(&handle, "127.0.0.1", 9000, |conn| {
        println!("accepted connection from {:?}", conn.peer_addr());

        conn.set_recv_fn(|conn, bytes| {
            // Report only what the ring accepted; the rest is
            // redelivered once the kernel drains our backlog.
            conn.send(bytes)
        });

        conn.set_error_fn(|conn, errno| {
            eprintln!("connection {} failed: errno {errno}", conn.id());
        });
    })?;

    println!("Echo server listening on 127.0.0.1:9000");
    reactor.run()
}
