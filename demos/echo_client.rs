//! Example: TCP client with evsock

use evsock::{Connection, Reactor};

fn main() -> std::io::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let (mut reactor, handle) = Reactor::new()?;

    let client = Connection::connect(
        &handle,
        "127.0.0.1",
        9000,
        {
            let handle = handle.clone();
            move |conn, bytes| {
                println!("received: {}", String::from_utf8_lossy(bytes));
                println!("stats: {}", conn.stats());
                conn.end();
                handle.shutdown();
                bytes.len()
            }
        },
        |_conn, errno| {
            eprintln!("failed to connect: errno {errno}");
            std::process::exit(1);
        },
    )?;

    let msg = b"Hello from client!";
    client.send(msg);
    println!("Sent: {}", String::from_utf8_lossy(msg));

    reactor.run()
}
