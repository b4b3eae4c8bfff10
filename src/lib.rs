//! # evsock
//!
//! **evsock** is a callback-driven, non-blocking TCP socket engine for the
//! **Nebula** ecosystem.
//!
//! Instead of futures and tasks, evsock multiplexes kernel readiness
//! notifications into a small set of application callbacks: on-receive,
//! on-drain, on-error, and (for listeners) on-connect. Each connection
//! carries a bounded circular send buffer, so a slow peer surfaces as
//! backpressure rather than unbounded queueing, and a fixed receive
//! scratch region whose unconsumed remainder is redelivered in order.
//!
//! The engine is built around three pieces:
//!
//! - A **[`RingBuffer`]** holding bytes accepted from the application but
//!   not yet written to the socket
//! - A **[`Connection`]** owning one descriptor, its buffers, its
//!   lifecycle state machine, and the registered callbacks
//! - A **[`Reactor`]**, a single-threaded level-triggered dispatch loop
//!   (epoll on Linux) that routes readiness to connection handlers
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use evsock::{Connection, Reactor};
//!
//! let (mut reactor, handle) = Reactor::new()?;
//!
//! let _server = Connection::listen(&handle, "127.0.0.1", 9000, |conn| {
//!     conn.set_recv_fn(|conn, bytes| {
//!         // Echo everything back; report all bytes consumed.
//!         conn.send(bytes);
//!         bytes.len()
//!     });
//! })?;
//!
//! reactor.run()?;
//! ```
//!
//! ## Threading model
//!
//! The engine holds no locks of its own beyond the shared handle: all
//! readiness handlers run on the reactor thread, and applications are
//! expected to call `send`/`end` from that thread or to serialize their
//! calls externally. Nothing in the API ever blocks the caller.

mod conn;
mod reactor;
mod ring;
mod sys;

pub use conn::{ConnState, ConnStats, Connection, DEFAULT_BUF_SIZE};
pub use conn::{ConnectFn, DrainFn, ErrorFn, RecvFn};
pub use reactor::{Reactor, ReactorHandle};
pub use ring::RingBuffer;
