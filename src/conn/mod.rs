//! The connection engine.
//!
//! A [`Connection`] owns one non-blocking socket, a fixed scratch
//! region for received bytes, and a bounded [`RingBuffer`] of pending
//! outbound bytes. The reactor drives it through readiness handlers;
//! the application drives it through `send`/`end` and the callback
//! setters. Both sides share the engine through a cloneable handle over
//! `Arc<Mutex<..>>`, and the engine assumes they are serialized onto
//! one thread (or externally serialized).
//!
//! No engine lock is held while an application callback runs: each
//! callback is taken out of its slot, invoked, and restored afterwards
//! unless it was replaced or the connection closed in the meantime.

mod state;
mod stats;

pub use state::ConnState;
pub use stats::ConnStats;

use crate::reactor::ReactorHandle;
use crate::reactor::command::Command;
use crate::reactor::poller::common::Interest;
use crate::ring::RingBuffer;
use crate::sys::{
    address_family, sys_accept, sys_bind, sys_close, sys_connect, sys_listen, sys_peername,
    sys_read, sys_set_reuseaddr, sys_setup_v6, sys_shutdown, sys_socket, sys_sockname,
    sys_take_error, sys_write,
};

use std::io;
use std::mem;
use std::net::{Shutdown, SocketAddr, ToSocketAddrs};
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::{debug, trace};

/// Default capacity of the receive scratch region and the send ring.
pub const DEFAULT_BUF_SIZE: usize = 64 * 1024;

/// Receive callback. Gets the unconsumed bytes (earlier remainder
/// first, newly read bytes after) and returns how many it consumed;
/// the rest is redelivered later, in order, while the connection stays
/// open. Bytes still unconsumed after the final delivery at EOF are
/// discarded with the connection.
pub type RecvFn = Box<dyn FnMut(&Connection, &[u8]) -> usize + Send>;

/// Error callback, invoked with the raw OS error code right before the
/// connection closes abruptly.
pub type ErrorFn = Box<dyn FnMut(&Connection, i32) + Send>;

/// Drain callback, invoked when a previously backed-up send ring has
/// been fully flushed to the kernel.
pub type DrainFn = Box<dyn FnMut(&Connection) + Send>;

/// Accept callback for listening connections, invoked once per
/// accepted connection with its new, already registered handle.
pub type ConnectFn = Box<dyn FnMut(Connection) + Send>;

/// Process-wide id source. Ids are unique and monotonically
/// increasing within one process; they are never reused and never
/// persisted across restarts.
static NEXT_ID: AtomicU64 = AtomicU64::new(1);

/// Outcome of pushing the ring at the kernel once.
enum Flush {
    /// Nothing was buffered.
    Idle,
    /// The ring went from non-empty to empty.
    Drained,
    /// The kernel took some bytes; more remain.
    Partial,
    /// The kernel took nothing; wait for writability.
    WouldBlock,
    /// The write failed with this errno.
    Failed(i32),
}

struct Inner {
    id: u64,
    fd: RawFd,
    server: bool,
    state: ConnState,

    /// Registration token, assigned by the reactor.
    token: Option<usize>,
    handle: ReactorHandle,

    local_addr: Option<SocketAddr>,
    peer_addr: Option<SocketAddr>,

    /// Scratch region for received bytes. `recv_offset..recv_offset +
    /// recv_len` is the unconsumed remainder; new reads land after it.
    recv_buf: Vec<u8>,
    recv_offset: usize,
    recv_len: usize,
    /// Guards against re-entrant delivery while the recv callback runs.
    in_recv: bool,

    send_ring: RingBuffer,

    on_connect: Option<ConnectFn>,
    on_recv: Option<RecvFn>,
    on_error: Option<ErrorFn>,
    on_drain: Option<DrainFn>,

    stats: ConnStats,
}

impl Inner {
    fn new(handle: ReactorHandle, fd: RawFd, server: bool) -> Self {
        Self {
            id: NEXT_ID.fetch_add(1, Ordering::Relaxed),
            fd,
            server,
            state: ConnState::Init,
            token: None,
            handle,
            local_addr: None,
            peer_addr: None,
            recv_buf: vec![0u8; DEFAULT_BUF_SIZE],
            recv_offset: 0,
            recv_len: 0,
            in_recv: false,
            send_ring: RingBuffer::with_capacity(DEFAULT_BUF_SIZE),
            on_connect: None,
            on_recv: None,
            on_error: None,
            on_drain: None,
            stats: ConnStats::default(),
        }
    }

    /// Interest derived from the current buffering state. Read while
    /// the scratch region can hold more, write while output is pending
    /// (or a connect is in flight).
    fn desired_interest(&self) -> Interest {
        match self.state {
            ConnState::Connecting => Interest {
                read: false,
                write: true,
            },
            ConnState::Connected => {
                if self.server {
                    Interest {
                        read: true,
                        write: false,
                    }
                } else {
                    Interest {
                        read: self.recv_len < self.recv_buf.len(),
                        write: !self.send_ring.is_empty(),
                    }
                }
            }
            ConnState::Closing => Interest {
                read: false,
                write: !self.send_ring.is_empty(),
            },
            ConnState::Init | ConnState::Closed => Interest::NONE,
        }
    }

    fn submit_update(&self) {
        if let Some(token) = self.token {
            self.handle.submit(Command::Update { token });
        }
    }

    /// One `write` syscall against the front of the ring.
    fn flush_once(&mut self) -> Flush {
        if self.send_ring.is_empty() {
            return Flush::Idle;
        }

        let fd = self.fd;
        let result = {
            let run = self.send_ring.peek();
            sys_write(fd, run)
        };

        match result {
            Ok(n) => {
                self.send_ring.consume(n);
                self.stats.send_bytes += n as u64;
                trace!(id = self.id, n, "sent");

                if self.send_ring.is_empty() {
                    Flush::Drained
                } else {
                    Flush::Partial
                }
            }
            Err(ref e) if transient(e) => Flush::WouldBlock,
            Err(e) => {
                self.stats.send_errors += 1;
                Flush::Failed(os_errno(&e))
            }
        }
    }

    /// Terminal transition. Drops every callback so none can fire
    /// again, then hands the descriptor to the reactor for close (or
    /// closes it directly when it was never registered).
    fn close_now(&mut self) {
        if self.state == ConnState::Closed {
            return;
        }

        self.state = ConnState::Closed;
        self.send_ring.clear();
        self.recv_offset = 0;
        self.recv_len = 0;

        self.on_connect = None;
        self.on_recv = None;
        self.on_error = None;
        self.on_drain = None;

        match self.token {
            // If the reactor is already gone the descriptor is closed
            // here rather than through deregistration.
            Some(token)
                if self.handle.submit(Command::Deregister {
                    token,
                    id: self.id,
                    fd: self.fd,
                }) => {}
            _ => sys_close(self.fd),
        }

        debug!(id = self.id, "closed");
    }
}

/// A non-blocking TCP connection driven by a [`Reactor`].
///
/// Cloning is shallow: every clone refers to the same engine. The
/// reactor keeps one clone alive while interest is registered, so the
/// descriptor outlives application handles until the connection closes.
///
/// [`Reactor`]: crate::Reactor
pub struct Connection {
    inner: Arc<Mutex<Inner>>,
}

impl Clone for Connection {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl Connection {
    fn from_inner(inner: Inner) -> Self {
        Self {
            inner: Arc::new(Mutex::new(inner)),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap()
    }

    /// Connects to `host:port` and registers the connection with the
    /// reactor behind `handle`.
    ///
    /// Returns as soon as the non-blocking connect is issued; the
    /// connection is usually still [`Connecting`](ConnState::Connecting)
    /// at that point. Data passed to [`send`](Self::send) before the
    /// connect completes is buffered and flushed on completion. A
    /// failed connect is reported once through `error_fn` and the
    /// connection closes; there is no automatic retry.
    pub fn connect(
        handle: &ReactorHandle,
        host: &str,
        port: u16,
        recv_fn: impl FnMut(&Connection, &[u8]) -> usize + Send + 'static,
        error_fn: impl FnMut(&Connection, i32) + Send + 'static,
    ) -> io::Result<Connection> {
        let addr = resolve(host, port)?;
        let fd = sys_socket(address_family(&addr))?;

        let setup = sys_set_reuseaddr(fd).and_then(|_| sys_setup_v6(fd, address_family(&addr)));
        if let Err(e) = setup {
            sys_close(fd);
            return Err(e);
        }

        let state = match sys_connect(fd, &addr) {
            Ok(()) => ConnState::Connected,
            Err(ref e) if e.raw_os_error() == Some(libc::EINPROGRESS) => ConnState::Connecting,
            Err(e) => {
                sys_close(fd);
                return Err(e);
            }
        };

        let mut inner = Inner::new(handle.clone(), fd, false);
        inner.state = state;
        inner.peer_addr = Some(addr);
        inner.local_addr = sys_sockname(fd).ok();
        inner.on_recv = Some(Box::new(recv_fn));
        inner.on_error = Some(Box::new(error_fn));

        let conn = Connection::from_inner(inner);
        debug!(id = conn.id(), %addr, ?state, "connect issued");

        handle.submit(Command::Register(conn.clone()));
        Ok(conn)
    }

    /// Binds and listens on `host:port`.
    ///
    /// The listening connection is modeled as
    /// [`Connected`](ConnState::Connected); accept readiness routes
    /// through `connect_fn`, which receives each accepted connection
    /// already registered with the reactor. One readiness notification
    /// may yield several accepted connections.
    pub fn listen(
        handle: &ReactorHandle,
        host: &str,
        port: u16,
        connect_fn: impl FnMut(Connection) + Send + 'static,
    ) -> io::Result<Connection> {
        let addr = resolve(host, port)?;
        let fd = sys_socket(address_family(&addr))?;

        let mut inner = Inner::new(handle.clone(), fd, true);
        inner.on_connect = Some(Box::new(connect_fn));
        let conn = Connection::from_inner(inner);

        let setup = sys_set_reuseaddr(fd)
            .and_then(|_| sys_setup_v6(fd, address_family(&addr)))
            .and_then(|_| sys_bind(fd, &addr))
            .and_then(|_| sys_listen(fd));

        if let Err(e) = setup {
            let mut inner = conn.lock();
            inner.stats.listen_errors += 1;
            inner.close_now();
            return Err(e);
        }

        {
            let mut inner = conn.lock();
            inner.state = ConnState::Connected;
            inner.local_addr = sys_sockname(fd).ok();
        }

        debug!(id = conn.id(), local = ?conn.local_addr(), "listening");

        handle.submit(Command::Register(conn.clone()));
        Ok(conn)
    }

    /// Wraps a freshly accepted descriptor.
    fn from_accepted(handle: &ReactorHandle, fd: RawFd, peer: SocketAddr) -> Connection {
        let mut inner = Inner::new(handle.clone(), fd, false);
        inner.state = ConnState::Connected;
        inner.local_addr = sys_sockname(fd).ok();
        inner.peer_addr = Some(peer);

        Connection::from_inner(inner)
    }

    /// Buffers `bytes` for transmission and returns how many were
    /// accepted.
    ///
    /// The returned count is authoritative: a short count means the
    /// send ring is full and the caller must retry the remainder after
    /// the drain callback fires. Nothing is ever silently dropped. If
    /// the ring was empty and the connection is established, one
    /// immediate best-effort write is attempted before returning;
    /// whatever the kernel does not take waits for writability. Never
    /// blocks. Returns `0` on listening, closing, or closed
    /// connections.
    pub fn send(&self, bytes: &[u8]) -> usize {
        let mut inner = self.lock();

        if inner.server {
            return 0;
        }
        match inner.state {
            ConnState::Connecting | ConnState::Connected => {}
            _ => return 0,
        }

        let was_empty = inner.send_ring.is_empty();
        let accepted = inner.send_ring.put(bytes);

        if accepted < bytes.len() {
            trace!(
                id = inner.id,
                accepted,
                requested = bytes.len(),
                "send ring full"
            );
        }

        if accepted > 0 && was_empty && inner.state == ConnState::Connected {
            if let Flush::Failed(errno) = inner.flush_once() {
                drop(inner);
                self.fail(errno);
                return accepted;
            }
        }

        inner.submit_update();
        accepted
    }

    /// Shuts the connection down gracefully.
    ///
    /// No further `send` calls are accepted. Buffered output is still
    /// flushed before the descriptor closes; when nothing is buffered
    /// the close happens immediately. Idempotent, and a no-op once
    /// [`Closed`](ConnState::Closed).
    pub fn end(&self) {
        let mut inner = self.lock();

        match inner.state {
            ConnState::Closed | ConnState::Closing => {}
            ConnState::Init | ConnState::Connecting => inner.close_now(),
            ConnState::Connected => {
                if inner.server {
                    inner.close_now();
                } else if inner.send_ring.is_empty() {
                    let _ = sys_shutdown(inner.fd, Shutdown::Write);
                    inner.close_now();
                } else {
                    inner.state = ConnState::Closing;
                    inner.submit_update();
                    debug!(
                        id = inner.id,
                        pending = inner.send_ring.len(),
                        "closing after flush"
                    );
                }
            }
        }
    }

    /// Replaces the receive callback.
    ///
    /// Takes effect for subsequent deliveries; any unconsumed remainder
    /// is delivered to the new callback right away.
    pub fn set_recv_fn(&self, f: impl FnMut(&Connection, &[u8]) -> usize + Send + 'static) {
        {
            let mut inner = self.lock();
            if inner.state == ConnState::Closed {
                return;
            }
            inner.on_recv = Some(Box::new(f));
            inner.submit_update();
        }

        self.deliver_pending();
    }

    /// Replaces the error callback.
    pub fn set_error_fn(&self, f: impl FnMut(&Connection, i32) + Send + 'static) {
        let mut inner = self.lock();
        if inner.state != ConnState::Closed {
            inner.on_error = Some(Box::new(f));
        }
    }

    /// Replaces the drain callback.
    pub fn set_drain_fn(&self, f: impl FnMut(&Connection) + Send + 'static) {
        let mut inner = self.lock();
        if inner.state != ConnState::Closed {
            inner.on_drain = Some(Box::new(f));
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ConnState {
        self.lock().state
    }

    /// Process-unique connection id.
    pub fn id(&self) -> u64 {
        self.lock().id
    }

    /// Snapshot of the counters.
    pub fn stats(&self) -> ConnStats {
        self.lock().stats
    }

    /// Local address, once known.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.lock().local_addr
    }

    /// Remote address. `None` for listening connections.
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.lock().peer_addr
    }

    /// `true` for listening connections.
    pub fn is_listener(&self) -> bool {
        self.lock().server
    }

    // --- reactor-facing surface -------------------------------------

    pub(crate) fn registration_fd(&self) -> RawFd {
        self.lock().fd
    }

    /// Accepts the reactor's token, or refuses when the connection
    /// closed while the registration command was still queued (the
    /// descriptor is gone and must not be registered).
    pub(crate) fn begin_registration(&self, token: usize) -> bool {
        let mut inner = self.lock();
        if inner.state == ConnState::Closed {
            return false;
        }
        inner.token = Some(token);
        true
    }

    pub(crate) fn desired_interest(&self) -> Interest {
        self.lock().desired_interest()
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.lock().state == ConnState::Closed
    }

    /// Shutdown path: mark closed without submitting commands; the
    /// reactor deregisters and closes the descriptor itself.
    pub(crate) fn force_close(&self) {
        let mut inner = self.lock();
        if inner.state == ConnState::Closed {
            return;
        }
        inner.token = None;
        inner.state = ConnState::Closed;
        inner.send_ring.clear();
        inner.recv_offset = 0;
        inner.recv_len = 0;
        inner.on_connect = None;
        inner.on_recv = None;
        inner.on_error = None;
        inner.on_drain = None;
    }

    /// Registration failure funnel used by the reactor.
    pub(crate) fn fail_registration(&self, errno: i32) {
        self.lock().stats.sys_errors += 1;
        self.fail(errno);
    }

    /// Read-readiness handler. Accepts on listeners; reads, delivers,
    /// and detects EOF on traffic connections. Safe to call repeatedly
    /// while the condition persists.
    pub(crate) fn handle_readable(&self) {
        if self.lock().server {
            self.accept_ready();
            return;
        }

        let mut inner = self.lock();
        if inner.state != ConnState::Connected {
            return;
        }

        // Compact so new bytes land after the unconsumed remainder.
        if inner.recv_len == 0 {
            inner.recv_offset = 0;
        } else if inner.recv_offset > 0
            && inner.recv_offset + inner.recv_len == inner.recv_buf.len()
        {
            let (off, len) = (inner.recv_offset, inner.recv_len);
            inner.recv_buf.copy_within(off..off + len, 0);
            inner.recv_offset = 0;
        }

        let mut eof = false;
        let write_at = inner.recv_offset + inner.recv_len;

        if write_at < inner.recv_buf.len() {
            let fd = inner.fd;
            let result = sys_read(fd, &mut inner.recv_buf[write_at..]);

            match result {
                Ok(0) => eof = true,
                Ok(n) => {
                    inner.recv_len += n;
                    inner.stats.recv_bytes += n as u64;
                    trace!(id = inner.id, n, "received");
                }
                Err(ref e) if transient(e) => {}
                Err(e) => {
                    inner.stats.recv_errors += 1;
                    let errno = os_errno(&e);
                    drop(inner);
                    self.fail(errno);
                    return;
                }
            }
        }

        drop(inner);
        self.deliver_pending();

        if eof {
            // Orderly peer shutdown: close with no error callback. The
            // delivery above was the callback's last look at the
            // remainder; whatever it declined is discarded.
            let mut inner = self.lock();
            debug!(id = inner.id, "peer closed");
            inner.close_now();
        }
    }

    /// Write-readiness handler. Completes an in-flight connect, then
    /// pushes the ring at the kernel one syscall per notification.
    pub(crate) fn handle_writable(&self) {
        let mut inner = self.lock();

        match inner.state {
            ConnState::Connecting => {
                let fd = inner.fd;
                let errno = match sys_take_error(fd) {
                    Ok(code) => code,
                    Err(e) => os_errno(&e),
                };

                if errno != 0 {
                    inner.stats.sys_errors += 1;
                    drop(inner);
                    self.fail(errno);
                    return;
                }

                inner.state = ConnState::Connected;
                inner.local_addr = sys_sockname(fd).ok();
                if inner.peer_addr.is_none() {
                    inner.peer_addr = sys_peername(fd).ok();
                }
                debug!(id = inner.id, "connected");

                // Flush anything queued while the connect was pending.
                self.flush(inner);
            }
            ConnState::Connected | ConnState::Closing => self.flush(inner),
            _ => {}
        }
    }

    /// Error-readiness handler: resolve the pending socket error and
    /// close through the error funnel.
    pub(crate) fn handle_socket_error(&self) {
        let mut inner = self.lock();
        if inner.state == ConnState::Closed {
            return;
        }

        let errno = match sys_take_error(inner.fd) {
            // Error event with nothing pending reads as a reset peer.
            Ok(0) => libc::ECONNRESET,
            Ok(code) => code,
            Err(e) => os_errno(&e),
        };

        inner.stats.sys_errors += 1;
        drop(inner);
        self.fail(errno);
    }

    /// Fatal-error funnel: report once through the error callback, then
    /// close abruptly, discarding buffered output. The category counter
    /// is the caller's responsibility.
    pub(crate) fn fail(&self, errno: i32) {
        let cb = {
            let mut inner = self.lock();
            if inner.state == ConnState::Closed {
                return;
            }
            // Block sends while the callback runs.
            inner.state = ConnState::Closing;
            inner.send_ring.clear();
            inner.on_error.take()
        };

        debug!(errno, "connection failed");

        if let Some(mut cb) = cb {
            cb(self, errno);
        }

        self.lock().close_now();
    }

    fn flush(&self, mut inner: MutexGuard<'_, Inner>) {
        match inner.flush_once() {
            Flush::Drained => {
                if inner.state == ConnState::Closing {
                    let _ = sys_shutdown(inner.fd, Shutdown::Write);
                    inner.close_now();
                    return;
                }

                let Some(mut cb) = inner.on_drain.take() else {
                    return;
                };
                drop(inner);

                cb(self);

                let mut inner = self.lock();
                let state = inner.state;
                restore(&mut inner.on_drain, state, cb);
            }
            Flush::Idle | Flush::Partial | Flush::WouldBlock => {}
            Flush::Failed(errno) => {
                drop(inner);
                self.fail(errno);
            }
        }
    }

    /// Drains the accept queue, one connection per iteration, until
    /// the kernel reports would-block.
    fn accept_ready(&self) {
        loop {
            let mut inner = self.lock();
            if inner.state != ConnState::Connected {
                return;
            }
            let fd = inner.fd;

            match sys_accept(fd) {
                Ok((child_fd, peer)) => {
                    inner.stats.accepts += 1;
                    let handle = inner.handle.clone();
                    drop(inner);

                    let child = Connection::from_accepted(&handle, child_fd, peer);
                    debug!(id = child.id(), fd = child_fd, %peer, "accepted");
                    handle.submit(Command::Register(child.clone()));

                    let mut inner = self.lock();
                    let Some(mut cb) = inner.on_connect.take() else {
                        continue;
                    };
                    drop(inner);

                    cb(child);

                    let mut inner = self.lock();
                    let state = inner.state;
                    restore(&mut inner.on_connect, state, cb);
                }
                Err(ref e) if transient(e) => return,
                Err(e) => {
                    inner.stats.accept_errors += 1;
                    let errno = os_errno(&e);
                    drop(inner);
                    self.fail(errno);
                    return;
                }
            }
        }
    }

    /// Hands the unconsumed scratch region to the receive callback and
    /// advances past what it consumed.
    fn deliver_pending(&self) {
        let mut inner = self.lock();
        if inner.state != ConnState::Connected || inner.recv_len == 0 || inner.in_recv {
            return;
        }
        let Some(mut cb) = inner.on_recv.take() else {
            return;
        };

        // The scratch region is moved out for the duration of the call
        // so the callback can re-enter `send`/`end` without deadlock.
        let buf = mem::take(&mut inner.recv_buf);
        let (off, len) = (inner.recv_offset, inner.recv_len);
        inner.in_recv = true;
        drop(inner);

        let consumed = cb(self, &buf[off..off + len]).min(len);
        trace!(delivered = len, consumed, "recv delivered");

        let mut inner = self.lock();
        inner.in_recv = false;
        inner.recv_buf = buf;

        if inner.state == ConnState::Closed {
            return;
        }

        inner.recv_offset += consumed;
        inner.recv_len -= consumed;
        if inner.recv_len == 0 {
            inner.recv_offset = 0;
        }

        // Consumption may re-enable read interest (the scratch region
        // had filled up); make sure the reactor re-derives it.
        inner.submit_update();

        let state = inner.state;
        restore(&mut inner.on_recv, state, cb);
    }
}

impl Drop for Connection {
    /// The descriptor is closed when the last handle goes away before
    /// the connection ever closed (the reactor's table clone keeps
    /// registered connections out of this path).
    fn drop(&mut self) {
        if Arc::strong_count(&self.inner) == 1 {
            let mut inner = match self.inner.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };

            if inner.state != ConnState::Closed {
                inner.state = ConnState::Closed;
                sys_close(inner.fd);
            }
        }
    }
}

/// Restores a taken callback unless it was replaced during the call or
/// the connection closed.
fn restore<T>(slot: &mut Option<T>, state: ConnState, cb: T) {
    if state != ConnState::Closed && slot.is_none() {
        *slot = Some(cb);
    }
}

/// Would-block and interrupted are transient: they re-arm readiness
/// interest and are never surfaced as errors.
fn transient(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
    )
}

fn os_errno(e: &io::Error) -> i32 {
    e.raw_os_error().unwrap_or(libc::EIO)
}

fn resolve(host: &str, port: u16) -> io::Result<SocketAddr> {
    (host, port).to_socket_addrs()?.next().ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            "host resolved to no addresses",
        )
    })
}
