//! Single-threaded readiness dispatch loop.
//!
//! The reactor owns the poller and a token-indexed table of registered
//! connections. Each poll turn it applies pending commands, waits for
//! readiness, and routes readable/writable/error notifications to the
//! owning connection's handlers. After every dispatch it re-derives the
//! connection's interest from its buffering state and updates the
//! poller when the interest changed.
//!
//! Handlers run on the reactor thread; the engine assumes all of its
//! methods are serialized onto that thread (or externally serialized),
//! and the reactor never invokes a handler for a deregistered
//! descriptor.

mod event;

pub(crate) mod command;
pub(crate) mod poller;

use command::Command;
use event::Event;
use poller::common::Interest;
use poller::{Poller, Waker};

use crate::conn::Connection;
use crate::sys::sys_close;

use std::io;
use std::os::fd::RawFd;
use std::sync::Arc;
use std::sync::mpsc::{Receiver, Sender, channel};
use std::time::Duration;

use tracing::{debug, trace, warn};

/// One registered connection plus the interest currently installed in
/// the poller for it.
struct Entry {
    conn: Connection,
    fd: RawFd,
    interest: Interest,
}

/// Token-indexed registration table with free-slot reuse.
struct Table {
    entries: Vec<Option<Entry>>,
    free: Vec<usize>,
}

impl Table {
    fn new() -> Self {
        Self {
            entries: Vec::new(),
            free: Vec::new(),
        }
    }

    fn insert(&mut self, entry: Entry) -> usize {
        if let Some(token) = self.free.pop() {
            self.entries[token] = Some(entry);
            token
        } else {
            self.entries.push(Some(entry));
            self.entries.len() - 1
        }
    }

    fn get_mut(&mut self, token: usize) -> Option<&mut Entry> {
        self.entries.get_mut(token)?.as_mut()
    }

    fn remove(&mut self, token: usize) -> Option<Entry> {
        let entry = self.entries.get_mut(token)?.take();
        if entry.is_some() {
            self.free.push(token);
        }
        entry
    }

    fn drain(&mut self) -> Vec<Entry> {
        self.free.clear();
        self.entries.drain(..).flatten().collect()
    }
}

/// Cloneable handle for submitting commands to a running reactor.
///
/// Connections hold one to request interest updates and deregistration;
/// applications hold one to create connections and to shut the loop
/// down. Submitting wakes the poller, so commands are picked up even
/// while the loop is blocked in `epoll_wait`.
#[derive(Clone)]
pub struct ReactorHandle {
    sender: Sender<Command>,
    waker: Arc<Waker>,
}

impl ReactorHandle {
    /// Queues a command and wakes the loop. Returns `false` when the
    /// reactor is gone and the command was dropped.
    pub(crate) fn submit(&self, command: Command) -> bool {
        if self.sender.send(command).is_err() {
            return false;
        }
        self.waker.wake();
        true
    }

    /// Asks the reactor to stop, closing every registered connection.
    pub fn shutdown(&self) {
        self.submit(Command::Shutdown);
    }
}

/// The dispatch loop. Create one per thread of I/O, hand its
/// [`ReactorHandle`] to connections, then call [`run`](Self::run).
pub struct Reactor {
    receiver: Receiver<Command>,

    poller: Poller,
    events: Vec<Event>,

    table: Table,
}

impl Reactor {
    /// Creates a reactor and the handle used to reach it.
    pub fn new() -> io::Result<(Self, ReactorHandle)> {
        let (sender, receiver) = channel();
        let poller = Poller::new()?;
        let waker = poller.waker();

        Ok((
            Self {
                receiver,
                poller,
                events: Vec::with_capacity(64),
                table: Table::new(),
            },
            ReactorHandle { sender, waker },
        ))
    }

    /// Runs the dispatch loop until a shutdown command arrives.
    pub fn run(&mut self) -> io::Result<()> {
        while self.turn(None)? {}
        Ok(())
    }

    /// Executes a single poll turn with an optional timeout.
    ///
    /// Returns `false` once a shutdown command has been processed.
    /// Useful for tests and for embedding the loop in a host program.
    pub fn poll_once(&mut self, timeout: Option<Duration>) -> io::Result<bool> {
        self.turn(timeout)
    }

    fn turn(&mut self, timeout: Option<Duration>) -> io::Result<bool> {
        while let Ok(command) = self.receiver.try_recv() {
            if !self.apply(command) {
                self.close_all();
                return Ok(false);
            }
        }

        self.poller.poll(&mut self.events, timeout)?;

        let mut events = std::mem::take(&mut self.events);
        for event in &events {
            self.dispatch(event);
        }
        events.clear();
        self.events = events;

        Ok(true)
    }

    /// Applies one command. Returns `false` on shutdown.
    fn apply(&mut self, command: Command) -> bool {
        match command {
            Command::Register(conn) => self.register(conn),

            Command::Update { token } => {
                if let Some(entry) = self.table.get_mut(token) {
                    let wanted = entry.conn.desired_interest();
                    if wanted != entry.interest {
                        trace!(token, ?wanted, "interest update");
                        if let Err(e) = self.poller.reregister(entry.fd, token, wanted) {
                            warn!(token, error = %e, "reregister failed");
                        } else {
                            entry.interest = wanted;
                        }
                    }
                }
            }

            Command::Deregister { token, id, fd } => {
                // Only a matching entry is removed; the descriptor is
                // the closing connection's own and closes either way.
                let matches = self
                    .table
                    .get_mut(token)
                    .is_some_and(|entry| entry.conn.id() == id);
                if matches {
                    self.table.remove(token);
                }

                debug!(id, fd, "deregister");
                self.poller.deregister(fd);
                sys_close(fd);
            }

            Command::Shutdown => return false,
        }

        true
    }

    fn register(&mut self, conn: Connection) {
        let fd = conn.registration_fd();
        let interest = conn.desired_interest();

        let token = self.table.insert(Entry {
            conn: conn.clone(),
            fd,
            interest,
        });

        // The connection may have closed while the command sat in the
        // queue; its descriptor is already closed and the number may
        // belong to a newer socket, so it must not reach the poller.
        if !conn.begin_registration(token) {
            debug!(id = conn.id(), "registration skipped, connection closed");
            self.table.remove(token);
            return;
        }

        if let Err(e) = self.poller.register(fd, token, interest) {
            warn!(id = conn.id(), fd, error = %e, "poller registration failed");
            self.table.remove(token);
            let errno = e.raw_os_error().unwrap_or(libc::EIO);
            conn.fail_registration(errno);
            return;
        }

        debug!(id = conn.id(), fd, token, "register");
    }

    fn dispatch(&mut self, event: &Event) {
        let conn = match self.table.get_mut(event.token) {
            Some(entry) => entry.conn.clone(),
            // Deregistered between poll and dispatch; drop the event.
            None => return,
        };

        if event.error {
            conn.handle_socket_error();
        }
        if event.readable && !conn.is_closed() {
            conn.handle_readable();
        }
        if event.writable && !conn.is_closed() {
            conn.handle_writable();
        }

        // Re-derive interest from the connection's buffering state.
        if let Some(entry) = self.table.get_mut(event.token) {
            let wanted = entry.conn.desired_interest();
            if wanted != entry.interest {
                if let Err(e) = self.poller.reregister(entry.fd, event.token, wanted) {
                    warn!(token = event.token, error = %e, "reregister failed");
                } else {
                    entry.interest = wanted;
                }
            }
        }
    }

    /// Shutdown path: force-close every connection still registered.
    fn close_all(&mut self) {
        for entry in self.table.drain() {
            debug!(id = entry.conn.id(), fd = entry.fd, "closing on shutdown");
            entry.conn.force_close();
            self.poller.deregister(entry.fd);
            sys_close(entry.fd);
        }
    }
}
