use crate::conn::Connection;

use std::os::fd::RawFd;

/// A request submitted to the reactor through its handle.
///
/// Connections never touch the poller directly; every interest change
/// travels through this channel so the dispatch loop stays the single
/// writer of the registration table.
pub(crate) enum Command {
    /// Add a connection to the registration table and the poller.
    Register(Connection),

    /// Re-derive the interest of a registered connection and update the
    /// poller if it changed.
    Update { token: usize },

    /// Remove a registration, then close its descriptor.
    ///
    /// The close happens after poller removal so the descriptor number
    /// cannot be reused by a new registration in between. `id` guards
    /// against the token having been reused by a newer connection while
    /// the command sat in the queue; the descriptor is the submitting
    /// connection's own and is closed regardless.
    Deregister { token: usize, id: u64, fd: RawFd },

    /// Stop the dispatch loop, closing everything still registered.
    Shutdown,
}
