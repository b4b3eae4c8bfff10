/// A readiness event reported by the poller.
///
/// `token` identifies the registration inside the reactor's table.
/// The flags are level-triggered: they describe a condition that may
/// persist across consecutive polls, not an edge.
pub(crate) struct Event {
    /// Token of the registered descriptor.
    pub(crate) token: usize,

    /// The descriptor can be read (or accepted) from without blocking.
    /// Peer hang-up is folded in here so the read path sees the EOF.
    pub(crate) readable: bool,

    /// The descriptor can be written to without blocking.
    pub(crate) writable: bool,

    /// The descriptor carries a pending socket error.
    pub(crate) error: bool,
}
