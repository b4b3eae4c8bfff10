/// Lifecycle of a connection.
///
/// A connection starts in `Init` and only ever moves forward:
///
/// - `Init -> Connecting` when a non-blocking connect is issued (or a
///   listen succeeds, which jumps straight to `Connected`),
/// - `Connecting -> Connected` once the socket reports writability with
///   no pending `SO_ERROR`,
/// - `Connected -> Closing` on [`end`] or on a fatal I/O error,
/// - `Closing -> Closed` once buffered output is flushed (graceful) or
///   immediately (abrupt).
///
/// `Closed` is terminal: no transition leaves it, no callback fires
/// after it is reached, and `send`/`end` on a closed connection are
/// deterministic no-ops.
///
/// Listening sockets are modeled as `Connected`: they sit permanently
/// "ready to accept" and route accept readiness through the on-connect
/// callback instead of on-recv.
///
/// [`end`]: crate::Connection::end
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ConnState {
    /// Created, no syscall issued yet.
    Init,

    /// Non-blocking connect in flight.
    Connecting,

    /// Byte traffic (or accepts, for listeners) can flow.
    Connected,

    /// Draining buffered output before the descriptor closes.
    Closing,

    /// Terminal. The descriptor is closed or queued for close.
    Closed,
}
