use std::os::fd::RawFd;

/// Readiness interest registered for a descriptor.
///
/// The connection recomputes its interest from its buffering state:
/// read while it is willing to consume input, write while the send ring
/// holds unflushed bytes or a connect is still in flight.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) struct Interest {
    pub(crate) read: bool,
    pub(crate) write: bool,
}

impl Interest {
    pub(crate) const NONE: Interest = Interest {
        read: false,
        write: false,
    };
}

/// Wake handle wrapping the poller's eventfd.
///
/// Writing to the eventfd interrupts a blocking `epoll_wait`, so a
/// command submitted from outside the dispatch loop is picked up
/// without waiting for the next readiness event.
pub(crate) struct Waker(pub(crate) RawFd);

unsafe impl Send for Waker {}
unsafe impl Sync for Waker {}
