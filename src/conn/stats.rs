use std::fmt;

/// Monotonic per-connection counters.
///
/// Returned by value from [`stats`] as a snapshot; counters never
/// decrease and are not persisted anywhere. Every syscall failure other
/// than would-block increments exactly one error counter.
///
/// [`stats`]: crate::Connection::stats
#[derive(Clone, Copy, Default, Debug)]
pub struct ConnStats {
    /// Connections accepted by a listening socket.
    pub accepts: u64,
    /// Payload bytes read off the wire.
    pub recv_bytes: u64,
    /// Payload bytes the kernel accepted for transmission.
    pub send_bytes: u64,

    /// Bind/listen setup failures.
    pub listen_errors: u64,
    /// `accept` failures.
    pub accept_errors: u64,
    /// `read` failures.
    pub recv_errors: u64,
    /// `write` failures.
    pub send_errors: u64,
    /// Failures outside the above categories (connect completion,
    /// poller registration, socket-level errors).
    pub sys_errors: u64,
}

impl fmt::Display for ConnStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{{accepts:{}, recv_bytes:{}, send_bytes:{}, listen_errors:{}, \
             accept_errors:{}, recv_errors:{}, send_errors:{}, sys_errors:{}}}",
            self.accepts,
            self.recv_bytes,
            self.send_bytes,
            self.listen_errors,
            self.accept_errors,
            self.recv_errors,
            self.send_errors,
            self.sys_errors,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::ConnStats;

    #[test]
    fn renders_summary() {
        let stats = ConnStats {
            accepts: 2,
            recv_bytes: 10,
            send_bytes: 4,
            ..Default::default()
        };

        assert_eq!(
            stats.to_string(),
            "{accepts:2, recv_bytes:10, send_bytes:4, listen_errors:0, \
             accept_errors:0, recv_errors:0, send_errors:0, sys_errors:0}"
        );
    }
}
