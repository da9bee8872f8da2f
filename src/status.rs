//! Server status reporting.

/// Snapshot of daemon state, reported to a client on request and logged on
/// `SIGUSR1`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServerStatus {
    /// Process id of the daemon.
    pub pid: i32,
    /// Bitmask of attached crates (bit n set => crate n attached).
    pub crates: u32,
    /// Number of connected clients, including the one asking.
    pub clients: u32,
    /// Number of active subscriptions.
    pub irq_requests: u32,
}

impl std::fmt::Display for ServerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "pid={} crates=0x{:04X} clients={} irq_requests={}",
            self.pid, self.crates, self.clients, self.irq_requests
        )
    }
}
