//! Module with the Lamport clock that orders requests between peers.

/// Lamport timestamp.
pub type Timestamp = u64;

/// Largest timestamp accepted from a peer.
///
/// Ticking saturates at `Timestamp::MAX`, so a remote value near it would
/// freeze the clock. Capping inbound values at half the range leaves room for
/// more local ticks than a node can ever make.
pub const MAX_REMOTE_TIMESTAMP: Timestamp = Timestamp::MAX / 2;

/// Struct that represents a monotonic logical clock.
///
/// The clock carries no lock of its own: it lives inside the coordinator state
/// and is only touched while that state is locked.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LogicalClock(Timestamp);

impl LogicalClock {
    pub fn new() -> Self {
        Self(0)
    }

    /// Function that returns the current value without advancing the clock.
    pub fn now(&self) -> Timestamp {
        self.0
    }

    /// Function that advances the clock for a local event.
    ///
    /// Strictly increasing as long as remote values stay within
    /// [`MAX_REMOTE_TIMESTAMP`].
    pub fn tick(&mut self) -> Timestamp {
        self.0 = self.0.saturating_add(1);
        self.0
    }

    /// Function that merges a timestamp received from a peer.
    ///
    /// The result is `max(local, remote) + 1`.
    pub fn observe(&mut self, remote: Timestamp) -> Timestamp {
        self.0 = self.0.max(remote);
        self.tick()
    }
}
