//! Byte counters for a relay session

use std::sync::atomic::{AtomicU64, Ordering};

/// Thread-safe, monotonically increasing byte counters.
///
/// "Received" counts bytes read from the remote relay session and
/// "transmitted" counts bytes sent to it.
#[derive(Debug, Default)]
pub struct NetworkStatistics {
    bytes_received: AtomicU64,
    bytes_transmitted: AtomicU64,
}

impl NetworkStatistics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a completed receive of `bytes`
    pub fn on_receive_completed(&self, bytes: u64) {
        self.bytes_received.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Record a completed transmit of `bytes`
    pub fn on_transmit_completed(&self, bytes: u64) {
        self.bytes_transmitted.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn bytes_received(&self) -> u64 {
        self.bytes_received.load(Ordering::Relaxed)
    }

    pub fn bytes_transmitted(&self) -> u64 {
        self.bytes_transmitted.load(Ordering::Relaxed)
    }
}
