//! Lock-free traffic counters shared by every relay loop

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

/// Point-in-time copy of the counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrafficSnapshot {
    /// Bytes delivered to local clients
    pub received_bytes: u64,
    /// Plaintext bytes read from local clients
    pub sent_bytes: u64,
}

impl TrafficSnapshot {
    /// Growth since `earlier`; a reset in between counts from zero
    pub fn delta_since(&self, earlier: &TrafficSnapshot) -> TrafficSnapshot {
        TrafficSnapshot {
            received_bytes: self
                .received_bytes
                .checked_sub(earlier.received_bytes)
                .unwrap_or(self.received_bytes),
            sent_bytes: self
                .sent_bytes
                .checked_sub(earlier.sent_bytes)
                .unwrap_or(self.sent_bytes),
        }
    }

    pub fn is_zero(&self) -> bool {
        self.received_bytes == 0 && self.sent_bytes == 0
    }
}

/// Monotonic byte counters, updated per relayed chunk
#[derive(Debug, Default)]
pub struct TrafficStats {
    received_bytes: AtomicU64,
    sent_bytes: AtomicU64,
}

impl TrafficStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_received(&self, bytes: u64) {
        self.received_bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn add_sent(&self, bytes: u64) {
        self.sent_bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn received_bytes(&self) -> u64 {
        self.received_bytes.load(Ordering::Relaxed)
    }

    pub fn sent_bytes(&self) -> u64 {
        self.sent_bytes.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> TrafficSnapshot {
        TrafficSnapshot {
            received_bytes: self.received_bytes(),
            sent_bytes: self.sent_bytes(),
        }
    }

    pub fn reset(&self) {
        self.received_bytes.store(0, Ordering::Relaxed);
        self.sent_bytes.store(0, Ordering::Relaxed);
    }
}
