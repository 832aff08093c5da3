//! Router statistics
//!
//! Counters are plain atomics so hot paths (send, build) never take a lock
//! just to count. `RouterStats` is the serializable snapshot handed out by
//! `OnionRouter::get_stats`.

use crate::error::{OnionError, Result};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

/// Snapshot of router activity
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouterStats {
    /// This router's id
    pub node_id: String,
    /// Circuits currently in the table
    pub active_circuits: usize,
    /// Encrypted bytes handed to the transport, all circuits ever
    pub total_bytes_sent: u64,
    /// Circuits successfully built
    pub circuits_built: u64,
    /// Build attempts that failed
    pub circuits_failed: u64,
    /// Circuits closed (explicitly or by rotation)
    pub circuits_closed: u64,
    /// Circuits closed by rotation
    pub circuits_rotated: u64,
    /// Relays in the current directory snapshot
    pub relays_known: usize,
    /// Guards in the current directory snapshot
    pub guards_known: usize,
    /// Registered hidden services
    pub hidden_services: usize,
}

impl RouterStats {
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self)
            .map_err(|e| OnionError::InvalidState(format!("Failed to serialize stats: {}", e)))
    }
}

/// Lifetime counters owned by the router
#[derive(Debug, Default)]
pub struct RouterCounters {
    bytes_sent: AtomicU64,
    circuits_built: AtomicU64,
    circuits_failed: AtomicU64,
    circuits_closed: AtomicU64,
    circuits_rotated: AtomicU64,
}

impl RouterCounters {
    pub fn add_bytes_sent(&self, bytes: usize) {
        self.bytes_sent.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn circuit_built(&self) {
        self.circuits_built.fetch_add(1, Ordering::Relaxed);
    }

    pub fn circuit_failed(&self) {
        self.circuits_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn circuit_closed(&self) {
        self.circuits_closed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn circuits_rotated(&self, count: usize) {
        self.circuits_rotated.fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent.load(Ordering::Relaxed)
    }

    /// Fill the counter fields of `stats`
    pub fn fill(&self, stats: &mut RouterStats) {
        stats.total_bytes_sent = self.bytes_sent.load(Ordering::Relaxed);
        stats.circuits_built = self.circuits_built.load(Ordering::Relaxed);
        stats.circuits_failed = self.circuits_failed.load(Ordering::Relaxed);
        stats.circuits_closed = self.circuits_closed.load(Ordering::Relaxed);
        stats.circuits_rotated = self.circuits_rotated.load(Ordering::Relaxed);
    }
}
