//! Server activity counters.
//!
//! Thread-safe, lock-free tallies of file operations, replication
//! traffic, and errors. The garbage collector feeds its sweep results
//! in through the observer installed by the file server.

use peervault_storage::SweepStats;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

/// Counters maintained by one file server.
#[derive(Debug, Default)]
pub struct ServerMetrics {
    blobs_stored: AtomicU64,
    blobs_fetched: AtomicU64,
    blobs_served: AtomicU64,
    blobs_deleted: AtomicU64,
    replicas_received: AtomicU64,

    bytes_stored: AtomicU64,
    bytes_fetched: AtomicU64,
    bytes_served: AtomicU64,
    bytes_replicated: AtomicU64,

    messages_received: AtomicU64,
    errors: AtomicU64,

    peers_connected: AtomicU64,
    peers_disconnected: AtomicU64,

    gc_sweeps: AtomicU64,
    gc_blobs_removed: AtomicU64,
}

impl ServerMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_store(&self, bytes: u64) {
        self.blobs_stored.fetch_add(1, Ordering::Relaxed);
        self.bytes_stored.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn record_fetch(&self, bytes: u64) {
        self.blobs_fetched.fetch_add(1, Ordering::Relaxed);
        self.bytes_fetched.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn record_serve(&self, bytes: u64) {
        self.blobs_served.fetch_add(1, Ordering::Relaxed);
        self.bytes_served.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn record_delete(&self) {
        self.blobs_deleted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_replica(&self, bytes: u64) {
        self.replicas_received.fetch_add(1, Ordering::Relaxed);
        self.bytes_replicated.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn record_message(&self) {
        self.messages_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_peer_connected(&self) {
        self.peers_connected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_peer_disconnected(&self) {
        self.peers_disconnected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_sweep(&self, stats: SweepStats) {
        self.gc_sweeps.fetch_add(1, Ordering::Relaxed);
        self.gc_blobs_removed
            .fetch_add(stats.removed as u64, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            blobs_stored: self.blobs_stored.load(Ordering::Relaxed),
            blobs_fetched: self.blobs_fetched.load(Ordering::Relaxed),
            blobs_served: self.blobs_served.load(Ordering::Relaxed),
            blobs_deleted: self.blobs_deleted.load(Ordering::Relaxed),
            replicas_received: self.replicas_received.load(Ordering::Relaxed),
            bytes_stored: self.bytes_stored.load(Ordering::Relaxed),
            bytes_fetched: self.bytes_fetched.load(Ordering::Relaxed),
            bytes_served: self.bytes_served.load(Ordering::Relaxed),
            bytes_replicated: self.bytes_replicated.load(Ordering::Relaxed),
            messages_received: self.messages_received.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            peers_connected: self.peers_connected.load(Ordering::Relaxed),
            peers_disconnected: self.peers_disconnected.load(Ordering::Relaxed),
            gc_sweeps: self.gc_sweeps.load(Ordering::Relaxed),
            gc_blobs_removed: self.gc_blobs_removed.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time view of [`ServerMetrics`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub blobs_stored: u64,
    pub blobs_fetched: u64,
    pub blobs_served: u64,
    pub blobs_deleted: u64,
    pub replicas_received: u64,
    pub bytes_stored: u64,
    pub bytes_fetched: u64,
    pub bytes_served: u64,
    pub bytes_replicated: u64,
    pub messages_received: u64,
    pub errors: u64,
    pub peers_connected: u64,
    pub peers_disconnected: u64,
    pub gc_sweeps: u64,
    pub gc_blobs_removed: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate() {
        let metrics = ServerMetrics::new();
        metrics.record_store(100);
        metrics.record_store(50);
        metrics.record_fetch(25);
        metrics.record_error();
        metrics.record_sweep(SweepStats {
            corrupted: 1,
            orphaned: 2,
            removed: 3,
        });

        let snap = metrics.snapshot();
        assert_eq!(snap.blobs_stored, 2);
        assert_eq!(snap.bytes_stored, 150);
        assert_eq!(snap.blobs_fetched, 1);
        assert_eq!(snap.bytes_fetched, 25);
        assert_eq!(snap.errors, 1);
        assert_eq!(snap.gc_sweeps, 1);
        assert_eq!(snap.gc_blobs_removed, 3);
    }
}
