//! Cache metrics.
//!
//! All counters are atomic and readable while operations are in progress;
//! none participate in the concurrency protocol.

use std::sync::atomic::{AtomicU64, Ordering};

/// Live counters owned by one cache instance.
#[derive(Debug, Default)]
pub(super) struct CacheCounters {
    /// Lookups that found a resident value.
    hits: AtomicU64,
    /// Lookups that had to become the loader for their key.
    misses: AtomicU64,
    /// Loads that completed successfully.
    loads: AtomicU64,
    /// Entries removed by eviction or invalidation.
    evictions: AtomicU64,
    /// Unloads that failed, leaving their entry stuck.
    failed_unloads: AtomicU64,
}

impl CacheCounters {
    pub(super) fn record_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    pub(super) fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    pub(super) fn record_load(&self) {
        self.loads.fetch_add(1, Ordering::Relaxed);
    }

    pub(super) fn record_eviction(&self) {
        self.evictions.fetch_add(1, Ordering::Relaxed);
    }

    pub(super) fn record_failed_unload(&self) {
        self.failed_unloads.fetch_add(1, Ordering::Relaxed);
    }

    /// Takes an immutable snapshot of the counters.
    pub(super) fn snapshot(&self, size: usize, limit: usize) -> MetricsSnapshot {
        MetricsSnapshot {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            loads: self.loads.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            failed_unloads: self.failed_unloads.load(Ordering::Relaxed),
            size,
            limit,
        }
    }
}

/// Immutable point-in-time view of a cache's metrics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetricsSnapshot {
    /// Lookups that found a resident value.
    pub hits: u64,
    /// Lookups that had to load.
    pub misses: u64,
    /// Successful loads.
    pub loads: u64,
    /// Entries removed by eviction or invalidation.
    pub evictions: u64,
    /// Unloads that failed, leaving a permanently stuck entry. A non-zero
    /// value is worth an operational alert.
    pub failed_unloads: u64,
    /// Entries currently resident (including those mid-unload).
    pub size: usize,
    /// Current capacity ceiling.
    pub limit: usize,
}
