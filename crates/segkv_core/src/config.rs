//! Registry configuration and runtime-tunable limits.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use crate::cache::UnloadMode;

/// Backoff schedule for operations that retry until a deadline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Pause between retry passes.
    pub backoff: Duration,

    /// Total time budget before giving up.
    pub timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            backoff: Duration::from_millis(10),
            timeout: Duration::from_secs(5),
        }
    }
}

/// Configuration for opening a segment registry.
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Directory holding the segment subdirectories.
    pub root: PathBuf,

    /// Maximum number of segments kept loaded at once.
    pub max_resident_segments: usize,

    /// Delta entries a segment buffers before auto-flushing.
    pub delta_flush_threshold: usize,

    /// Flush threshold used while maintenance mode is on.
    pub maintenance_flush_threshold: usize,

    /// How evicted segments are written back.
    pub unload: UnloadMode,

    /// Retry schedule used when `close` drains the cache.
    pub close_policy: RetryPolicy,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("."),
            max_resident_segments: 16,
            delta_flush_threshold: 1024,
            maintenance_flush_threshold: 64,
            unload: UnloadMode::Inline,
            close_policy: RetryPolicy::default(),
        }
    }
}

impl RegistryConfig {
    /// Creates a configuration rooted at `root` with default values.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            ..Self::default()
        }
    }

    /// Sets the maximum number of resident segments.
    #[must_use]
    pub const fn max_resident_segments(mut self, value: usize) -> Self {
        self.max_resident_segments = value;
        self
    }

    /// Sets the delta flush threshold.
    #[must_use]
    pub const fn delta_flush_threshold(mut self, value: usize) -> Self {
        self.delta_flush_threshold = value;
        self
    }

    /// Sets the flush threshold used in maintenance mode.
    #[must_use]
    pub const fn maintenance_flush_threshold(mut self, value: usize) -> Self {
        self.maintenance_flush_threshold = value;
        self
    }

    /// Sets the unload mode.
    #[must_use]
    pub const fn unload(mut self, mode: UnloadMode) -> Self {
        self.unload = mode;
        self
    }

    /// Sets the retry schedule for `close`.
    #[must_use]
    pub const fn close_policy(mut self, policy: RetryPolicy) -> Self {
        self.close_policy = policy;
        self
    }
}

/// Limits that can be retuned on a live registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RuntimeLimits {
    /// Maximum number of segments kept loaded at once.
    pub max_resident_segments: usize,

    /// Delta entries a segment buffers before auto-flushing.
    pub delta_flush_threshold: usize,

    /// Flush threshold used while maintenance mode is on.
    pub maintenance_flush_threshold: usize,
}

/// Shared, atomically-updated view of the runtime limits.
///
/// The segment loader reads the effective flush threshold at load time;
/// already-loaded segments keep the threshold they were opened with.
#[derive(Debug)]
pub struct SharedLimits {
    max_resident: AtomicUsize,
    delta_flush: AtomicUsize,
    maintenance_flush: AtomicUsize,
    maintenance_mode: AtomicBool,
}

impl SharedLimits {
    /// Creates the shared view from the opening configuration.
    #[must_use]
    pub fn new(config: &RegistryConfig) -> Self {
        Self {
            max_resident: AtomicUsize::new(config.max_resident_segments),
            delta_flush: AtomicUsize::new(config.delta_flush_threshold),
            maintenance_flush: AtomicUsize::new(config.maintenance_flush_threshold),
            maintenance_mode: AtomicBool::new(false),
        }
    }

    /// Current maximum number of resident segments.
    pub fn max_resident_segments(&self) -> usize {
        self.max_resident.load(Ordering::Relaxed)
    }

    /// Flush threshold new segment loads should use right now.
    pub fn effective_flush_threshold(&self) -> usize {
        if self.maintenance_mode.load(Ordering::Relaxed) {
            self.maintenance_flush.load(Ordering::Relaxed)
        } else {
            self.delta_flush.load(Ordering::Relaxed)
        }
    }

    /// Whether maintenance mode is currently on.
    pub fn maintenance_mode(&self) -> bool {
        self.maintenance_mode.load(Ordering::Relaxed)
    }

    /// Replaces all tunable limits.
    pub fn store(&self, limits: RuntimeLimits) {
        self.max_resident
            .store(limits.max_resident_segments, Ordering::Relaxed);
        self.delta_flush
            .store(limits.delta_flush_threshold, Ordering::Relaxed);
        self.maintenance_flush
            .store(limits.maintenance_flush_threshold, Ordering::Relaxed);
    }

    /// Switches maintenance mode on or off.
    pub fn set_maintenance_mode(&self, on: bool) {
        self.maintenance_mode.store(on, Ordering::Relaxed);
    }

    /// Snapshot of the tunable limits.
    pub fn snapshot(&self) -> RuntimeLimits {
        RuntimeLimits {
            max_resident_segments: self.max_resident.load(Ordering::Relaxed),
            delta_flush_threshold: self.delta_flush.load(Ordering::Relaxed),
            maintenance_flush_threshold: self.maintenance_flush.load(Ordering::Relaxed),
        }
    }
}
