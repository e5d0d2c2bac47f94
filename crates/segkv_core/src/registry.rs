//! Segment registry facade.
//!
//! A [`SegmentRegistry`] ties the bounded cache, the lifecycle gate, the
//! id allocator and the shared runtime limits together over one store
//! root. Loaded segments are handed out as `Arc<Segment>` and written
//! back to disk when evicted, invalidated, or drained at close.

use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use tracing::{debug, info};

use segkv_store::{Segment, SegmentId, SegmentIdAllocator, StoreError};

use crate::cache::{MetricsSnapshot, ResourceCache, ResourceLifecycle};
use crate::config::{RegistryConfig, RetryPolicy, RuntimeLimits, SharedLimits};
use crate::error::{RegistryError, RegistryResult};
use crate::gate::{CloseRole, LifecycleGate};

/// Loads and unloads segments for the cache.
///
/// The flush threshold is read from the shared limits at load time, so a
/// limit update or maintenance-mode switch affects future loads while
/// already-resident segments keep the threshold they were opened with.
struct SegmentLifecycle {
    root: PathBuf,
    limits: Arc<SharedLimits>,
}

impl ResourceLifecycle for SegmentLifecycle {
    type Key = SegmentId;
    type Value = Segment;
    type Error = StoreError;

    fn load(&self, key: &SegmentId) -> Result<Segment, StoreError> {
        Segment::open(&self.root, *key, self.limits.effective_flush_threshold())
    }

    fn unload(&self, _key: &SegmentId, value: Arc<Segment>) -> Result<(), StoreError> {
        value.close()
    }

    fn can_unload(&self, _key: &SegmentId, value: &Segment) -> bool {
        value.is_idle()
    }
}

/// Handle to a store root's segments.
///
/// Cloning is not supported; share a registry with `Arc`.
pub struct SegmentRegistry {
    gate: LifecycleGate,
    cache: ResourceCache<SegmentLifecycle>,
    allocator: SegmentIdAllocator,
    limits: Arc<SharedLimits>,
    close_policy: RetryPolicy,
}

impl SegmentRegistry {
    /// Opens a registry over `config.root`, creating the directory if it
    /// does not exist.
    pub fn open(config: RegistryConfig) -> RegistryResult<Self> {
        validate_limits(&RuntimeLimits {
            max_resident_segments: config.max_resident_segments,
            delta_flush_threshold: config.delta_flush_threshold,
            maintenance_flush_threshold: config.maintenance_flush_threshold,
        })?;

        fs::create_dir_all(&config.root).map_err(StoreError::from)?;
        let allocator = SegmentIdAllocator::open(&config.root)?;
        let limits = Arc::new(SharedLimits::new(&config));

        let lifecycle = SegmentLifecycle {
            root: config.root.clone(),
            limits: Arc::clone(&limits),
        };
        let cache = ResourceCache::new(lifecycle, config.max_resident_segments, config.unload);

        info!(
            root = %config.root.display(),
            max_resident = config.max_resident_segments,
            "opened segment registry"
        );

        Ok(Self {
            gate: LifecycleGate::new(),
            cache,
            allocator,
            limits,
            close_policy: config.close_policy,
        })
    }

    /// Returns the segment with `id`, loading it from disk if necessary.
    ///
    /// Concurrent callers for the same id share a single load; callers for
    /// other ids are never blocked by it.
    pub fn get_segment(&self, id: SegmentId) -> RegistryResult<Arc<Segment>> {
        self.gate.require_open()?;
        Ok(self.cache.get(&id)?)
    }

    /// Reserves a fresh segment id without creating anything on disk.
    pub fn allocate_segment_id(&self) -> RegistryResult<SegmentId> {
        self.gate.require_open()?;
        Ok(self.allocator.allocate())
    }

    /// Creates a new empty segment on disk and loads it.
    pub fn create_segment(&self) -> RegistryResult<Arc<Segment>> {
        self.gate.require_open()?;
        let id = self.allocator.allocate();
        Segment::create(self.allocator.root(), id)?;
        debug!(segment = %id, "created segment");
        Ok(self.cache.get(&id)?)
    }

    /// Unloads the segment if resident and deletes its directory.
    ///
    /// Fails with [`RegistryError::Busy`] while the segment is loading,
    /// unloading, or pinned by a writer; the caller may retry, and a
    /// partially-completed delete is safe to repeat.
    pub fn delete_segment(&self, id: SegmentId) -> RegistryResult<()> {
        self.gate.require_open()?;
        self.cache.invalidate(&id)?;
        Segment::remove_dir(self.allocator.root(), id)?;
        info!(segment = %id, "deleted segment");
        Ok(())
    }

    /// Counter and occupancy snapshot. Available even after close.
    pub fn metrics(&self) -> MetricsSnapshot {
        self.cache.metrics()
    }

    /// Current runtime limits.
    pub fn limits(&self) -> RuntimeLimits {
        self.limits.snapshot()
    }

    /// Replaces the runtime limits.
    ///
    /// Flush thresholds apply to future segment loads. The cache limit is
    /// applied synchronously; the returned bool reports whether residency
    /// converged below it (pinned or stuck segments can prevent that).
    pub fn update_limits(&self, limits: RuntimeLimits) -> RegistryResult<bool> {
        self.gate.require_open()?;
        validate_limits(&limits)?;
        self.limits.store(limits);
        Ok(self.cache.update_limit(limits.max_resident_segments))
    }

    /// Switches maintenance mode, which lowers the flush threshold used
    /// for future segment loads.
    pub fn set_maintenance_mode(&self, on: bool) -> RegistryResult<()> {
        self.gate.require_open()?;
        self.limits.set_maintenance_mode(on);
        info!(maintenance = on, "maintenance mode updated");
        Ok(())
    }

    /// Closes the registry, writing every resident segment back to disk.
    ///
    /// Idempotent: one caller drains while concurrent callers block and
    /// then observe the same outcome. If the drain cannot settle within
    /// the configured deadline the registry is left in a terminal failed
    /// state and an error is returned.
    pub fn close(&self) -> RegistryResult<()> {
        match self.gate.begin_close()? {
            CloseRole::AlreadyClosed => Ok(()),
            CloseRole::Drainer => {
                let result = self.cache.drain(&self.close_policy);
                self.gate.finish_close(result.is_ok());
                match result {
                    Ok(()) => {
                        info!("segment registry closed");
                        Ok(())
                    }
                    Err(err) => Err(err.into()),
                }
            }
        }
    }
}

impl std::fmt::Debug for SegmentRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SegmentRegistry")
            .field("root", &self.allocator.root())
            .field("gate", &self.gate.state())
            .field("resident", &self.cache.size())
            .finish_non_exhaustive()
    }
}

fn validate_limits(limits: &RuntimeLimits) -> RegistryResult<()> {
    if limits.max_resident_segments == 0 {
        return Err(RegistryError::invalid_config(
            "max_resident_segments must be at least 1",
        ));
    }
    if limits.maintenance_flush_threshold > limits.delta_flush_threshold {
        return Err(RegistryError::invalid_config(
            "maintenance_flush_threshold must not exceed delta_flush_threshold",
        ));
    }
    Ok(())
}
