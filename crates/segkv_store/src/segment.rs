//! Segment handles.
//!
//! A [`Segment`] is the in-memory handle over one segment directory. It
//! holds the directory lock for as long as it is open, the validated
//! manifest, and the write-side delta cache that absorbs recent mutations
//! until they are flushed. The sorted data files, sparse index, and Bloom
//! filter live behind this handle and are not interpreted here.
//!
//! Lifecycle: [`Segment::open`] acquires the lock and loads state;
//! [`Segment::close`] flushes and releases the lock, exactly once. The
//! registry cache is the sole caller of both.

use crate::error::{StoreError, StoreResult};
use crate::lock::DirLock;
use crate::manifest::{sync_directory, SegmentManifest};
use crate::types::SegmentId;
use parking_lot::{Mutex, RwLock};
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

/// Name of the delta cache file inside a segment directory.
const DELTA_FILE: &str = "delta.dat";
/// Temporary file for atomic delta writes.
const DELTA_TEMP: &str = "delta.tmp";

/// Delta cache entry: `Some` is a pending put, `None` a tombstone.
type DeltaMap = BTreeMap<Vec<u8>, Option<Vec<u8>>>;

/// An open segment.
///
/// Safe for concurrent use; the delta cache is guarded by a `RwLock` and
/// all flags are atomic. Every operation fails with
/// [`StoreError::SegmentClosed`] once [`Segment::close`] has run.
pub struct Segment {
    id: SegmentId,
    dir: PathBuf,
    manifest: SegmentManifest,
    delta: RwLock<DeltaMap>,
    /// Delta entry count at which a mutation triggers an automatic flush.
    /// Zero disables automatic flushing.
    flush_threshold: usize,
    writers: AtomicUsize,
    dirty: AtomicBool,
    closed: AtomicBool,
    /// Taken out exactly once, by `close`.
    lock: Mutex<Option<DirLock>>,
}

impl Segment {
    /// Creates the on-disk directory and manifest for a new segment.
    ///
    /// The segment is not opened; call [`Segment::open`] afterwards.
    pub fn create(root: &Path, id: SegmentId) -> StoreResult<()> {
        let dir = root.join(id.dir_name());
        if dir.exists() {
            return Err(StoreError::invalid_format(format!(
                "segment directory already exists: {}",
                dir.display()
            )));
        }

        fs::create_dir_all(&dir)?;
        SegmentManifest::new(id).save(&dir)?;
        sync_directory(root)?;

        Ok(())
    }

    /// Opens a segment: acquires its directory lock, validates the
    /// manifest, and loads the persisted delta cache.
    ///
    /// On any failure the lock is released again, so a failed open leaves
    /// no side effects behind.
    pub fn open(root: &Path, id: SegmentId, flush_threshold: usize) -> StoreResult<Self> {
        let dir = root.join(id.dir_name());
        if !dir.is_dir() {
            return Err(StoreError::SegmentNotFound { id });
        }

        let lock = DirLock::acquire(&dir)?;
        // Errors past this point drop `lock`, releasing it.
        let manifest = SegmentManifest::load(&dir, id)?;
        let delta = load_delta(&dir)?;

        Ok(Self {
            id,
            dir,
            manifest,
            delta: RwLock::new(delta),
            flush_threshold,
            writers: AtomicUsize::new(0),
            dirty: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            lock: Mutex::new(Some(lock)),
        })
    }

    /// Returns the segment id.
    #[must_use]
    pub fn id(&self) -> SegmentId {
        self.id
    }

    /// Returns the segment manifest.
    #[must_use]
    pub fn manifest(&self) -> &SegmentManifest {
        &self.manifest
    }

    /// Reads a key from the delta cache.
    ///
    /// Returns `None` for absent keys and for pending tombstones.
    pub fn get(&self, key: &[u8]) -> StoreResult<Option<Vec<u8>>> {
        self.ensure_open()?;
        Ok(self.delta.read().get(key).cloned().flatten())
    }

    /// Records a put in the delta cache.
    pub fn put(&self, key: Vec<u8>, value: Vec<u8>) -> StoreResult<()> {
        self.ensure_open()?;
        self.delta.write().insert(key, Some(value));
        self.dirty.store(true, Ordering::SeqCst);
        self.maybe_flush()
    }

    /// Records a delete (tombstone) in the delta cache.
    pub fn delete(&self, key: Vec<u8>) -> StoreResult<()> {
        self.ensure_open()?;
        self.delta.write().insert(key, None);
        self.dirty.store(true, Ordering::SeqCst);
        self.maybe_flush()
    }

    /// Returns the number of pending delta entries.
    #[must_use]
    pub fn delta_len(&self) -> usize {
        self.delta.read().len()
    }

    /// Pins the segment for an in-flight write.
    ///
    /// While any [`WriteGuard`] is alive the segment reports not idle and
    /// the registry will not evict it.
    pub fn begin_write(&self) -> StoreResult<WriteGuard<'_>> {
        self.ensure_open()?;
        self.writers.fetch_add(1, Ordering::SeqCst);
        Ok(WriteGuard { segment: self })
    }

    /// Returns `true` when no writes are in flight.
    ///
    /// This is the unloadable predicate consulted by the registry cache.
    #[must_use]
    pub fn is_idle(&self) -> bool {
        self.writers.load(Ordering::SeqCst) == 0
    }

    /// Persists the delta cache if it has unflushed mutations.
    pub fn flush(&self) -> StoreResult<()> {
        self.ensure_open()?;
        self.flush_inner()
    }

    /// Closes the segment: flushes pending writes and releases the
    /// directory lock.
    ///
    /// Must be called exactly once; a second call fails with
    /// [`StoreError::SegmentClosed`]. A flush or unlock failure leaves the
    /// segment closed but the lock in place, which the registry surfaces
    /// as a stuck unload.
    pub fn close(&self) -> StoreResult<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Err(StoreError::SegmentClosed { id: self.id });
        }

        self.flush_inner()?;

        if let Some(lock) = self.lock.lock().take() {
            lock.release()?;
        }
        Ok(())
    }

    /// Deletes a segment's on-disk directory.
    ///
    /// Refuses with [`StoreError::Locked`] while a live owner holds the
    /// directory lock; deleting an already-absent directory is a no-op so
    /// the operation is safely retryable.
    pub fn remove_dir(root: &Path, id: SegmentId) -> StoreResult<()> {
        let dir = root.join(id.dir_name());
        if !dir.exists() {
            return Ok(());
        }

        if let Some(owner) = DirLock::holder(&dir)? {
            return Err(StoreError::Locked {
                pid: owner.pid,
                hostname: owner.hostname,
            });
        }

        fs::remove_dir_all(&dir)?;
        sync_directory(root)?;
        Ok(())
    }

    fn ensure_open(&self) -> StoreResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(StoreError::SegmentClosed { id: self.id });
        }
        Ok(())
    }

    fn maybe_flush(&self) -> StoreResult<()> {
        if self.flush_threshold > 0 && self.delta.read().len() >= self.flush_threshold {
            self.flush_inner()?;
        }
        Ok(())
    }

    /// Flush without the open check, so `close` can reuse it.
    fn flush_inner(&self) -> StoreResult<()> {
        if !self.dirty.swap(false, Ordering::SeqCst) {
            return Ok(());
        }

        let snapshot: Vec<(Vec<u8>, Option<Vec<u8>>)> = self
            .delta
            .read()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();

        if let Err(err) = write_delta(&self.dir, &snapshot) {
            // The mutations are still unflushed.
            self.dirty.store(true, Ordering::SeqCst);
            return Err(err);
        }
        Ok(())
    }
}

impl std::fmt::Debug for Segment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Segment")
            .field("id", &self.id)
            .field("delta_len", &self.delta_len())
            .field("closed", &self.closed.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

/// RAII pin for an in-flight write on a segment.
#[derive(Debug)]
pub struct WriteGuard<'a> {
    segment: &'a Segment,
}

impl Drop for WriteGuard<'_> {
    fn drop(&mut self) {
        self.segment.writers.fetch_sub(1, Ordering::SeqCst);
    }
}

fn delta_path(dir: &Path) -> PathBuf {
    dir.join(DELTA_FILE)
}

fn load_delta(dir: &Path) -> StoreResult<DeltaMap> {
    let path = delta_path(dir);
    if !path.exists() {
        return Ok(DeltaMap::new());
    }

    let data = fs::read(&path)?;
    let entries: Vec<(Vec<u8>, Option<Vec<u8>>)> = ciborium::de::from_reader(data.as_slice())
        .map_err(|err| StoreError::invalid_format(format!("decode delta cache: {err}")))?;
    Ok(entries.into_iter().collect())
}

fn write_delta(dir: &Path, entries: &[(Vec<u8>, Option<Vec<u8>>)]) -> StoreResult<()> {
    let temp_path = dir.join(DELTA_TEMP);

    let mut buf = Vec::new();
    ciborium::ser::into_writer(&entries, &mut buf)
        .map_err(|err| StoreError::invalid_format(format!("encode delta cache: {err}")))?;

    let mut file = File::create(&temp_path)?;
    file.write_all(&buf)?;
    file.sync_all()?;
    drop(file);

    fs::rename(&temp_path, delta_path(dir))?;
    sync_directory(dir)?;
    Ok(())
}
