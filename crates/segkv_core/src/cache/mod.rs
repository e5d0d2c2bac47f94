//! Bounded concurrent resource cache.
//!
//! [`ResourceCache`] maps keys to lazily-constructed resources supplied by
//! a [`ResourceLifecycle`]. Each entry independently moves through
//! `Loading -> Ready -> Unloading`; the thread that first inserts a key
//! becomes its single loader, and every other concurrent caller waits on
//! that entry alone. When the resident count exceeds the capacity limit,
//! the least-recently-used unloadable entry is evicted and its unload runs
//! either inline or on a background worker, so slow unloads never delay
//! unrelated lookups.
//!
//! There is no global lock around loads or unloads: the entry map's lock
//! is held only for insert/lookup/remove, eviction candidate selection is
//! serialized by a dedicated lock held only for scan-and-mark, and all
//! resource I/O happens outside both.

mod entry;
mod metrics;

pub use metrics::MetricsSnapshot;

use crate::config::RetryPolicy;
use crate::error::CacheError;
use entry::{CacheEntry, EntryState};
use metrics::CacheCounters;
use parking_lot::{Mutex, RwLock};
use std::collections::hash_map::Entry as MapEntry;
use std::collections::HashMap;
use std::fmt::Display;
use std::hash::Hash;
use std::mem;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::Instant;

/// Supplies the cache with load/unload behavior for one resource type.
///
/// `load` and `unload` may perform blocking I/O; the cache never invokes
/// them while holding any of its own locks. `unload` is called exactly
/// once per resident value that leaves the cache cleanly.
pub trait ResourceLifecycle: Send + Sync + 'static {
    /// Cache key.
    type Key: Eq + Hash + Clone + Display + Send + Sync + 'static;
    /// The cached resource.
    type Value: Send + Sync + 'static;
    /// Error produced by `load` and `unload`.
    type Error: std::error::Error + Send + Sync + 'static;

    /// Constructs the resource for `key`.
    ///
    /// A failure must leave no global side effects visible to other keys.
    fn load(&self, key: &Self::Key) -> Result<Self::Value, Self::Error>;

    /// Releases a resource that is leaving the cache.
    ///
    /// A failure leaves the corresponding entry permanently stuck rather
    /// than risking a double release.
    fn unload(&self, key: &Self::Key, value: Arc<Self::Value>) -> Result<(), Self::Error>;

    /// Eviction predicate: entries reporting `false` are never chosen for
    /// eviction (treated as infinitely recent).
    fn can_unload(&self, _key: &Self::Key, _value: &Self::Value) -> bool {
        true
    }
}

/// Where unloads triggered by eviction run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnloadMode {
    /// On the evicting caller's thread. Deterministic; used by tests and
    /// small deployments.
    Inline,
    /// On a dedicated worker thread behind a bounded queue. A full queue
    /// leaves the entry marked for unload until an explicit invalidate or
    /// shutdown claims it.
    Background {
        /// Capacity of the unload queue.
        queue_depth: usize,
    },
}

type EntryRef<L> =
    Arc<CacheEntry<<L as ResourceLifecycle>::Value, <L as ResourceLifecycle>::Error>>;

/// A marked entry together with its detached value, ready to unload.
struct UnloadJob<L: ResourceLifecycle> {
    key: L::Key,
    entry: EntryRef<L>,
    value: Arc<L::Value>,
}

/// Outcome of trying to take exclusive unload ownership of an entry.
enum Claim<V> {
    /// The caller now owns the detached value and must unload it.
    Claimed(Arc<V>),
    /// Loading, mid-unload, or pinned; retry later.
    Busy,
    /// Failed or gone; nothing to unload.
    NotResident,
}

struct CacheInner<L: ResourceLifecycle> {
    lifecycle: L,
    entries: RwLock<HashMap<L::Key, EntryRef<L>>>,
    /// Capacity ceiling; mutable at runtime.
    limit: AtomicUsize,
    /// Entries counted from successful load until unload finalization.
    resident: AtomicUsize,
    /// Entries currently marked `Unloading` (stuck ones stay counted, so
    /// they stop generating eviction pressure).
    unloading: AtomicUsize,
    /// Source of access-sequence values; one increment per lookup.
    access_counter: AtomicU64,
    counters: CacheCounters,
    /// Serializes eviction candidate selection; held only for scan+mark,
    /// never across load/unload I/O.
    evict_lock: Mutex<()>,
}

impl<L: ResourceLifecycle> CacheInner<L> {
    fn next_access_seq(&self) -> u64 {
        self.access_counter.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Entries in `Ready` state, the population eviction draws from.
    fn ready_count(&self) -> usize {
        self.resident
            .load(Ordering::SeqCst)
            .saturating_sub(self.unloading.load(Ordering::SeqCst))
    }

    /// Removes `entry` from the map, but only if the map still holds that
    /// exact entry (the key may have been reloaded since).
    fn remove_entry(&self, key: &L::Key, entry: &EntryRef<L>) {
        let mut map = self.entries.write();
        if let Some(current) = map.get(key) {
            if Arc::ptr_eq(current, entry) {
                map.remove(key);
            }
        }
    }

    /// Picks the `Ready`, unloadable entry with the smallest access
    /// sequence (excluding `skip`) and flips it to `Unloading`.
    ///
    /// Callers must hold `evict_lock`. Returns `None` when no entry
    /// qualifies, in which case the cache deliberately stays over
    /// capacity rather than thrash pinned entries.
    fn select_and_mark(&self, skip: Option<&L::Key>) -> Option<UnloadJob<L>> {
        let candidates: Vec<(L::Key, EntryRef<L>)> = self
            .entries
            .read()
            .iter()
            .map(|(key, entry)| (key.clone(), Arc::clone(entry)))
            .collect();

        let mut best: Option<(u64, L::Key, EntryRef<L>)> = None;
        for (key, entry) in candidates {
            if skip == Some(&key) {
                continue;
            }
            let seq = {
                let state = entry.lock();
                match &*state {
                    EntryState::Ready { value, access_seq }
                        if self.lifecycle.can_unload(&key, value.as_ref()) =>
                    {
                        Some(*access_seq)
                    }
                    _ => None,
                }
            };
            let Some(seq) = seq else { continue };
            match &best {
                Some((best_seq, _, _)) if *best_seq <= seq => {}
                _ => best = Some((seq, key, entry)),
            }
        }

        let (_, key, entry) = best?;
        let value = {
            let mut state = entry.lock();
            match mem::replace(&mut *state, EntryState::Unloading { stranded: None }) {
                EntryState::Ready { value, .. } => value,
                // Changed state since the scan; restore it and give up
                // this round.
                other => {
                    *state = other;
                    return None;
                }
            }
        };
        self.unloading.fetch_add(1, Ordering::SeqCst);
        Some(UnloadJob { key, entry, value })
    }

    /// Tries to take unload ownership of an entry: flips `Ready ->
    /// Unloading` (subject to the unloadable predicate) or claims a value
    /// parked by a rejected queue submission.
    fn claim_for_unload(&self, key: &L::Key, entry: &EntryRef<L>) -> Claim<L::Value> {
        let mut state = entry.lock();
        match mem::replace(&mut *state, EntryState::Unloading { stranded: None }) {
            EntryState::Ready { value, access_seq } => {
                if self.lifecycle.can_unload(key, value.as_ref()) {
                    self.unloading.fetch_add(1, Ordering::SeqCst);
                    Claim::Claimed(value)
                } else {
                    *state = EntryState::Ready { value, access_seq };
                    Claim::Busy
                }
            }
            // The gauge was already bumped when this entry was marked.
            EntryState::Unloading {
                stranded: Some(value),
            } => Claim::Claimed(value),
            EntryState::Unloading { stranded: None } => Claim::Busy,
            loading @ EntryState::Loading => {
                *state = loading;
                Claim::Busy
            }
            failed @ EntryState::Failed(_) => {
                *state = failed;
                Claim::NotResident
            }
            EntryState::Gone => {
                *state = EntryState::Gone;
                Claim::NotResident
            }
        }
    }

    /// Runs the unloader for a marked entry and finalizes it.
    ///
    /// On failure the entry is left `Unloading` permanently: a leaked slot
    /// is preferred over a double-unload or use-after-unload.
    fn finish_unload(&self, job: UnloadJob<L>) -> Result<(), Arc<L::Error>> {
        match self.lifecycle.unload(&job.key, job.value) {
            Ok(()) => {
                job.entry.finish_unload();
                self.remove_entry(&job.key, &job.entry);
                self.resident.fetch_sub(1, Ordering::SeqCst);
                self.unloading.fetch_sub(1, Ordering::SeqCst);
                self.counters.record_eviction();
                Ok(())
            }
            Err(err) => {
                let err = Arc::new(err);
                self.counters.record_failed_unload();
                tracing::warn!(
                    key = %job.key,
                    error = %err,
                    "unload failed; entry left permanently unloading"
                );
                Err(err)
            }
        }
    }
}

/// A bounded, concurrent, per-key-loading cache.
///
/// See the module documentation for the protocol; [`ResourceCache::get`]
/// is the main entry point.
pub struct ResourceCache<L: ResourceLifecycle> {
    inner: Arc<CacheInner<L>>,
    unload_tx: Option<mpsc::SyncSender<UnloadJob<L>>>,
    worker: Option<thread::JoinHandle<()>>,
}

impl<L: ResourceLifecycle> ResourceCache<L> {
    /// Creates a cache with the given capacity limit and unload mode.
    pub fn new(lifecycle: L, limit: usize, mode: UnloadMode) -> Self {
        let inner = Arc::new(CacheInner {
            lifecycle,
            entries: RwLock::new(HashMap::new()),
            limit: AtomicUsize::new(limit),
            resident: AtomicUsize::new(0),
            unloading: AtomicUsize::new(0),
            access_counter: AtomicU64::new(0),
            counters: CacheCounters::default(),
            evict_lock: Mutex::new(()),
        });

        let (unload_tx, worker) = match mode {
            UnloadMode::Inline => (None, None),
            UnloadMode::Background { queue_depth } => {
                let (tx, rx) = mpsc::sync_channel::<UnloadJob<L>>(queue_depth);
                let worker_inner = Arc::clone(&inner);
                let handle = thread::spawn(move || {
                    while let Ok(job) = rx.recv() {
                        let _ = worker_inner.finish_unload(job);
                    }
                });
                (Some(tx), Some(handle))
            }
        };

        Self {
            inner,
            unload_tx,
            worker,
        }
    }

    /// Returns the resource for `key`, loading it if necessary.
    ///
    /// Exactly one caller per load episode invokes the loader; concurrent
    /// callers for the same key block until that load settles and then
    /// adopt the same value (or observe the same failure). A caller that
    /// finds the entry mid-unload gets [`CacheError::Busy`] rather than
    /// waiting. Lookups for different keys never block each other.
    pub fn get(&self, key: &L::Key) -> Result<Arc<L::Value>, CacheError<L::Error>> {
        loop {
            let seq = self.inner.next_access_seq();

            let (entry, is_loader) = {
                let mut map = self.inner.entries.write();
                match map.entry(key.clone()) {
                    MapEntry::Occupied(occupied) => (Arc::clone(occupied.get()), false),
                    MapEntry::Vacant(vacant) => {
                        let entry = Arc::new(CacheEntry::new_loading());
                        vacant.insert(Arc::clone(&entry));
                        (entry, true)
                    }
                }
            };

            if is_loader {
                self.inner.counters.record_miss();
                return self.load_entry(key, &entry, seq);
            }

            match self.wait_for_value(key, &entry, seq)? {
                Some(value) => {
                    self.inner.counters.record_hit();
                    return Ok(value);
                }
                // The entry vanished underneath us; retry the lookup.
                None => continue,
            }
        }
    }

    /// Explicitly unloads `key` right now, on the calling thread.
    ///
    /// Returns `Ok(true)` if a resident value was unloaded, `Ok(false)` if
    /// the key was not resident. An entry that is loading, mid-unload, or
    /// pinned by the unloadable predicate yields [`CacheError::Busy`]; the
    /// caller may retry.
    pub fn invalidate(&self, key: &L::Key) -> Result<bool, CacheError<L::Error>> {
        let entry = match self.inner.entries.read().get(key) {
            Some(entry) => Arc::clone(entry),
            None => return Ok(false),
        };

        let value = match self.inner.claim_for_unload(key, &entry) {
            Claim::Claimed(value) => value,
            Claim::Busy => {
                return Err(CacheError::Busy {
                    key: key.to_string(),
                })
            }
            Claim::NotResident => return Ok(false),
        };

        self.inner
            .finish_unload(UnloadJob {
                key: key.clone(),
                entry,
                value,
            })
            .map(|()| true)
            .map_err(|source| CacheError::Unload {
                key: key.to_string(),
                source,
            })
    }

    /// Changes the capacity limit, synchronously evicting down to it.
    ///
    /// Returns `false` if the cache could not converge because every
    /// over-limit entry is pinned or in transition; capacity then stays
    /// exceeded until pins drop.
    pub fn update_limit(&self, new_limit: usize) -> bool {
        self.inner.limit.store(new_limit, Ordering::SeqCst);
        loop {
            let job = {
                let _selection = self.inner.evict_lock.lock();
                if self.inner.ready_count() <= new_limit {
                    return true;
                }
                match self.inner.select_and_mark(None) {
                    Some(job) => job,
                    None => return false,
                }
            };
            // A failed unload leaves the entry stuck but still shrinks the
            // ready population, so the loop always makes progress.
            let _ = self.inner.finish_unload(job);
        }
    }

    /// Unloads every entry, waiting out in-flight loads and unloads.
    ///
    /// Retries with `policy.backoff` between passes until the cache is
    /// empty or `policy.timeout` expires. Entries stuck from failed
    /// unloads never settle, so they surface here as a timeout.
    pub fn drain(&self, policy: &RetryPolicy) -> Result<(), CacheError<L::Error>> {
        let deadline = Instant::now() + policy.timeout;
        loop {
            let pending: Vec<(L::Key, EntryRef<L>)> = self
                .inner
                .entries
                .read()
                .iter()
                .map(|(key, entry)| (key.clone(), Arc::clone(entry)))
                .collect();
            if pending.is_empty() {
                return Ok(());
            }

            for (key, entry) in pending {
                // Loading, pinned, and in-flight entries are re-checked on
                // the next pass.
                if let Claim::Claimed(value) = self.inner.claim_for_unload(&key, &entry) {
                    let _ = self.inner.finish_unload(UnloadJob {
                        key: key.clone(),
                        entry,
                        value,
                    });
                }
            }

            if self.inner.entries.read().is_empty() {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(CacheError::DrainTimedOut {
                    pending: self.inner.entries.read().len(),
                });
            }
            thread::sleep(policy.backoff);
        }
    }

    /// Returns the number of resident entries (including those mid-unload).
    #[must_use]
    pub fn size(&self) -> usize {
        self.inner.resident.load(Ordering::SeqCst)
    }

    /// Returns the current capacity limit.
    #[must_use]
    pub fn limit(&self) -> usize {
        self.inner.limit.load(Ordering::SeqCst)
    }

    /// Reports whether `key` currently has an entry in the cache.
    #[must_use]
    pub fn contains(&self, key: &L::Key) -> bool {
        self.inner.entries.read().contains_key(key)
    }

    /// Takes an immutable metrics snapshot.
    #[must_use]
    pub fn metrics(&self) -> MetricsSnapshot {
        self.inner.counters.snapshot(self.size(), self.limit())
    }

    fn load_entry(
        &self,
        key: &L::Key,
        entry: &EntryRef<L>,
        seq: u64,
    ) -> Result<Arc<L::Value>, CacheError<L::Error>> {
        match self.inner.lifecycle.load(key) {
            Ok(value) => {
                let value = Arc::new(value);
                entry.complete_load(Arc::clone(&value), seq);
                self.inner.resident.fetch_add(1, Ordering::SeqCst);
                self.inner.counters.record_load();
                self.evict_over_limit(Some(key));
                Ok(value)
            }
            Err(err) => {
                let shared = Arc::new(err);
                entry.fail_load(Arc::clone(&shared));
                self.inner.remove_entry(key, entry);
                Err(CacheError::Load {
                    key: key.to_string(),
                    source: shared,
                })
            }
        }
    }

    fn wait_for_value(
        &self,
        key: &L::Key,
        entry: &EntryRef<L>,
        seq: u64,
    ) -> Result<Option<Arc<L::Value>>, CacheError<L::Error>> {
        let mut state = entry.lock();
        loop {
            // Decide while borrowing the state, then act on an owned
            // outcome so the wait can retake the guard.
            let outcome = match &mut *state {
                EntryState::Loading => None,
                EntryState::Ready { value, access_seq } => {
                    *access_seq = (*access_seq).max(seq);
                    Some(Ok(Some(Arc::clone(value))))
                }
                EntryState::Unloading { .. } => Some(Err(CacheError::Busy {
                    key: key.to_string(),
                })),
                EntryState::Failed(err) => Some(Err(CacheError::Load {
                    key: key.to_string(),
                    source: Arc::clone(err),
                })),
                EntryState::Gone => Some(Ok(None)),
            };
            match outcome {
                Some(result) => return result,
                None => entry.wait(&mut state),
            }
        }
    }

    /// Evicts least-recently-used entries until the ready population fits
    /// the limit, skipping the key that was just loaded.
    fn evict_over_limit(&self, just_loaded: Option<&L::Key>) {
        loop {
            let job = {
                let _selection = self.inner.evict_lock.lock();
                if self.inner.ready_count() <= self.inner.limit.load(Ordering::SeqCst) {
                    return;
                }
                match self.inner.select_and_mark(just_loaded) {
                    Some(job) => job,
                    None => return,
                }
            };
            tracing::debug!(key = %job.key, "evicting least recently used entry");
            self.submit_unload(job);
        }
    }

    fn submit_unload(&self, job: UnloadJob<L>) {
        let Some(tx) = &self.unload_tx else {
            let _ = self.inner.finish_unload(job);
            return;
        };
        match tx.try_send(job) {
            Ok(()) => {}
            Err(mpsc::TrySendError::Full(job)) | Err(mpsc::TrySendError::Disconnected(job)) => {
                // Park the detached value on the entry; an explicit
                // invalidate or shutdown will claim and retry it.
                tracing::warn!(
                    key = %job.key,
                    "unload queue saturated; entry parked until invalidate or shutdown"
                );
                let mut state = job.entry.lock();
                match &mut *state {
                    EntryState::Unloading { stranded } => *stranded = Some(job.value),
                    _ => panic!("marked entry changed state before unload submission"),
                }
            }
        }
    }
}

impl<L: ResourceLifecycle> Drop for ResourceCache<L> {
    fn drop(&mut self) {
        // Closing the queue lets the worker drain outstanding jobs and exit.
        self.unload_tx = None;
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

impl<L: ResourceLifecycle> std::fmt::Debug for ResourceCache<L> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceCache")
            .field("size", &self.size())
            .field("limit", &self.limit())
            .finish_non_exhaustive()
    }
}
