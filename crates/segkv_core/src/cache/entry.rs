//! Cache entry state machine.
//!
//! Every key known to the cache owns one [`CacheEntry`]. The entry moves
//! through `Loading -> Ready -> Unloading` and ends either removed
//! (`Gone`) or, after a load failure, `Failed`. The state is guarded by a
//! per-entry mutex with a condition variable so waiters on one key never
//! block activity on another.
//!
//! Transitions that the protocol can never produce are programming errors
//! and panic rather than being silently absorbed.

use parking_lot::{Condvar, Mutex, MutexGuard};
use std::sync::Arc;

/// State of one cache entry.
#[derive(Debug)]
pub(super) enum EntryState<V, E> {
    /// A loader thread is constructing the value.
    Loading,
    /// The value is resident. `access_seq` is the LRU ordering key,
    /// refreshed on every successful access.
    Ready {
        /// The resident resource.
        value: Arc<V>,
        /// Access-sequence snapshot of the most recent access.
        access_seq: u64,
    },
    /// The value has been detached for unloading. An entry whose unload
    /// fails stays here permanently.
    Unloading {
        /// Present when no unload worker owns the detached value (the
        /// queue rejected the submission); a later invalidate or drain
        /// claims it and retries the unload.
        stranded: Option<Arc<V>>,
    },
    /// The load failed; waiters observe the shared error and the entry is
    /// removed from the map.
    Failed(Arc<E>),
    /// The unload completed and the entry left the map. Stale waiters
    /// observing this retry their whole lookup.
    Gone,
}

/// One entry in the cache map.
#[derive(Debug)]
pub(super) struct CacheEntry<V, E> {
    state: Mutex<EntryState<V, E>>,
    cond: Condvar,
}

impl<V, E> CacheEntry<V, E> {
    /// Creates an entry in the `Loading` state, owned by the inserting
    /// loader thread.
    pub(super) fn new_loading() -> Self {
        Self {
            state: Mutex::new(EntryState::Loading),
            cond: Condvar::new(),
        }
    }

    /// Locks the entry state.
    pub(super) fn lock(&self) -> MutexGuard<'_, EntryState<V, E>> {
        self.state.lock()
    }

    /// Blocks until the entry is notified; spurious wakeups are possible,
    /// callers re-check the state in a loop.
    pub(super) fn wait(&self, guard: &mut MutexGuard<'_, EntryState<V, E>>) {
        self.cond.wait(guard);
    }

    /// Completes a load: `Loading -> Ready`, waking all waiters.
    pub(super) fn complete_load(&self, value: Arc<V>, access_seq: u64) {
        let mut state = self.state.lock();
        match *state {
            EntryState::Loading => {
                *state = EntryState::Ready { value, access_seq };
            }
            _ => panic!("complete_load on entry not in Loading state"),
        }
        self.cond.notify_all();
    }

    /// Records a load failure: `Loading -> Failed`, waking all waiters.
    pub(super) fn fail_load(&self, error: Arc<E>) {
        let mut state = self.state.lock();
        match *state {
            EntryState::Loading => {
                *state = EntryState::Failed(error);
            }
            _ => panic!("fail_load on entry not in Loading state"),
        }
        self.cond.notify_all();
    }

    /// Finalizes an unload: `Unloading -> Gone`, waking stale waiters so
    /// they retry their lookup.
    pub(super) fn finish_unload(&self) {
        let mut state = self.state.lock();
        match *state {
            EntryState::Unloading { .. } => {
                *state = EntryState::Gone;
            }
            _ => panic!("finish_unload on entry not in Unloading state"),
        }
        self.cond.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_then_unload_life_cycle() {
        let entry: CacheEntry<u32, std::io::Error> = CacheEntry::new_loading();
        entry.complete_load(Arc::new(5), 1);

        {
            let mut state = entry.lock();
            match &mut *state {
                EntryState::Ready { value, access_seq } => {
                    assert_eq!(**value, 5);
                    assert_eq!(*access_seq, 1);
                    *state = EntryState::Unloading { stranded: None };
                }
                other => panic!("unexpected state: {other:?}"),
            }
        }

        entry.finish_unload();
        assert!(matches!(*entry.lock(), EntryState::Gone));
    }

    #[test]
    #[should_panic(expected = "complete_load")]
    fn completing_ready_entry_panics() {
        let entry: CacheEntry<u32, std::io::Error> = CacheEntry::new_loading();
        entry.complete_load(Arc::new(1), 1);
        entry.complete_load(Arc::new(2), 2);
    }

    #[test]
    #[should_panic(expected = "finish_unload")]
    fn finishing_loading_entry_panics() {
        let entry: CacheEntry<u32, std::io::Error> = CacheEntry::new_loading();
        entry.finish_unload();
    }
}
