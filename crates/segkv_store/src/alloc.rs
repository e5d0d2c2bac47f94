//! Segment id allocation.

use crate::error::StoreResult;
use crate::types::SegmentId;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

/// Allocates new, never-reused segment ids for one store root.
///
/// On open, the root directory is scanned for existing `seg-NNNNNN`
/// directories and the sequence resumes past the highest id found, so an
/// id is never handed out while any on-disk trace of it remains.
#[derive(Debug)]
pub struct SegmentIdAllocator {
    root: PathBuf,
    next: AtomicU64,
}

impl SegmentIdAllocator {
    /// Opens an allocator for `root`, resuming past any existing segments.
    pub fn open(root: &Path) -> StoreResult<Self> {
        let mut max_seen = 0u64;
        if root.is_dir() {
            for entry in fs::read_dir(root)? {
                let entry = entry?;
                if let Some(id) = entry
                    .file_name()
                    .to_str()
                    .and_then(SegmentId::from_dir_name)
                {
                    max_seen = max_seen.max(id.as_u64());
                }
            }
        }

        Ok(Self {
            root: root.to_path_buf(),
            next: AtomicU64::new(max_seen + 1),
        })
    }

    /// Returns a fresh, previously-unused segment id.
    pub fn allocate(&self) -> SegmentId {
        SegmentId::new(self.next.fetch_add(1, Ordering::SeqCst))
    }

    /// Returns the store root this allocator scans.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn allocates_monotonically() {
        let temp = tempdir().unwrap();
        let alloc = SegmentIdAllocator::open(temp.path()).unwrap();

        let a = alloc.allocate();
        let b = alloc.allocate();
        assert!(a < b);
        assert_eq!(a, SegmentId::new(1));
    }

    #[test]
    fn resumes_past_existing_segments() {
        let temp = tempdir().unwrap();
        fs::create_dir(temp.path().join("seg-000003")).unwrap();
        fs::create_dir(temp.path().join("seg-000007")).unwrap();
        // Non-segment entries are ignored.
        fs::create_dir(temp.path().join("tmp")).unwrap();

        let alloc = SegmentIdAllocator::open(temp.path()).unwrap();
        assert_eq!(alloc.allocate(), SegmentId::new(8));
    }

    #[test]
    fn concurrent_allocations_are_unique() {
        use std::collections::HashSet;
        use std::sync::Arc;
        use std::thread;

        let temp = tempdir().unwrap();
        let alloc = Arc::new(SegmentIdAllocator::open(temp.path()).unwrap());

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let alloc = Arc::clone(&alloc);
                thread::spawn(move || (0..100).map(|_| alloc.allocate()).collect::<Vec<_>>())
            })
            .collect();

        let mut seen = HashSet::new();
        for handle in handles {
            for id in handle.join().expect("allocator thread panicked") {
                assert!(seen.insert(id), "duplicate id {id}");
            }
        }
        assert_eq!(seen.len(), 800);
    }
}
