//! # segkv Store
//!
//! On-disk segment collaborators for segkv.
//!
//! This crate provides the parts of the engine that touch the file system:
//!
//! - [`Segment`] - a handle over one segment directory (manifest, delta
//!   cache, directory lock)
//! - [`DirLock`] - a content-based directory lock with stale-owner recovery
//! - [`SegmentIdAllocator`] - allocation of never-reused segment ids
//! - [`SegmentManifest`] - per-segment metadata, persisted atomically
//!
//! The registry in `segkv_core` treats these as opaque load/unload/allocate
//! collaborators; nothing here knows about caching or eviction.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod alloc;
mod error;
mod lock;
mod manifest;
mod segment;
mod types;

pub use alloc::SegmentIdAllocator;
pub use error::{StoreError, StoreResult};
pub use lock::{DirLock, LockOwner};
pub use manifest::{SegmentManifest, FORMAT_VERSION};
pub use segment::{Segment, WriteGuard};
pub use types::SegmentId;
