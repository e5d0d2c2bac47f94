//! # segkv Core
//!
//! Segment registry for segkv: a bounded, concurrent map from segment ids
//! to loaded [`Segment`](segkv_store::Segment) handles.
//!
//! This crate provides:
//!
//! - [`SegmentRegistry`] - the facade: get/create/delete segments, runtime
//!   limit updates, maintenance mode, and an idempotent drain-on-close
//! - [`ResourceCache`] - the generic bounded cache underneath it, with
//!   per-key single-flight loading and LRU write-back eviction
//! - [`RegistryConfig`] / [`RuntimeLimits`] - opening and live-tunable
//!   configuration
//!
//! All on-disk work lives in `segkv_store`; this crate only decides *when*
//! segments load and unload.

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod cache;
pub mod config;
pub mod error;
pub mod gate;
pub mod registry;

pub use cache::{MetricsSnapshot, ResourceCache, ResourceLifecycle, UnloadMode};
pub use config::{RegistryConfig, RetryPolicy, RuntimeLimits};
pub use error::{CacheError, RegistryError, RegistryResult};
pub use gate::GateState;
pub use registry::SegmentRegistry;
