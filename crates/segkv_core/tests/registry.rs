//! End-to-end registry tests over a real store root.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use segkv_core::{
    RegistryConfig, RegistryError, RetryPolicy, RuntimeLimits, SegmentRegistry, UnloadMode,
};
use segkv_store::SegmentId;
use tempfile::tempdir;

fn quick_policy() -> RetryPolicy {
    RetryPolicy {
        backoff: Duration::from_millis(5),
        timeout: Duration::from_millis(500),
    }
}

fn open_registry(root: &std::path::Path, max_resident: usize) -> SegmentRegistry {
    SegmentRegistry::open(
        RegistryConfig::new(root)
            .max_resident_segments(max_resident)
            .close_policy(quick_policy()),
    )
    .unwrap()
}

#[test]
fn create_write_and_read_back() {
    let dir = tempdir().unwrap();
    let registry = open_registry(dir.path(), 4);

    let segment = registry.create_segment().unwrap();
    let id = segment.id();
    segment.put(b"alpha".to_vec(), b"1".to_vec()).unwrap();
    drop(segment);

    let again = registry.get_segment(id).unwrap();
    assert_eq!(again.get(b"alpha").unwrap(), Some(b"1".to_vec()));

    registry.close().unwrap();
}

#[test]
fn data_survives_eviction_and_reload() {
    let dir = tempdir().unwrap();
    let registry = open_registry(dir.path(), 1);

    let first = registry.create_segment().unwrap();
    let first_id = first.id();
    first.put(b"k".to_vec(), b"v".to_vec()).unwrap();
    drop(first);

    // Loading a second segment evicts the first, writing it back to disk.
    let second = registry.create_segment().unwrap();
    assert_ne!(second.id(), first_id);
    drop(second);

    let reloaded = registry.get_segment(first_id).unwrap();
    assert_eq!(reloaded.get(b"k").unwrap(), Some(b"v".to_vec()));

    registry.close().unwrap();
}

#[test]
fn missing_segment_is_a_store_error() {
    let dir = tempdir().unwrap();
    let registry = open_registry(dir.path(), 4);

    let err = registry.get_segment(SegmentId::new(999)).unwrap_err();
    assert!(matches!(err, RegistryError::Store { .. }));

    registry.close().unwrap();
}

#[test]
fn delete_of_pinned_segment_is_busy_then_retryable() {
    let dir = tempdir().unwrap();
    let registry = open_registry(dir.path(), 4);

    let segment = registry.create_segment().unwrap();
    let id = segment.id();
    let guard = segment.begin_write().unwrap();

    let err = registry.delete_segment(id).unwrap_err();
    assert!(err.is_busy());
    assert!(dir.path().join(id.dir_name()).exists());

    drop(guard);
    drop(segment);
    registry.delete_segment(id).unwrap();
    assert!(!dir.path().join(id.dir_name()).exists());

    // Repeating a completed delete is a no-op.
    registry.delete_segment(id).unwrap();

    registry.close().unwrap();
}

#[test]
fn ids_are_not_reused_across_reopen() {
    let dir = tempdir().unwrap();

    let first_id = {
        let registry = open_registry(dir.path(), 4);
        let segment = registry.create_segment().unwrap();
        let id = segment.id();
        drop(segment);
        registry.close().unwrap();
        id
    };

    let registry = open_registry(dir.path(), 4);
    let next = registry.allocate_segment_id().unwrap();
    assert!(next.as_u64() > first_id.as_u64());
    registry.close().unwrap();
}

#[test]
fn operations_after_close_report_closed() {
    let dir = tempdir().unwrap();
    let registry = open_registry(dir.path(), 4);
    let id = registry.create_segment().unwrap().id();
    registry.close().unwrap();

    assert!(registry.get_segment(id).unwrap_err().is_closed());
    assert!(registry.create_segment().unwrap_err().is_closed());
    assert!(registry.delete_segment(id).unwrap_err().is_closed());
    assert!(registry.allocate_segment_id().unwrap_err().is_closed());
    assert!(registry
        .set_maintenance_mode(true)
        .unwrap_err()
        .is_closed());

    // Closing again is a no-op, and metrics stay readable.
    registry.close().unwrap();
    assert_eq!(registry.metrics().size, 0);
}

#[test]
fn concurrent_close_is_idempotent() {
    let dir = tempdir().unwrap();
    let registry = Arc::new(open_registry(dir.path(), 4));
    for _ in 0..3 {
        drop(registry.create_segment().unwrap());
    }

    let closers: Vec<_> = (0..4)
        .map(|_| {
            let registry = Arc::clone(&registry);
            thread::spawn(move || registry.close())
        })
        .collect();

    for handle in closers {
        handle.join().unwrap().unwrap();
    }
    assert_eq!(registry.metrics().size, 0);
}

#[test]
fn close_times_out_on_pinned_segment() {
    let dir = tempdir().unwrap();
    let registry = open_registry(dir.path(), 4);

    let segment = registry.create_segment().unwrap();
    let _guard = segment.begin_write().unwrap();

    let err = registry.close().unwrap_err();
    assert!(matches!(err, RegistryError::Failed { .. }));

    // The registry is terminally failed, not merely closed.
    assert!(matches!(
        registry.get_segment(segment.id()),
        Err(RegistryError::Failed { .. })
    ));
}

#[test]
fn metrics_track_hits_misses_and_evictions() {
    let dir = tempdir().unwrap();
    let registry = open_registry(dir.path(), 1);

    let a = registry.create_segment().unwrap().id();
    let b = registry.create_segment().unwrap().id();

    drop(registry.get_segment(b).unwrap()); // hit
    drop(registry.get_segment(a).unwrap()); // miss, evicts b

    let metrics = registry.metrics();
    assert_eq!(metrics.limit, 1);
    assert_eq!(metrics.size, 1);
    assert!(metrics.hits >= 1);
    assert!(metrics.misses >= 1);
    assert!(metrics.evictions >= 2);
    assert_eq!(metrics.failed_unloads, 0);

    registry.close().unwrap();
}

#[test]
fn update_limits_validates_and_applies() {
    let dir = tempdir().unwrap();
    let registry = open_registry(dir.path(), 4);

    assert!(matches!(
        registry.update_limits(RuntimeLimits {
            max_resident_segments: 0,
            delta_flush_threshold: 100,
            maintenance_flush_threshold: 10,
        }),
        Err(RegistryError::InvalidConfig { .. })
    ));
    assert!(matches!(
        registry.update_limits(RuntimeLimits {
            max_resident_segments: 4,
            delta_flush_threshold: 10,
            maintenance_flush_threshold: 100,
        }),
        Err(RegistryError::InvalidConfig { .. })
    ));

    for _ in 0..4 {
        drop(registry.create_segment().unwrap());
    }
    assert_eq!(registry.metrics().size, 4);

    let converged = registry
        .update_limits(RuntimeLimits {
            max_resident_segments: 2,
            delta_flush_threshold: 100,
            maintenance_flush_threshold: 10,
        })
        .unwrap();
    assert!(converged);
    assert_eq!(registry.metrics().size, 2);
    assert_eq!(registry.limits().max_resident_segments, 2);

    registry.close().unwrap();
}

#[test]
fn shrinking_limit_cannot_converge_past_pinned_segments() {
    let dir = tempdir().unwrap();
    let registry = open_registry(dir.path(), 2);

    let first = registry.create_segment().unwrap();
    let _first_guard = first.begin_write().unwrap();
    let second = registry.create_segment().unwrap();
    let _second_guard = second.begin_write().unwrap();

    let converged = registry
        .update_limits(RuntimeLimits {
            max_resident_segments: 1,
            delta_flush_threshold: 1024,
            maintenance_flush_threshold: 64,
        })
        .unwrap();

    // Both segments are pinned by writers, so nothing could be evicted.
    assert!(!converged);
    assert_eq!(registry.metrics().size, 2);
    assert_eq!(registry.limits().max_resident_segments, 1);
}

#[test]
fn background_unload_mode_round_trips() {
    let dir = tempdir().unwrap();
    let registry = SegmentRegistry::open(
        RegistryConfig::new(dir.path())
            .max_resident_segments(1)
            .unload(UnloadMode::Background { queue_depth: 4 })
            .close_policy(quick_policy()),
    )
    .unwrap();

    let first = registry.create_segment().unwrap();
    let first_id = first.id();
    first.put(b"x".to_vec(), b"y".to_vec()).unwrap();
    drop(first);

    drop(registry.create_segment().unwrap());

    // The reload may briefly race the in-flight background unload.
    let reloaded = loop {
        match registry.get_segment(first_id) {
            Ok(segment) => break segment,
            Err(err) if err.is_busy() => thread::sleep(Duration::from_millis(5)),
            Err(err) => panic!("unexpected error: {err}"),
        }
    };
    assert_eq!(reloaded.get(b"x").unwrap(), Some(b"y".to_vec()));

    registry.close().unwrap();
}
