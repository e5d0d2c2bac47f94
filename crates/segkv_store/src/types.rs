//! Core type definitions for the segment store.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Unique identifier for a segment.
///
/// Segment ids are monotonically increasing and never reused while any
/// on-disk trace of the segment exists.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct SegmentId(pub u64);

impl SegmentId {
    /// Creates a new segment ID.
    #[must_use]
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    /// Returns the raw ID value.
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// Returns the next segment ID.
    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0 + 1)
    }

    /// Returns the on-disk directory name for this segment.
    #[must_use]
    pub fn dir_name(self) -> String {
        format!("seg-{:06}", self.0)
    }

    /// Parses a segment ID back from a directory name.
    ///
    /// Returns `None` for names that do not follow the `seg-NNNNNN` layout.
    #[must_use]
    pub fn from_dir_name(name: &str) -> Option<Self> {
        let digits = name.strip_prefix("seg-")?;
        digits.parse::<u64>().ok().map(Self)
    }
}

impl fmt::Display for SegmentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "seg:{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn segment_id_ordering() {
        assert!(SegmentId::new(1) < SegmentId::new(2));
    }

    #[test]
    fn segment_id_next() {
        assert_eq!(SegmentId::new(5).next().as_u64(), 6);
    }

    #[test]
    fn dir_name_round_trip() {
        let id = SegmentId::new(42);
        assert_eq!(id.dir_name(), "seg-000042");
        assert_eq!(SegmentId::from_dir_name("seg-000042"), Some(id));
    }

    #[test]
    fn from_dir_name_rejects_foreign_names() {
        assert_eq!(SegmentId::from_dir_name("LOCK"), None);
        assert_eq!(SegmentId::from_dir_name("seg-abc"), None);
        assert_eq!(SegmentId::from_dir_name("wal-000001"), None);
    }

    #[test]
    fn segment_id_display() {
        assert_eq!(format!("{}", SegmentId::new(7)), "seg:7");
    }
}
