//! Per-segment manifest persistence.
//!
//! The manifest records segment identity and format version. It is written
//! atomically: encode to a temporary file, sync, rename over the real name,
//! then fsync the directory so the rename is durable.

use crate::error::{StoreError, StoreResult};
use crate::types::SegmentId;
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::Write;
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

/// Name of the manifest file inside a segment directory.
pub(crate) const MANIFEST_FILE: &str = "MANIFEST";
/// Temporary file for atomic manifest writes.
const MANIFEST_TEMP: &str = "MANIFEST.tmp";

/// Current segment format version (major, minor).
///
/// A major mismatch on open is an error; minor revisions are readable.
pub const FORMAT_VERSION: (u16, u16) = (1, 0);

/// Metadata for a single segment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentManifest {
    /// The segment this manifest belongs to.
    pub segment_id: SegmentId,
    /// Format version the segment was written with.
    pub format_version: (u16, u16),
    /// Creation time, milliseconds since the Unix epoch.
    pub created_at_ms: u64,
}

impl SegmentManifest {
    /// Creates a manifest for a new segment at the current format version.
    #[must_use]
    pub fn new(segment_id: SegmentId) -> Self {
        let created_at_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        Self {
            segment_id,
            format_version: FORMAT_VERSION,
            created_at_ms,
        }
    }

    /// Encodes the manifest to CBOR bytes.
    pub fn encode(&self) -> StoreResult<Vec<u8>> {
        let mut buf = Vec::new();
        ciborium::ser::into_writer(self, &mut buf)
            .map_err(|err| StoreError::invalid_format(format!("encode manifest: {err}")))?;
        Ok(buf)
    }

    /// Decodes a manifest from CBOR bytes.
    pub fn decode(data: &[u8]) -> StoreResult<Self> {
        ciborium::de::from_reader(data)
            .map_err(|err| StoreError::invalid_format(format!("decode manifest: {err}")))
    }

    /// Loads and validates the manifest from a segment directory.
    pub fn load(dir: &Path, expected: SegmentId) -> StoreResult<Self> {
        let path = dir.join(MANIFEST_FILE);
        if !path.exists() {
            return Err(StoreError::SegmentNotFound { id: expected });
        }

        let manifest = Self::decode(&fs::read(&path)?)?;

        if manifest.segment_id != expected {
            return Err(StoreError::invalid_format(format!(
                "manifest belongs to {} but directory is for {}",
                manifest.segment_id, expected
            )));
        }
        if manifest.format_version.0 != FORMAT_VERSION.0 {
            return Err(StoreError::invalid_format(format!(
                "incompatible segment format: found v{}.{}, expected v{}.{}",
                manifest.format_version.0,
                manifest.format_version.1,
                FORMAT_VERSION.0,
                FORMAT_VERSION.1
            )));
        }

        Ok(manifest)
    }

    /// Saves the manifest to a segment directory atomically.
    pub fn save(&self, dir: &Path) -> StoreResult<()> {
        let temp_path = dir.join(MANIFEST_TEMP);

        let data = self.encode()?;
        let mut file = File::create(&temp_path)?;
        file.write_all(&data)?;
        file.sync_all()?;
        drop(file);

        fs::rename(&temp_path, dir.join(MANIFEST_FILE))?;
        sync_directory(dir)?;

        Ok(())
    }
}

/// Fsyncs a directory so renames and deletions within it are durable.
#[cfg(unix)]
pub(crate) fn sync_directory(dir: &Path) -> StoreResult<()> {
    let handle = File::open(dir)?;
    handle.sync_all()?;
    Ok(())
}

/// Windows NTFS journaling provides metadata durability; directory fsync
/// is not supported there.
#[cfg(not(unix))]
pub(crate) fn sync_directory(_dir: &Path) -> StoreResult<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn encode_decode_round_trip() {
        let manifest = SegmentManifest::new(SegmentId::new(3));
        let decoded = SegmentManifest::decode(&manifest.encode().unwrap()).unwrap();
        assert_eq!(decoded, manifest);
    }

    #[test]
    fn save_and_load() {
        let temp = tempdir().unwrap();
        let manifest = SegmentManifest::new(SegmentId::new(7));

        manifest.save(temp.path()).unwrap();
        let loaded = SegmentManifest::load(temp.path(), SegmentId::new(7)).unwrap();
        assert_eq!(loaded, manifest);
    }

    #[test]
    fn load_missing_is_not_found() {
        let temp = tempdir().unwrap();
        let result = SegmentManifest::load(temp.path(), SegmentId::new(1));
        assert!(matches!(result, Err(StoreError::SegmentNotFound { .. })));
    }

    #[test]
    fn load_rejects_wrong_segment() {
        let temp = tempdir().unwrap();
        SegmentManifest::new(SegmentId::new(1))
            .save(temp.path())
            .unwrap();

        let result = SegmentManifest::load(temp.path(), SegmentId::new(2));
        assert!(matches!(result, Err(StoreError::InvalidFormat { .. })));
    }

    #[test]
    fn load_rejects_major_version_mismatch() {
        let temp = tempdir().unwrap();
        let mut manifest = SegmentManifest::new(SegmentId::new(1));
        manifest.format_version = (FORMAT_VERSION.0 + 1, 0);
        manifest.save(temp.path()).unwrap();

        let result = SegmentManifest::load(temp.path(), SegmentId::new(1));
        assert!(matches!(result, Err(StoreError::InvalidFormat { .. })));
    }
}
