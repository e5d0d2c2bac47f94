//! Segment directory locking.
//!
//! Each segment directory carries a `LOCK` file recording the identity of
//! its owner: process id, process start time, hostname, and a random
//! session id. A lock whose owner is no longer alive (or whose recorded
//! start time no longer matches the live process) is *stale* and is
//! reclaimed by deleting the file.
//!
//! Unlike an advisory `flock`, the recorded identity survives process
//! death, so a crashed owner never wedges a segment directory permanently.

use crate::error::{StoreError, StoreResult};
use serde::{Deserialize, Serialize};
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use uuid::Uuid;

/// Name of the lock file inside a segment directory.
const LOCK_FILE: &str = "LOCK";

/// Identity recorded in a segment lock file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockOwner {
    /// Owner process id.
    pub pid: u32,
    /// Owner process start time (jiffies since boot on Linux, 0 where
    /// unavailable).
    pub process_start: u64,
    /// Owner hostname.
    pub hostname: String,
    /// Random per-lock session id.
    pub session: Uuid,
}

impl LockOwner {
    /// Builds the identity of the current process with a fresh session id.
    fn current() -> Self {
        let pid = std::process::id();
        Self {
            pid,
            process_start: process_start_time(pid).unwrap_or(0),
            hostname: hostname(),
            session: Uuid::new_v4(),
        }
    }

    /// Returns `true` when the recorded owner can no longer be holding the
    /// lock: the process is dead, or its pid was recycled by a process with
    /// a different start time.
    fn is_stale(&self) -> bool {
        if !process_alive(self.pid) {
            return true;
        }
        match process_start_time(self.pid) {
            Some(start) => self.process_start != 0 && start != self.process_start,
            None => false,
        }
    }
}

/// On-disk observation of a lock file.
enum LockFile {
    /// No lock file present.
    Missing,
    /// A lock file exists but its content cannot be parsed.
    Unreadable,
    /// A parseable lock file.
    Owned(LockOwner),
}

/// An exclusive lock over a segment directory.
///
/// Created by [`DirLock::acquire`]; released by [`DirLock::release`] or,
/// best-effort, on drop. Releasing verifies that the on-disk session id
/// still matches this lock, so another owner's lock is never removed
/// silently.
#[derive(Debug)]
pub struct DirLock {
    path: PathBuf,
    owner: LockOwner,
    released: bool,
}

impl DirLock {
    /// Acquires the lock for `dir`.
    ///
    /// A stale lock file left by a dead owner is deleted and acquisition
    /// proceeds. A lock held by a live owner fails with
    /// [`StoreError::Locked`], which callers treat as a transient busy
    /// condition.
    pub fn acquire(dir: &Path) -> StoreResult<Self> {
        let path = dir.join(LOCK_FILE);
        match read_lock_file(&path)? {
            LockFile::Missing => {}
            LockFile::Unreadable => {
                tracing::debug!(path = %path.display(), "removing unreadable segment lock");
                fs::remove_file(&path)?;
            }
            LockFile::Owned(existing) if existing.is_stale() => {
                tracing::debug!(
                    pid = existing.pid,
                    path = %path.display(),
                    "reclaiming stale segment lock"
                );
                fs::remove_file(&path)?;
            }
            LockFile::Owned(existing) => {
                return Err(StoreError::Locked {
                    pid: existing.pid,
                    hostname: existing.hostname,
                });
            }
        }

        let owner = LockOwner::current();
        let mut file = match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(file) => file,
            Err(err) if err.kind() == ErrorKind::AlreadyExists => {
                // Lost the creation race with another acquirer.
                let (pid, hostname) = match read_lock_file(&path)? {
                    LockFile::Owned(other) => (other.pid, other.hostname),
                    _ => (0, String::from("unknown")),
                };
                return Err(StoreError::Locked { pid, hostname });
            }
            Err(err) => return Err(err.into()),
        };

        let encoded = serde_json::to_vec(&owner)
            .map_err(|err| StoreError::invalid_format(format!("encode lock owner: {err}")))?;
        file.write_all(&encoded)?;
        file.sync_all()?;

        Ok(Self {
            path,
            owner,
            released: false,
        })
    }

    /// Returns the live owner of the lock for `dir`, if any.
    ///
    /// Stale and unreadable lock files are deleted and reported as absent.
    pub fn holder(dir: &Path) -> StoreResult<Option<LockOwner>> {
        let path = dir.join(LOCK_FILE);
        match read_lock_file(&path)? {
            LockFile::Missing => Ok(None),
            LockFile::Unreadable => {
                fs::remove_file(&path)?;
                Ok(None)
            }
            LockFile::Owned(existing) if existing.is_stale() => {
                tracing::debug!(
                    pid = existing.pid,
                    path = %path.display(),
                    "reclaiming stale segment lock"
                );
                fs::remove_file(&path)?;
                Ok(None)
            }
            LockFile::Owned(existing) => Ok(Some(existing)),
        }
    }

    /// Reports whether `dir` is currently locked by a live owner.
    ///
    /// Stale and unreadable lock files are deleted and reported unlocked.
    pub fn is_locked(dir: &Path) -> StoreResult<bool> {
        Ok(Self::holder(dir)?.is_some())
    }

    /// Returns the identity this lock was acquired with.
    #[must_use]
    pub fn owner(&self) -> &LockOwner {
        &self.owner
    }

    /// Releases the lock.
    ///
    /// Fails with [`StoreError::ForeignLock`] if the on-disk lock file no
    /// longer records this session: the file is left untouched rather than
    /// silently releasing another owner's lock.
    pub fn release(mut self) -> StoreResult<()> {
        self.release_inner()
    }

    fn release_inner(&mut self) -> StoreResult<()> {
        if self.released {
            return Ok(());
        }
        // One attempt only; a failed release must not be retried on drop.
        self.released = true;
        match read_lock_file(&self.path)? {
            LockFile::Owned(existing) if existing.session == self.owner.session => {
                fs::remove_file(&self.path)?;
                Ok(())
            }
            _ => Err(StoreError::ForeignLock {
                path: self.path.display().to_string(),
            }),
        }
    }
}

impl Drop for DirLock {
    fn drop(&mut self) {
        if !self.released {
            if let Err(err) = self.release_inner() {
                tracing::warn!(
                    path = %self.path.display(),
                    %err,
                    "failed to release segment lock on drop"
                );
            }
        }
    }
}

fn read_lock_file(path: &Path) -> StoreResult<LockFile> {
    let data = match fs::read(path) {
        Ok(data) => data,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(LockFile::Missing),
        Err(err) => return Err(err.into()),
    };
    match serde_json::from_slice(&data) {
        Ok(owner) => Ok(LockFile::Owned(owner)),
        Err(_) => Ok(LockFile::Unreadable),
    }
}

#[cfg(target_os = "linux")]
fn process_alive(pid: u32) -> bool {
    Path::new("/proc").join(pid.to_string()).exists()
}

/// Without procfs there is no portable liveness check, so a recorded owner
/// is conservatively treated as alive.
#[cfg(not(target_os = "linux"))]
fn process_alive(_pid: u32) -> bool {
    true
}

#[cfg(target_os = "linux")]
fn process_start_time(pid: u32) -> Option<u64> {
    let stat = fs::read_to_string(format!("/proc/{pid}/stat")).ok()?;
    // The command name (field 2) is parenthesised and may contain spaces;
    // starttime is field 22, i.e. the 20th token after the closing paren.
    let rest = stat.rsplit_once(')')?.1;
    rest.split_whitespace().nth(19)?.parse().ok()
}

#[cfg(not(target_os = "linux"))]
fn process_start_time(_pid: u32) -> Option<u64> {
    None
}

#[cfg(target_os = "linux")]
fn hostname() -> String {
    fs::read_to_string("/proc/sys/kernel/hostname")
        .map(|name| name.trim().to_string())
        .unwrap_or_else(|_| fallback_hostname())
}

#[cfg(not(target_os = "linux"))]
fn hostname() -> String {
    fallback_hostname()
}

fn fallback_hostname() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| String::from("unknown"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn write_owner(dir: &Path, owner: &LockOwner) {
        fs::write(dir.join(LOCK_FILE), serde_json::to_vec(owner).unwrap()).unwrap();
    }

    #[test]
    fn acquire_and_release() {
        let temp = tempdir().unwrap();

        let lock = DirLock::acquire(temp.path()).unwrap();
        assert!(DirLock::is_locked(temp.path()).unwrap());

        lock.release().unwrap();
        assert!(!DirLock::is_locked(temp.path()).unwrap());
    }

    #[test]
    fn second_acquire_reports_locked() {
        let temp = tempdir().unwrap();

        let _lock = DirLock::acquire(temp.path()).unwrap();
        let result = DirLock::acquire(temp.path());
        assert!(matches!(result, Err(StoreError::Locked { .. })));
    }

    #[test]
    fn released_on_drop() {
        let temp = tempdir().unwrap();

        {
            let _lock = DirLock::acquire(temp.path()).unwrap();
        }
        assert!(!DirLock::is_locked(temp.path()).unwrap());
    }

    #[test]
    fn dead_owner_is_stale() {
        let temp = tempdir().unwrap();

        // No live process has this pid.
        let owner = LockOwner {
            pid: u32::MAX - 1,
            process_start: 12345,
            hostname: String::from("elsewhere"),
            session: Uuid::new_v4(),
        };
        write_owner(temp.path(), &owner);

        assert!(!DirLock::is_locked(temp.path()).unwrap());
        assert!(!temp.path().join(LOCK_FILE).exists());
    }

    #[test]
    fn acquire_reclaims_stale_lock() {
        let temp = tempdir().unwrap();

        let owner = LockOwner {
            pid: u32::MAX - 1,
            process_start: 12345,
            hostname: String::from("elsewhere"),
            session: Uuid::new_v4(),
        };
        write_owner(temp.path(), &owner);

        let lock = DirLock::acquire(temp.path()).unwrap();
        assert_ne!(lock.owner().session, owner.session);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn recycled_pid_is_stale() {
        let temp = tempdir().unwrap();

        // Live pid, but a start time that cannot match it.
        let mut owner = LockOwner::current();
        owner.process_start += 1;
        write_owner(temp.path(), &owner);

        assert!(!DirLock::is_locked(temp.path()).unwrap());
    }

    #[test]
    fn live_owner_stays_locked() {
        let temp = tempdir().unwrap();

        // Recorded by this very process, so the owner is alive and the
        // start time matches.
        let _lock = DirLock::acquire(temp.path()).unwrap();
        assert!(DirLock::is_locked(temp.path()).unwrap());
        assert!(temp.path().join(LOCK_FILE).exists());
    }

    #[test]
    fn releasing_foreign_lock_fails() {
        let temp = tempdir().unwrap();

        let lock = DirLock::acquire(temp.path()).unwrap();

        // Another session overwrote the lock file.
        let mut foreign = LockOwner::current();
        foreign.session = Uuid::new_v4();
        write_owner(temp.path(), &foreign);

        let result = lock.release();
        assert!(matches!(result, Err(StoreError::ForeignLock { .. })));
        // The foreign lock file must survive.
        assert!(temp.path().join(LOCK_FILE).exists());
    }

    #[test]
    fn unreadable_lock_is_reclaimed() {
        let temp = tempdir().unwrap();
        fs::write(temp.path().join(LOCK_FILE), b"not json").unwrap();

        assert!(!DirLock::is_locked(temp.path()).unwrap());
        let _lock = DirLock::acquire(temp.path()).unwrap();
    }
}
