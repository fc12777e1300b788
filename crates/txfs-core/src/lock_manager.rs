//! Resource-path-keyed advisory locking, built on `txfs_lock`. Each distinct
//! resource path gets a content-hashed lockfile under `locks/` so the
//! on-disk name is always filesystem-safe regardless of the original path's
//! characters or length. Acquisition polls at a fixed interval until the
//! configured timeout elapses, grounded on the retry/placeholder pattern of
//! the teacher's ephemeral lockfile protocol
//! (`scitool-cli/src/fs/file_lock/ephemeral.rs`), generalized from a single
//! well-known lock path to an arbitrary hashed resource path.

use std::{
    fs::TryLockError,
    io,
    thread,
    time::{Duration, Instant},
};

use cap_std::fs::Dir;
use sha2::{Digest as _, Sha256};
use txfs_lock::{LockType, PathLock};

use crate::{error::TxError, paths::RelPathBuf};

const POLL_INTERVAL: Duration = Duration::from_millis(25);

fn lock_file_name(resource: &RelPathBuf) -> String {
    let mut hasher = Sha256::new();
    hasher.update(resource.as_path().to_string_lossy().as_bytes());
    format!("{:x}.lock", hasher.finalize())
}

/// A lock held for the lifetime of a transaction, plus the placeholder path
/// (if any) the manager had to materialize in order to anchor it.
pub(crate) struct HeldLock {
    resource: RelPathBuf,
    lock: PathLock,
    temp_resource: Option<RelPathBuf>,
}

impl HeldLock {
    pub(crate) fn resource(&self) -> &RelPathBuf {
        &self.resource
    }

    pub(crate) fn temp_resource(&self) -> Option<&RelPathBuf> {
        self.temp_resource.as_ref()
    }

    /// Consumes the held lock (releasing it, since the caller is about to
    /// acquire a stronger one on the same resource), returning the
    /// placeholder path it was anchoring, if any, so the replacement lock
    /// can inherit rollback responsibility for it.
    pub(crate) fn into_temp_resource(self) -> Option<RelPathBuf> {
        self.temp_resource
    }

    /// Adopts `temp_resource` if this lock isn't already anchoring one.
    /// Used when a shared lock is upgraded to exclusive within the same
    /// transaction: the second acquire's own placeholder check finds the
    /// placeholder already materialized and so reports none of its own.
    pub(crate) fn set_temp_resource(&mut self, temp_resource: Option<RelPathBuf>) {
        if self.temp_resource.is_none() {
            self.temp_resource = temp_resource;
        }
    }

    pub(crate) fn is_exclusive(&self) -> bool {
        self.lock.is_exclusive()
    }
}

pub(crate) struct LockManager<'a> {
    locks_dir: Dir,
    base_dir: &'a Dir,
    timeout: Duration,
}

impl<'a> LockManager<'a> {
    pub(crate) fn open(metadata_root: &Dir, base_dir: &'a Dir, timeout: Duration) -> io::Result<Self> {
        metadata_root.create_dir_all("locks")?;
        let locks_dir = metadata_root.open_dir("locks")?;
        Ok(Self {
            locks_dir,
            base_dir,
            timeout,
        })
    }

    /// Materializes a placeholder for `resource` under the base directory if
    /// it does not already exist on disk, so the lockfile primitive (which
    /// requires *a* file to lock, not necessarily the resource itself, but
    /// we key lockfiles by hash so this anchors existence-sensitive callers
    /// that otherwise might race to create the real resource) has something
    /// stable to reason about. An empty file is used if the resource path
    /// carries a file extension, else an empty directory.
    fn materialize_placeholder(&self, resource: &RelPathBuf) -> io::Result<Option<RelPathBuf>> {
        if self.base_dir.try_exists(resource.as_path())? {
            return Ok(None);
        }
        if let Some(parent) = resource.as_path().parent()
            && !parent.as_os_str().is_empty()
        {
            self.base_dir.create_dir_all(parent)?;
        }
        if resource.file_name_has_extension() {
            self.base_dir.write(resource.as_path(), b"")?;
        } else {
            self.base_dir.create_dir_all(resource.as_path())?;
        }
        Ok(Some(resource.clone()))
    }

    fn acquire(&self, resource: &RelPathBuf, lock_type: LockType) -> Result<HeldLock, TxError> {
        let temp_resource = self.materialize_placeholder(resource)?;
        let name = lock_file_name(resource);
        let deadline = Instant::now() + self.timeout;
        loop {
            match PathLock::try_lock_in(&self.locks_dir, &name, lock_type) {
                Ok(lock) => {
                    return Ok(HeldLock {
                        resource: resource.clone(),
                        lock,
                        temp_resource,
                    });
                }
                Err(TryLockError::WouldBlock) => {
                    if Instant::now() >= deadline {
                        return Err(TxError::LockTimeout {
                            path: resource.clone(),
                            timeout_ms: u64::try_from(self.timeout.as_millis()).unwrap_or(u64::MAX),
                        });
                    }
                    thread::sleep(POLL_INTERVAL);
                }
                Err(TryLockError::Error(err)) => return Err(TxError::UnderlyingIo(err)),
                Err(_) => unreachable!("TryLockError is non-exhaustive but only has these two variants today"),
            }
        }
    }

    pub(crate) fn acquire_shared(&self, resource: &RelPathBuf) -> Result<HeldLock, TxError> {
        self.acquire(resource, LockType::Shared)
    }

    pub(crate) fn acquire_exclusive(&self, resource: &RelPathBuf) -> Result<HeldLock, TxError> {
        self.acquire(resource, LockType::Exclusive)
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use super::*;

    fn open_base(temp: &tempfile::TempDir) -> Dir {
        Dir::open_ambient_dir(temp.path(), cap_std::ambient_authority()).unwrap()
    }

    #[test]
    fn materializes_file_placeholder_for_extensioned_path() -> io::Result<()> {
        let meta_temp = tempfile::tempdir()?;
        let base_temp = tempfile::tempdir()?;
        let meta_dir = open_base(&meta_temp);
        let base_dir = open_base(&base_temp);
        let manager = LockManager::open(&meta_dir, &base_dir, Duration::from_millis(200))?;
        let resource = crate::paths::confine(Path::new("new.txt")).unwrap();
        let held = manager.acquire_exclusive(&resource).unwrap();
        assert_eq!(held.temp_resource().unwrap(), &resource);
        assert!(base_dir.try_exists("new.txt")?);
        Ok(())
    }

    #[test]
    fn materializes_dir_placeholder_for_extensionless_path() -> io::Result<()> {
        let meta_temp = tempfile::tempdir()?;
        let base_temp = tempfile::tempdir()?;
        let meta_dir = open_base(&meta_temp);
        let base_dir = open_base(&base_temp);
        let manager = LockManager::open(&meta_dir, &base_dir, Duration::from_millis(200))?;
        let resource = crate::paths::confine(Path::new("subdir")).unwrap();
        let held = manager.acquire_exclusive(&resource).unwrap();
        assert!(held.temp_resource().is_some());
        assert!(base_dir.metadata("subdir")?.is_dir());
        Ok(())
    }

    #[test]
    fn no_placeholder_when_resource_already_exists() -> io::Result<()> {
        let meta_temp = tempfile::tempdir()?;
        let base_temp = tempfile::tempdir()?;
        let meta_dir = open_base(&meta_temp);
        let base_dir = open_base(&base_temp);
        base_dir.write("existing.txt", b"hi")?;
        let manager = LockManager::open(&meta_dir, &base_dir, Duration::from_millis(200))?;
        let resource = crate::paths::confine(Path::new("existing.txt")).unwrap();
        let held = manager.acquire_exclusive(&resource).unwrap();
        assert!(held.temp_resource().is_none());
        Ok(())
    }

    #[test]
    fn exclusive_then_exclusive_times_out() -> io::Result<()> {
        let meta_temp = tempfile::tempdir()?;
        let base_temp = tempfile::tempdir()?;
        let meta_dir = open_base(&meta_temp);
        let base_dir = open_base(&base_temp);
        let manager = LockManager::open(&meta_dir, &base_dir, Duration::from_millis(80))?;
        let resource = crate::paths::confine(Path::new("a.txt")).unwrap();
        let _held = manager.acquire_exclusive(&resource).unwrap();
        let err = manager.acquire_exclusive(&resource).unwrap_err();
        assert!(matches!(err, TxError::LockTimeout { .. }));
        Ok(())
    }

    #[test]
    fn shared_locks_coexist_through_manager() -> io::Result<()> {
        let meta_temp = tempfile::tempdir()?;
        let base_temp = tempfile::tempdir()?;
        let meta_dir = open_base(&meta_temp);
        let base_dir = open_base(&base_temp);
        base_dir.write("a.txt", b"hi")?;
        let manager = LockManager::open(&meta_dir, &base_dir, Duration::from_millis(200))?;
        let resource = crate::paths::confine(Path::new("a.txt")).unwrap();
        let held1 = manager.acquire_shared(&resource).unwrap();
        let held2 = manager.acquire_shared(&resource).unwrap();
        assert!(!held1.is_exclusive());
        assert!(!held2.is_exclusive());
        Ok(())
    }
}
