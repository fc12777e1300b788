//! Path/file-keyed advisory locking.
//!
//! A [`PathLock`] is an OS-level advisory lock (`std::fs::File::lock` /
//! `try_lock`) on a file, fronted by an in-process arbitration layer
//! ([`shared_lock_set`]) that prevents a single process from deadlocking
//! itself when two callers in the same process lock the same path through
//! two independent file handles — `flock`-style advisory locks are scoped
//! per open file description, not per process, so two handles to the same
//! file would otherwise be free to both "hold" the OS lock at once.
//!
//! Unlike the caller this crate was generalized from, a `PathLock` carries
//! no on-disk payload: no revision counter, no poison flag. Higher layers
//! that need to detect "did someone else touch this resource while I held
//! a shared lock" track that themselves (here, via the journal), so the
//! lock file itself is a zero-length sentinel.
mod err_helpers;
mod shared_lock_set;
mod waiter;

use std::{fs::TryLockError, io};

use cap_std::fs::{Dir, OpenOptions};

pub use shared_lock_set::LockType;

use crate::shared_lock_set::Lock;

/// A held advisory lock on a single file below some [`cap_std::fs::Dir`].
#[derive(Debug)]
pub struct PathLock {
    lock: Option<Lock>,
}

impl PathLock {
    /// Opens (creating if necessary) `lock_name` under `root_dir` and blocks
    /// until `lock_type` can be acquired.
    pub fn lock_in(root_dir: &Dir, lock_name: &str, lock_type: LockType) -> io::Result<Self> {
        let file = root_dir
            .open_with(
                lock_name,
                OpenOptions::new().create(true).write(true).read(true),
            )?
            .into_std();
        let lock = shared_lock_set::lock_file(file, lock_type)?;
        Ok(Self { lock: Some(lock) })
    }

    /// Like [`Self::lock_in`], but returns immediately with
    /// `Err(TryLockError::WouldBlock)` instead of blocking.
    pub fn try_lock_in(
        root_dir: &Dir,
        lock_name: &str,
        lock_type: LockType,
    ) -> Result<Self, TryLockError> {
        let file = root_dir
            .open_with(
                lock_name,
                OpenOptions::new().create(true).write(true).read(true),
            )
            .map_err(TryLockError::Error)?
            .into_std();
        let lock = shared_lock_set::try_lock_file(file, lock_type)?;
        Ok(Self { lock: Some(lock) })
    }

    #[must_use]
    pub fn lock_type(&self) -> LockType {
        self.lock.as_ref().expect("lock is valid").lock_type()
    }

    #[must_use]
    pub fn is_exclusive(&self) -> bool {
        self.lock
            .as_ref()
            .is_some_and(|l| l.lock_type().is_exclusive())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exclusive_lock_blocks_another_exclusive() -> io::Result<()> {
        let temp_dir = tempfile::tempdir()?;
        let root_dir = Dir::open_ambient_dir(temp_dir.path(), cap_std::ambient_authority())?;
        let _initial_lock = PathLock::lock_in(&root_dir, "test.lock", LockType::Exclusive)?;
        let err = PathLock::try_lock_in(&root_dir, "test.lock", LockType::Exclusive).unwrap_err();
        assert!(matches!(err, TryLockError::WouldBlock));
        Ok(())
    }

    #[test]
    fn shared_locks_coexist() -> io::Result<()> {
        let temp_dir = tempfile::tempdir()?;
        let root_dir = Dir::open_ambient_dir(temp_dir.path(), cap_std::ambient_authority())?;
        let _shared_lock1 = PathLock::lock_in(&root_dir, "test.lock", LockType::Shared)?;
        let _shared_lock2 = PathLock::lock_in(&root_dir, "test.lock", LockType::Shared)?;
        Ok(())
    }

    #[test]
    fn shared_lock_blocks_exclusive() -> io::Result<()> {
        let temp_dir = tempfile::tempdir()?;
        let root_dir = Dir::open_ambient_dir(temp_dir.path(), cap_std::ambient_authority())?;
        let _shared = PathLock::lock_in(&root_dir, "test.lock", LockType::Shared)?;
        let err = PathLock::try_lock_in(&root_dir, "test.lock", LockType::Exclusive).unwrap_err();
        assert!(matches!(err, TryLockError::WouldBlock));
        Ok(())
    }

    #[test]
    fn lock_released_on_drop() -> io::Result<()> {
        let temp_dir = tempfile::tempdir()?;
        let root_dir = Dir::open_ambient_dir(temp_dir.path(), cap_std::ambient_authority())?;
        {
            let _lock = PathLock::lock_in(&root_dir, "test.lock", LockType::Exclusive)?;
        }
        let _lock2 = PathLock::try_lock_in(&root_dir, "test.lock", LockType::Exclusive)?;
        Ok(())
    }
}
