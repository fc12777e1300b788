//! The Operation Layer (spec.md 4.5): transaction-local semantics for every
//! handle method. Each acquires its locks, checks a transaction-aware
//! existence precondition where the operation has one, mutates the staging
//! area, then appends to the journal — never releasing a lock before the
//! transaction ends.

use std::{io, path::Path};

use cap_std::fs::Dir;
use txfs_lock::LockType;

use crate::{
    engine::Tx,
    error::TxError,
    journal::JournalStore,
    lock_manager::{HeldLock, LockManager},
    paths::{self, RelPathBuf},
    staging,
};

/// The handle passed to a `Manager::run` scope closure. All paths are
/// caller-relative and are confined to the base directory before any
/// filesystem access.
pub struct TxHandle<'a> {
    pub(crate) tx: Tx,
    pub(crate) base_dir: &'a Dir,
    pub(crate) lock_manager: &'a LockManager<'a>,
    pub(crate) journal_store: &'a JournalStore,
}

impl<'a> TxHandle<'a> {
    fn persist_journal(&self) -> Result<(), TxError> {
        self.journal_store.write(&self.tx.journal, false)
    }

    /// Acquires `lock_type` on `resource`, unless this transaction already
    /// holds a sufficient lock on it (an exclusive lock already covers any
    /// request; a held shared lock covers a further shared request). A held
    /// shared lock is released and replaced when a later operation in the
    /// same transaction needs exclusive access to the same resource — this
    /// is the only case where re-entrancy requires a real release-then-
    /// reacquire, since `txfs-lock` exclusive locks are not re-entrant even
    /// within one process. Two operations in one transaction mapping to the
    /// same resource (e.g. two `write()`s to a not-yet-committed file, or
    /// `mkdir(p)`/`remove(p)` called twice) would otherwise poll against a
    /// lock this same transaction is already holding, until timeout.
    fn ensure_lock(&mut self, resource: &RelPathBuf, lock_type: LockType) -> Result<(), TxError> {
        match self.tx.held_lock_is_exclusive(resource) {
            Some(true) => return Ok(()),
            Some(false) if lock_type == LockType::Shared => return Ok(()),
            Some(false) | None => {}
        }

        let carried_temp_resource = self
            .tx
            .take_held_lock(resource)
            .and_then(HeldLock::into_temp_resource);

        let mut held = match lock_type {
            LockType::Shared => self.lock_manager.acquire_shared(resource)?,
            LockType::Exclusive => self.lock_manager.acquire_exclusive(resource)?,
        };
        if held.temp_resource().is_none() {
            held.set_temp_resource(carried_temp_resource);
        }
        self.tx.held_locks.push(held);
        Ok(())
    }

    /// Transaction-aware existence (spec.md 4.5): journal overrides staging
    /// overrides base.
    fn exists_aware(&self, p: &RelPathBuf) -> bool {
        let journal = &self.tx.journal;
        if journal.is_removed(p) {
            return false;
        }
        if journal.is_rename_source(p) {
            return false;
        }
        if journal.is_rename_target(p) {
            return true;
        }
        if journal.is_created(p) {
            return true;
        }
        if self.tx.staging.exists(p) {
            return true;
        }
        self.base_dir.try_exists(p.as_path()).unwrap_or(false)
    }

    fn snapshot_if_needed(&mut self, target: &RelPathBuf) -> Result<(), TxError> {
        if self.tx.staging.snapshot_exists(target) {
            return Ok(());
        }
        self.tx.staging.snapshot_from_base(self.base_dir, target)?;
        self.tx.journal.record_snapshot(
            target.clone(),
            paths::RelPathBuf::new_trusted(staging::snapshot_rel_path(target)),
        );
        self.persist_journal()
    }

    /// Pure transaction-aware existence check; acquires no locks.
    pub fn exists(&self, path: impl AsRef<Path>) -> Result<bool, TxError> {
        let p = paths::confine(path.as_ref())?;
        Ok(self.exists_aware(&p))
    }

    pub fn write(&mut self, path: impl AsRef<Path>, data: &[u8]) -> Result<(), TxError> {
        let p = paths::confine(path.as_ref())?;
        let lock_target = if self.base_dir.try_exists(p.as_path())? {
            p.clone()
        } else {
            p.parent()
        };
        self.ensure_lock(&lock_target, LockType::Exclusive)?;

        self.tx.staging.write_file(&p, data)?;
        self.tx.journal.push_write(p);
        self.persist_journal()
    }

    pub fn append(&mut self, path: impl AsRef<Path>, data: &[u8]) -> Result<(), TxError> {
        let p = paths::confine(path.as_ref())?;
        self.ensure_lock(&p, LockType::Exclusive)?;

        let mut current = if self.tx.staging.exists(&p) {
            self.tx.staging.read_file(&p)?
        } else {
            match self.base_dir.read(p.as_path()) {
                Ok(bytes) => bytes,
                Err(err) if err.kind() == io::ErrorKind::NotFound => Vec::new(),
                Err(err) => return Err(TxError::UnderlyingIo(err)),
            }
        };
        current.extend_from_slice(data);
        self.tx.staging.write_file(&p, &current)?;
        self.tx.journal.push_write(p);
        self.persist_journal()
    }

    pub fn read(&mut self, path: impl AsRef<Path>) -> Result<Vec<u8>, TxError> {
        let p = paths::confine(path.as_ref())?;
        self.ensure_lock(&p, LockType::Shared)?;

        if self.tx.staging.exists(&p) {
            self.tx.staging.read_file(&p).map_err(TxError::UnderlyingIo)
        } else {
            match self.base_dir.read(p.as_path()) {
                Ok(bytes) => Ok(bytes),
                Err(err) if err.kind() == io::ErrorKind::NotFound => {
                    Err(TxError::SourceMissing { path: p })
                }
                Err(err) => Err(TxError::UnderlyingIo(err)),
            }
        }
    }

    pub fn remove(&mut self, path: impl AsRef<Path>) -> Result<(), TxError> {
        let p = paths::confine(path.as_ref())?;
        let parent = p.parent();
        self.ensure_lock(&parent, LockType::Exclusive)?;

        // Once RM{p} is journaled, transaction-aware existence treats p as
        // gone for the rest of the transaction regardless of any staged
        // content, so any staging copy (from an earlier write/mkdir/rename
        // onto p within this tx) is now dead weight.
        self.tx.staging.remove_entry(&p)?;
        self.tx.journal.push_rm(p);
        self.persist_journal()
    }

    pub fn mkdir(&mut self, path: impl AsRef<Path>, recursive: bool) -> Result<(), TxError> {
        let p = paths::confine(path.as_ref())?;
        let parent = p.parent();
        self.ensure_lock(&parent, LockType::Exclusive)?;

        if !recursive && !parent.as_path().as_os_str().is_empty() && !self.exists_aware(&parent) {
            return Err(TxError::TargetMissing { path: parent });
        }

        self.tx.staging.mkdir(&p, recursive)?;
        self.tx.journal.push_mkdir(p);
        self.persist_journal()
    }

    pub fn rename(&mut self, old: impl AsRef<Path>, new: impl AsRef<Path>) -> Result<(), TxError> {
        let old_p = paths::confine(old.as_ref())?;
        let new_p = paths::confine(new.as_ref())?;

        let mut targets = [old_p.parent(), new_p.parent()];
        targets.sort();
        for target in &targets {
            self.ensure_lock(target, LockType::Exclusive)?;
        }

        if !self.exists_aware(&old_p) {
            return Err(TxError::SourceMissing { path: old_p });
        }
        if self.exists_aware(&new_p) {
            self.snapshot_if_needed(&new_p)?;
        }

        if self.tx.staging.exists(&old_p) {
            self.tx.staging.copy_within(&old_p, &new_p)?;
        } else {
            self.tx.staging.copy_from_base(self.base_dir, &old_p, &new_p)?;
        }
        self.tx.journal.push_rename(old_p, new_p);
        self.persist_journal()
    }

    pub fn copy(&mut self, src: impl AsRef<Path>, dst: impl AsRef<Path>) -> Result<(), TxError> {
        let src_p = paths::confine(src.as_ref())?;
        let dst_p = paths::confine(dst.as_ref())?;

        self.ensure_lock(&src_p, LockType::Shared)?;
        let dst_parent = dst_p.parent();
        self.ensure_lock(&dst_parent, LockType::Exclusive)?;

        if !self.exists_aware(&src_p) {
            return Err(TxError::SourceMissing { path: src_p });
        }
        if self.exists_aware(&dst_p) {
            self.snapshot_if_needed(&dst_p)?;
        }

        if self.tx.staging.exists(&src_p) {
            self.tx.staging.copy_within(&src_p, &dst_p)?;
        } else {
            self.tx.staging.copy_from_base(self.base_dir, &src_p, &dst_p)?;
        }
        self.tx.journal.push_cp(src_p, dst_p);
        self.persist_journal()
    }

    pub fn snapshot_dir(&mut self, path: impl AsRef<Path>) -> Result<(), TxError> {
        let p = paths::confine(path.as_ref())?;

        self.ensure_lock(&p, LockType::Shared)?;

        let is_dir = match self.base_dir.metadata(p.as_path()) {
            Ok(meta) => meta.is_dir(),
            Err(err) if err.kind() == io::ErrorKind::NotFound => false,
            Err(err) => return Err(TxError::UnderlyingIo(err)),
        };
        if !is_dir {
            return Err(TxError::SourceMissing { path: p });
        }

        self.snapshot_if_needed(&p)
    }
}
