//! Transaction begin/commit/rollback (spec.md 4.6). Commit is two-phase: a
//! durable write transitioning the journal to `PREPARED` is the crash
//! consistency line — before it a crash must yield the pre-transaction
//! state, after it the post-commit state is the only acceptable outcome, so
//! execute-phase failures are never rolled back, only logged for recovery to
//! finish. Rollback restores snapshots, drops temporary resources, and is
//! guaranteed to run to completion regardless of what it finds.

use std::{io, path::Path, thread, time::Duration};

use cap_std::fs::Dir;

use crate::{
    error::TxError,
    journal::{JournalRecord, JournalStore, Operation, Status, TxId},
    lock_manager::{HeldLock, LockManager},
    paths::RelPathBuf,
    staging::{self, StagingArea},
};

/// In-memory state for one open transaction.
pub(crate) struct Tx {
    pub(crate) id: TxId,
    pub(crate) journal: JournalRecord,
    pub(crate) staging: StagingArea,
    pub(crate) held_locks: Vec<HeldLock>,
}

impl Tx {
    pub(crate) fn begin(staging_root: &Dir, journal_store: &JournalStore) -> Result<Self, TxError> {
        let id = TxId::new_random();
        let staging = StagingArea::create(staging_root, id)?;
        let journal = JournalRecord::new(id);
        journal_store.write(&journal, false)?;
        tracing::debug!(%id, "transaction started");
        Ok(Self {
            id,
            journal,
            staging,
            held_locks: Vec::new(),
        })
    }

    fn temp_resources(&self) -> Vec<RelPathBuf> {
        self.held_locks
            .iter()
            .filter_map(HeldLock::temp_resource)
            .cloned()
            .collect()
    }

    /// The strength of the lock this transaction already holds over
    /// `resource`, if any (`true` = exclusive). Used by the Operation Layer
    /// to avoid re-acquiring a lock it already holds: `txfs-lock` exclusive
    /// locks are not re-entrant even within one process, so a second
    /// operation in the same transaction that maps to an already-held
    /// resource would otherwise poll until timeout against itself.
    pub(crate) fn held_lock_is_exclusive(&self, resource: &RelPathBuf) -> Option<bool> {
        self.held_locks
            .iter()
            .find(|held| held.resource() == resource)
            .map(HeldLock::is_exclusive)
    }

    /// Removes and returns the lock this transaction holds over `resource`,
    /// releasing it, so a stronger lock can be acquired in its place.
    pub(crate) fn take_held_lock(&mut self, resource: &RelPathBuf) -> Option<HeldLock> {
        let idx = self.held_locks.iter().position(|held| held.resource() == resource)?;
        Some(self.held_locks.remove(idx))
    }
}

/// The bound of "a few" retries the engine allows for a staging artifact
/// that should exist (per the prior existence check) but transiently
/// doesn't, per spec.md 4.6's note on filesystem metadata-propagation
/// artefacts.
const STAGING_SOURCE_RETRIES: u32 = 3;
const STAGING_SOURCE_RETRY_DELAY: Duration = Duration::from_millis(20);

fn ensure_staging_source(staging: &StagingArea, tx_id: TxId, path: &RelPathBuf) -> Result<(), TxError> {
    for attempt in 0..STAGING_SOURCE_RETRIES {
        if staging.exists(path) {
            return Ok(());
        }
        if attempt + 1 < STAGING_SOURCE_RETRIES {
            thread::sleep(STAGING_SOURCE_RETRY_DELAY);
        }
    }
    Err(TxError::StagingMissing {
        tx_id: tx_id.to_string(),
        path: path.clone(),
    })
}

fn remove_best_effort(dir: &Dir, path: &Path) -> io::Result<()> {
    match dir.metadata(path) {
        Ok(meta) if meta.is_dir() => dir.remove_dir_all(path),
        Ok(_) => dir.remove_file(path),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err),
    }
}

/// Applies one journaled operation to the base directory. Used both by
/// commit's execute phase and by recovery's roll-forward of a `PREPARED`
/// transaction.
pub(crate) fn apply_operation(
    base_dir: &Dir,
    staging: &StagingArea,
    tx_id: TxId,
    op: &Operation,
) -> Result<(), TxError> {
    match op {
        Operation::Write { path } => {
            ensure_staging_source(staging, tx_id, path)?;
            staging::move_or_copy(staging.dir(), path.as_path(), base_dir, path.as_path())?;
        }
        Operation::Mkdir { path } => {
            base_dir.create_dir_all(path.as_path())?;
        }
        Operation::Rm { path } => {
            remove_best_effort(base_dir, path.as_path())?;
        }
        Operation::Rename { from, to } => {
            ensure_staging_source(staging, tx_id, to)?;
            staging::move_or_copy(staging.dir(), to.as_path(), base_dir, to.as_path())?;
            remove_best_effort(base_dir, from.as_path())?;
        }
        Operation::Cp { to, .. } => {
            ensure_staging_source(staging, tx_id, to)?;
            staging.copy_to_base(base_dir, to)?;
        }
    }
    Ok(())
}

/// Borrows the shared, per-`Manager::run`-call engine context: the base
/// directory and journal store live for the `Manager`'s lifetime, the lock
/// manager is created fresh for each call.
pub(crate) struct TransactionEngine<'a> {
    base_dir: &'a Dir,
    journal_store: &'a JournalStore,
    lock_manager: LockManager<'a>,
}

impl<'a> TransactionEngine<'a> {
    pub(crate) fn new(
        base_dir: &'a Dir,
        metadata_root: &'a Dir,
        journal_store: &'a JournalStore,
        lock_timeout: Duration,
    ) -> io::Result<Self> {
        let lock_manager = LockManager::open(metadata_root, base_dir, lock_timeout)?;
        Ok(Self {
            base_dir,
            journal_store,
            lock_manager,
        })
    }

    pub(crate) fn lock_manager(&self) -> &LockManager<'a> {
        &self.lock_manager
    }

    pub(crate) fn base_dir(&self) -> &'a Dir {
        self.base_dir
    }

    pub(crate) fn begin(&self, staging_root: &Dir) -> Result<Tx, TxError> {
        Tx::begin(staging_root, self.journal_store)
    }

    /// Phase 1 (prepare) then phase 2 (execute).
    pub(crate) fn commit(&self, mut tx: Tx) -> Result<(), TxError> {
        tx.journal.set_status(Status::Prepared);
        self.journal_store.write(&tx.journal, true)?;
        tracing::debug!(id = %tx.id, "transaction prepared");

        for op in tx.journal.operations() {
            if let Err(err) = apply_operation(self.base_dir, &tx.staging, tx.id, op) {
                tracing::error!(
                    id = %tx.id,
                    error = %err,
                    "fatal error applying operation during commit execute; transaction remains PREPARED for recovery to roll forward"
                );
                return Err(err);
            }
        }

        tx.journal.set_status(Status::Committed);
        self.journal_store.write(&tx.journal, false)?;
        self.journal_store.delete(tx.id)?;
        tx.staging.remove_all()?;
        tracing::debug!(id = %tx.id, "transaction committed");
        Ok(())
    }

    pub(crate) fn rollback(&self, tx: Tx) {
        tracing::debug!(id = %tx.id, "rolling back transaction");

        for target in tx.journal.snapshots().keys() {
            if tx.staging.snapshot_exists(target) {
                if let Err(err) = tx.staging.restore_snapshot_to_base(self.base_dir, target) {
                    tracing::warn!(
                        id = %tx.id, path = %target, error = %err,
                        "failed to restore snapshot during rollback"
                    );
                }
            } else {
                tracing::warn!(id = %tx.id, path = %target, "snapshot missing during rollback, skipping");
            }
        }

        for temp in tx.temp_resources() {
            if let Err(err) = remove_best_effort(self.base_dir, temp.as_path()) {
                tracing::warn!(
                    id = %tx.id, path = %temp, error = %err,
                    "failed to remove temporary lock-anchor resource during rollback"
                );
            }
        }

        drop(tx.held_locks);

        if let Err(err) = tx.staging.remove_all() {
            tracing::warn!(id = %tx.id, error = %err, "failed to remove staging directory during rollback");
        }
        if let Err(err) = self.journal_store.delete(tx.id) {
            tracing::warn!(id = %tx.id, error = %err, "failed to delete journal during rollback");
        }
        tracing::debug!(id = %tx.id, "rollback complete");
    }
}
