//! Startup recovery (spec.md 4.7). Runs once from `Manager::initialize`:
//! dispatches every on-disk journal record by status and reconciles it.
//! Per-transaction failures are logged and swallowed — a manager that
//! refuses to start because one record is broken is worse than an
//! incompletely-cleaned metadata directory.

use cap_std::fs::Dir;

use crate::{
    engine::apply_operation,
    journal::{JournalRecord, JournalStore, Status, TxId},
    staging::StagingArea,
};

fn cleanup(journal_store: &JournalStore, staging_root: &Dir, id: TxId) {
    if let Err(err) = journal_store.delete(id) {
        tracing::warn!(%id, error = %err, "recovery: failed to delete journal record");
    }
    if let Err(err) = staging_root.remove_dir_all(id.to_string())
        && err.kind() != std::io::ErrorKind::NotFound
    {
        tracing::warn!(%id, error = %err, "recovery: failed to remove staging directory");
    }
}

fn recover_one(base_dir: &Dir, journal_store: &JournalStore, staging_root: &Dir, id: TxId) {
    let Some(mut record) = journal_store.read(id) else {
        tracing::warn!(%id, "journal record missing or unreadable during recovery, discarding");
        cleanup(journal_store, staging_root, id);
        return;
    };

    match record.status() {
        Status::InProgress => {
            tracing::debug!(%id, "recovery: discarding transaction that never reached the prepare barrier");
        }
        Status::Prepared => {
            tracing::debug!(%id, "recovery: rolling forward prepared transaction");
            match StagingArea::open_existing(staging_root, id) {
                Ok(Some(staging)) => {
                    for op in record.operations() {
                        if let Err(err) = apply_operation(base_dir, &staging, id, op) {
                            tracing::warn!(
                                %id, error = %err,
                                "recovery: skipping operation whose staging source is missing (commit was partially executed before the crash)"
                            );
                        }
                    }
                }
                Ok(None) => {
                    tracing::warn!(%id, "recovery: PREPARED transaction has no staging directory; nothing to roll forward");
                }
                Err(err) => {
                    tracing::warn!(%id, error = %err, "recovery: failed to open staging directory for roll-forward");
                }
            }
            record.set_status(Status::Committed);
            if let Err(err) = journal_store.write(&record, false) {
                tracing::warn!(%id, error = %err, "recovery: failed to mark rolled-forward transaction committed");
            }
        }
        Status::Committed | Status::RolledBack => {
            tracing::debug!(%id, "recovery: garbage-collecting terminal transaction");
        }
    }

    cleanup(journal_store, staging_root, id);
}

/// Ensures `.tx/{journal,staging,locks}` exist, then reconciles every
/// journal record found on disk. Never returns an error: recovery is
/// designed to make a best effort and continue even when individual records
/// are unreadable or their staging trees are missing.
pub(crate) fn run(base_dir: &Dir, journal_store: &JournalStore, staging_root: &Dir) {
    let ids = match journal_store.list_ids() {
        Ok(ids) => ids,
        Err(err) => {
            tracing::warn!(error = %err, "recovery: failed to list journal records");
            return;
        }
    };

    for id in ids {
        recover_one(base_dir, journal_store, staging_root, id);
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use super::*;

    fn open(temp: &tempfile::TempDir) -> Dir {
        Dir::open_ambient_dir(temp.path(), cap_std::ambient_authority()).unwrap()
    }

    /// Scenario 4: a journal written as PREPARED with a matching staging
    /// artifact, as if the process crashed after the prepare barrier but
    /// before (or during) execute. Recovery must roll the write forward.
    #[test]
    fn crash_after_prepare_rolls_forward() {
        let base_temp = tempfile::tempdir().unwrap();
        let meta_temp = tempfile::tempdir().unwrap();
        let base_dir = open(&base_temp);
        let metadata_root = open(&meta_temp);
        metadata_root.create_dir_all("staging").unwrap();
        let staging_root = metadata_root.open_dir("staging").unwrap();
        let journal_store = JournalStore::open(&metadata_root).unwrap();

        let id = TxId::new_random();
        let staging = StagingArea::create(&staging_root, id).unwrap();
        let path = crate::paths::confine(Path::new("new.txt")).unwrap();
        staging.write_file(&path, b"from staging").unwrap();

        let mut record = JournalRecord::new(id);
        record.push_write(path);
        record.set_status(Status::Prepared);
        journal_store.write(&record, true).unwrap();

        run(&base_dir, &journal_store, &staging_root);

        assert_eq!(base_dir.read("new.txt").unwrap(), b"from staging");
        assert!(journal_store.read(id).is_none());
        assert!(!staging_root.try_exists(id.to_string()).unwrap());
    }

    /// Scenario 5: a journal planted as IN_PROGRESS (never reached the
    /// prepare barrier) with a matching staging artifact. Recovery must
    /// discard it: the write never happened as far as the base directory is
    /// concerned.
    #[test]
    fn crash_in_progress_is_discarded() {
        let base_temp = tempfile::tempdir().unwrap();
        let meta_temp = tempfile::tempdir().unwrap();
        let base_dir = open(&base_temp);
        let metadata_root = open(&meta_temp);
        metadata_root.create_dir_all("staging").unwrap();
        let staging_root = metadata_root.open_dir("staging").unwrap();
        let journal_store = JournalStore::open(&metadata_root).unwrap();

        let id = TxId::new_random();
        let staging = StagingArea::create(&staging_root, id).unwrap();
        let path = crate::paths::confine(Path::new("new.txt")).unwrap();
        staging.write_file(&path, b"from staging").unwrap();

        let mut record = JournalRecord::new(id);
        record.push_write(path);
        journal_store.write(&record, false).unwrap();

        run(&base_dir, &journal_store, &staging_root);

        assert!(!base_dir.try_exists("new.txt").unwrap());
        assert!(journal_store.read(id).is_none());
        assert!(!staging_root.try_exists(id.to_string()).unwrap());
    }

    #[test]
    fn committed_record_is_garbage_collected() {
        let base_temp = tempfile::tempdir().unwrap();
        let meta_temp = tempfile::tempdir().unwrap();
        let base_dir = open(&base_temp);
        let metadata_root = open(&meta_temp);
        metadata_root.create_dir_all("staging").unwrap();
        let staging_root = metadata_root.open_dir("staging").unwrap();
        let journal_store = JournalStore::open(&metadata_root).unwrap();

        let id = TxId::new_random();
        let mut record = JournalRecord::new(id);
        record.set_status(Status::Committed);
        journal_store.write(&record, false).unwrap();

        run(&base_dir, &journal_store, &staging_root);

        assert!(journal_store.read(id).is_none());
    }
}
