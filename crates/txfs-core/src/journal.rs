//! The durable per-transaction record: `{id, status, operations[],
//! snapshots{}}`, persisted as `journal/<id>.json`. Grounded on the
//! teacher's `CommitSchema`/`CommitEntry` (`atomic_dir/schema.rs`), widened
//! from the teacher's two entry kinds (overwrite, delete) to the five this
//! system needs, plus an explicit lifecycle `Status` the teacher's
//! single-purpose commit file didn't need (it only ever represented "a
//! commit is in flight").

use std::{
    collections::BTreeMap,
    fmt,
    io,
    path::Path,
    time::Duration,
};

use cap_std::fs::Dir;
use rand::RngCore as _;
use serde::{Deserialize, Serialize};

use crate::{
    error::TxError,
    paths::RelPathBuf,
    util::{CreateMode, write_file_atomic},
};

/// A transaction identifier: 128 bits of randomness, hex-encoded so it is
/// safe to use directly as a filename on every platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TxId([u8; 16]);

impl TxId {
    #[must_use]
    pub fn new_random() -> Self {
        let mut bytes = [0u8; 16];
        rand::rng().fill_bytes(&mut bytes);
        Self(bytes)
    }

    fn file_name(self) -> String {
        format!("{self}.json")
    }
}

impl fmt::Display for TxId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

impl std::str::FromStr for TxId {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() != 32 {
            return Err(());
        }
        let mut bytes = [0u8; 16];
        for (i, chunk) in bytes.iter_mut().enumerate() {
            *chunk = u8::from_str_radix(&s[i * 2..i * 2 + 2], 16).map_err(|_| ())?;
        }
        Ok(Self(bytes))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) enum Status {
    InProgress,
    Prepared,
    Committed,
    RolledBack,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub(crate) enum Operation {
    Write { path: RelPathBuf },
    Mkdir { path: RelPathBuf },
    Rm { path: RelPathBuf },
    Rename { from: RelPathBuf, to: RelPathBuf },
    Cp { from: RelPathBuf, to: RelPathBuf },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct JournalRecord {
    id: TxId,
    status: Status,
    operations: Vec<Operation>,
    snapshots: BTreeMap<RelPathBuf, RelPathBuf>,
}

impl JournalRecord {
    pub(crate) fn new(id: TxId) -> Self {
        Self {
            id,
            status: Status::InProgress,
            operations: Vec::new(),
            snapshots: BTreeMap::new(),
        }
    }

    pub(crate) fn id(&self) -> TxId {
        self.id
    }

    pub(crate) fn status(&self) -> Status {
        self.status
    }

    pub(crate) fn set_status(&mut self, status: Status) {
        self.status = status;
    }

    pub(crate) fn operations(&self) -> &[Operation] {
        &self.operations
    }

    pub(crate) fn snapshots(&self) -> &BTreeMap<RelPathBuf, RelPathBuf> {
        &self.snapshots
    }

    pub(crate) fn record_snapshot(&mut self, target: RelPathBuf, snapshot_path: RelPathBuf) {
        self.snapshots.insert(target, snapshot_path);
    }

    // --- transaction-aware existence helpers (spec.md 4.5) ---

    pub(crate) fn is_removed(&self, path: &RelPathBuf) -> bool {
        self.operations
            .iter()
            .any(|op| matches!(op, Operation::Rm { path: p } if p == path))
    }

    pub(crate) fn is_rename_source(&self, path: &RelPathBuf) -> bool {
        self.operations
            .iter()
            .any(|op| matches!(op, Operation::Rename { from, .. } if from == path))
    }

    pub(crate) fn is_rename_target(&self, path: &RelPathBuf) -> bool {
        self.operations
            .iter()
            .any(|op| matches!(op, Operation::Rename { to, .. } if to == path))
    }

    pub(crate) fn is_created(&self, path: &RelPathBuf) -> bool {
        self.operations.iter().any(|op| match op {
            Operation::Write { path: p } | Operation::Mkdir { path: p } => p == path,
            Operation::Cp { to, .. } => to == path,
            _ => false,
        })
    }

    pub(crate) fn has_write(&self, path: &RelPathBuf) -> bool {
        self.operations
            .iter()
            .any(|op| matches!(op, Operation::Write { path: p } if p == path))
    }

    pub(crate) fn has_mkdir(&self, path: &RelPathBuf) -> bool {
        self.operations
            .iter()
            .any(|op| matches!(op, Operation::Mkdir { path: p } if p == path))
    }

    pub(crate) fn has_rm(&self, path: &RelPathBuf) -> bool {
        self.operations
            .iter()
            .any(|op| matches!(op, Operation::Rm { path: p } if p == path))
    }

    pub(crate) fn push_write(&mut self, path: RelPathBuf) {
        if !self.has_write(&path) {
            self.operations.push(Operation::Write { path });
        }
    }

    pub(crate) fn push_mkdir(&mut self, path: RelPathBuf) {
        if !self.has_mkdir(&path) {
            self.operations.push(Operation::Mkdir { path });
        }
    }

    pub(crate) fn push_rm(&mut self, path: RelPathBuf) {
        if !self.has_rm(&path) {
            self.operations.push(Operation::Rm { path });
        }
    }

    pub(crate) fn push_rename(&mut self, from: RelPathBuf, to: RelPathBuf) {
        self.operations.push(Operation::Rename { from, to });
    }

    pub(crate) fn push_cp(&mut self, from: RelPathBuf, to: RelPathBuf) {
        self.operations.push(Operation::Cp { from, to });
    }
}

/// Durable read/write/list/delete of journal records, keyed by [`TxId`].
pub(crate) struct JournalStore {
    dir: Dir,
}

fn is_transient_permission_error(err: &io::Error) -> bool {
    err.kind() == io::ErrorKind::PermissionDenied
}

/// Retries `f` with exponential backoff while it fails with a transient
/// host-filesystem permission error (spec.md 4.3), up to a small bound.
fn retry_with_backoff<T>(mut f: impl FnMut() -> io::Result<T>) -> io::Result<T> {
    let mut delay = Duration::from_millis(10);
    for attempt in 0..5 {
        match f() {
            Ok(v) => return Ok(v),
            Err(err) if is_transient_permission_error(&err) && attempt < 4 => {
                tracing::warn!(error = %err, attempt, "transient permission error writing journal, retrying");
                std::thread::sleep(delay);
                delay *= 2;
            }
            Err(err) => return Err(err),
        }
    }
    unreachable!("loop always returns on the final attempt")
}

impl JournalStore {
    pub(crate) fn open(metadata_root: &Dir) -> io::Result<Self> {
        metadata_root.create_dir_all("journal")?;
        let dir = metadata_root.open_dir("journal")?;
        Ok(Self { dir })
    }

    pub(crate) fn write(&self, record: &JournalRecord, durable: bool) -> Result<(), TxError> {
        self.dir.create_dir_all("")?;
        let data =
            serde_json::to_vec_pretty(record).map_err(|e| TxError::UnderlyingIo(io::Error::other(e)))?;
        retry_with_backoff(|| {
            write_file_atomic(
                &self.dir,
                Path::new(&record.id().file_name()),
                &data,
                durable,
                CreateMode::Overwrite,
            )
        })?;
        Ok(())
    }

    /// Reads the record for `id`. A malformed/unparsable file is treated as
    /// absent (and logged), per spec.md 4.3, so a single corrupt record
    /// can't block recovery.
    pub(crate) fn read(&self, id: TxId) -> Option<JournalRecord> {
        match self.dir.read(id.file_name()) {
            Ok(bytes) => match serde_json::from_slice(&bytes) {
                Ok(record) => Some(record),
                Err(err) => {
                    tracing::warn!(%id, error = %err, "journal record is corrupt, treating as absent");
                    None
                }
            },
            Err(err) if err.kind() == io::ErrorKind::NotFound => None,
            Err(err) => {
                tracing::warn!(%id, error = %err, "failed to read journal record, treating as absent");
                None
            }
        }
    }

    pub(crate) fn list_ids(&self) -> io::Result<Vec<TxId>> {
        let mut ids = Vec::new();
        for entry in self.dir.entries()? {
            let entry = entry?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            let Some(stem) = name.strip_suffix(".json") else {
                continue;
            };
            if let Ok(id) = stem.parse::<TxId>() {
                ids.push(id);
            }
        }
        Ok(ids)
    }

    pub(crate) fn delete(&self, id: TxId) -> io::Result<()> {
        match self.dir.remove_file(id.file_name()) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tx_id_round_trips_through_display_and_parse() {
        let id = TxId::new_random();
        let text = id.to_string();
        assert_eq!(text.len(), 32);
        let parsed: TxId = text.parse().unwrap();
        assert_eq!(parsed, id);
    }

    #[test]
    fn journal_store_read_after_write() -> io::Result<()> {
        let temp = tempfile::tempdir()?;
        let dir = Dir::open_ambient_dir(temp.path(), cap_std::ambient_authority())?;
        let store = JournalStore::open(&dir)?;
        let mut record = JournalRecord::new(TxId::new_random());
        record.push_write(crate::paths::confine(Path::new("a.txt")).unwrap());
        store.write(&record, true).unwrap();
        let read_back = store.read(record.id()).unwrap();
        assert_eq!(read_back.operations().len(), 1);
        Ok(())
    }

    #[test]
    fn journal_store_read_missing_is_none() -> io::Result<()> {
        let temp = tempfile::tempdir()?;
        let dir = Dir::open_ambient_dir(temp.path(), cap_std::ambient_authority())?;
        let store = JournalStore::open(&dir)?;
        assert!(store.read(TxId::new_random()).is_none());
        Ok(())
    }

    #[test]
    fn journal_store_read_corrupt_is_none() -> io::Result<()> {
        let temp = tempfile::tempdir()?;
        let dir = Dir::open_ambient_dir(temp.path(), cap_std::ambient_authority())?;
        let store = JournalStore::open(&dir)?;
        let id = TxId::new_random();
        dir.create_dir_all("journal")?;
        let journal_dir = dir.open_dir("journal")?;
        journal_dir.write(id.file_name(), b"not json")?;
        assert!(store.read(id).is_none());
        Ok(())
    }

    #[test]
    fn journal_store_delete_is_idempotent() -> io::Result<()> {
        let temp = tempfile::tempdir()?;
        let dir = Dir::open_ambient_dir(temp.path(), cap_std::ambient_authority())?;
        let store = JournalStore::open(&dir)?;
        let id = TxId::new_random();
        store.delete(id)?;
        store.delete(id)?;
        Ok(())
    }
}
