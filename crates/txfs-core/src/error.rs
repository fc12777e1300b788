use std::path::PathBuf;

use crate::paths::RelPathBuf;

/// The public error surface of the transaction engine. Every non-fatal
/// condition here is meant to propagate out of a transaction's scope as an
/// ordinary `Result` error, triggering `Manager::run`'s rollback path.
#[derive(Debug, thiserror::Error)]
pub enum TxError {
    #[error("path escapes the base directory: {}", path.display())]
    PathOutsideBase { path: PathBuf },

    #[error("source path does not exist: {}", path)]
    SourceMissing { path: RelPathBuf },

    #[error("target path does not exist: {}", path)]
    TargetMissing { path: RelPathBuf },

    #[error("timed out after {timeout_ms}ms waiting for a lock on {path}")]
    LockTimeout { path: RelPathBuf, timeout_ms: u64 },

    /// The transaction was already `PREPARED` (past the durability barrier)
    /// when a staging artifact it depends on turned out to be missing.
    /// This can only happen if something outside the engine tampered with
    /// `.tx/staging/<id>/`; recovery, not the caller, is responsible for
    /// making progress from here.
    #[error("fatal: transaction {tx_id} is PREPARED but staging path {path} is missing")]
    StagingMissing { tx_id: String, path: RelPathBuf },

    #[error(transparent)]
    UnderlyingIo(#[from] std::io::Error),
}

/// Wraps either the caller's scope error or an engine-side commit/rollback
/// failure, mirroring the teacher's habit (`PersistError` in `temp_dir.rs`)
/// of giving a failure-with-attached-cause its own dedicated type instead of
/// reaching for a generic `anyhow`-style catch-all.
#[derive(Debug, thiserror::Error)]
pub enum RunError<E> {
    #[error(transparent)]
    Scope(E),
    #[error(transparent)]
    Engine(#[from] TxError),
}
