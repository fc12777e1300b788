//! The `Manager` façade (spec.md §6): owns the base directory and metadata
//! layout, runs recovery once at `initialize`, and gives callers
//! `run(scope)` with guaranteed commit-or-rollback — there is no third
//! outcome.

use std::{path::PathBuf, time::Duration};

use cap_std::fs::Dir;

use crate::{
    engine::TransactionEngine,
    error::{RunError, TxError},
    journal::JournalStore,
    ops::TxHandle,
    recovery,
};

const DEFAULT_METADATA_DIR_NAME: &str = ".tx";
const DEFAULT_LOCK_TIMEOUT_MS: u64 = 10_000;

/// `{base_directory, metadata_dir_name?, lock_timeout_ms?}`, defaults
/// `.tx` / `10000`, per spec.md §6.
pub struct TxConfig {
    pub base_directory: PathBuf,
    pub metadata_dir_name: Option<String>,
    pub lock_timeout_ms: Option<u64>,
}

impl TxConfig {
    #[must_use]
    pub fn new(base_directory: impl Into<PathBuf>) -> Self {
        Self {
            base_directory: base_directory.into(),
            metadata_dir_name: None,
            lock_timeout_ms: None,
        }
    }

    fn metadata_dir_name(&self) -> &str {
        self.metadata_dir_name
            .as_deref()
            .unwrap_or(DEFAULT_METADATA_DIR_NAME)
    }

    fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms.unwrap_or(DEFAULT_LOCK_TIMEOUT_MS))
    }
}

impl Default for TxConfig {
    fn default() -> Self {
        Self::new(".")
    }
}

/// Wires the base directory and its `.tx/{journal,staging,locks}` metadata
/// root, and is the single entry point callers use to run transactions.
/// `initialized` is a plain field on the value, never a process-wide
/// singleton, per the teacher's design notes on avoiding hoisted global
/// state.
pub struct Manager {
    base_dir: Dir,
    metadata_root: Dir,
    staging_root: Dir,
    journal_store: JournalStore,
    lock_timeout: Duration,
    initialized: bool,
}

impl Manager {
    /// Opens (creating if necessary) the base directory and its metadata
    /// root. Does not run recovery; call [`Self::initialize`] before
    /// [`Self::run`].
    pub fn new(config: &TxConfig) -> Result<Self, TxError> {
        std::fs::create_dir_all(&config.base_directory)?;
        let base_dir = Dir::open_ambient_dir(&config.base_directory, cap_std::ambient_authority())?;
        base_dir.create_dir_all(config.metadata_dir_name())?;
        let metadata_root = base_dir.open_dir(config.metadata_dir_name())?;
        metadata_root.create_dir_all("staging")?;
        let staging_root = metadata_root.open_dir("staging")?;
        let journal_store = JournalStore::open(&metadata_root)?;
        Ok(Self {
            base_dir,
            metadata_root,
            staging_root,
            journal_store,
            lock_timeout: config.lock_timeout(),
            initialized: false,
        })
    }

    /// Idempotent: ensures `locks/` exists and runs recovery over every
    /// journal record found on disk. A second call is a no-op.
    pub fn initialize(&mut self) -> Result<(), TxError> {
        if self.initialized {
            return Ok(());
        }
        self.metadata_root.create_dir_all("locks")?;
        recovery::run(&self.base_dir, &self.journal_store, &self.staging_root);
        self.initialized = true;
        Ok(())
    }

    /// Begins a transaction, runs `scope` against its handle, and commits on
    /// a clean return or rolls back on an error.
    pub fn run<T, E>(&self, scope: impl FnOnce(&mut TxHandle<'_>) -> Result<T, E>) -> Result<T, RunError<E>> {
        let engine = TransactionEngine::new(
            &self.base_dir,
            &self.metadata_root,
            &self.journal_store,
            self.lock_timeout,
        )
        .map_err(TxError::from)?;
        let tx = engine.begin(&self.staging_root)?;
        let mut handle = TxHandle {
            tx,
            base_dir: engine.base_dir(),
            lock_manager: engine.lock_manager(),
            journal_store: &self.journal_store,
        };

        match scope(&mut handle) {
            Ok(value) => {
                engine.commit(handle.tx)?;
                Ok(value)
            }
            Err(scope_err) => {
                engine.rollback(handle.tx);
                Err(RunError::Scope(scope_err))
            }
        }
    }
}
