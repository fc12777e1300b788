//! ACID transactions over a directory subtree rooted at a user-chosen base
//! directory: two-phase commit, a crash-recoverable journal, a staging area
//! that isolates uncommitted writes, snapshot-based rollback for overwrite
//! operations, and path-keyed advisory locking that serializes conflicting
//! writers. Generalized from the teacher's single-purpose `atomic-dir`
//! engine (which protected exactly one directory's worth of overwrite/
//! delete operations) to an arbitrary base directory and the five
//! operation kinds this system needs: write, mkdir, remove, rename, copy.
//!
//! Committed changes survive process crashes. Uncommitted changes leave the
//! base directory byte-identical to its pre-transaction state after the
//! next [`Manager::initialize`] runs recovery.
//!
//! ```ignore
//! let mut manager = Manager::new(&TxConfig::new("/some/dir"))?;
//! manager.initialize()?;
//! manager.run(|tx| -> Result<(), std::io::Error> {
//!     tx.write("a.txt", b"hello")?;
//!     Ok(())
//! })?;
//! ```

mod engine;
mod error;
mod journal;
mod lock_manager;
mod manager;
mod ops;
mod paths;
mod recovery;
mod staging;
mod util;

pub use error::{RunError, TxError};
pub use manager::{Manager, TxConfig};
pub use ops::TxHandle;
pub use paths::RelPathBuf;
