//! Per-transaction scratch directory: `staging/<id>/` mirrors caller-relative
//! paths that will become the base directory's new content at commit; the
//! reserved child `_snapshots/` holds pre-transaction backups of overwrite
//! targets, indexed the same way.

use std::{io, path::Path};

use cap_std::fs::Dir;

use crate::{journal::TxId, paths::RelPathBuf};

const SNAPSHOTS_DIR: &str = "_snapshots";

/// The location, relative to a transaction's staging directory, of the
/// pre-transaction backup of `target`.
pub(crate) fn snapshot_rel_path(target: &RelPathBuf) -> std::path::PathBuf {
    Path::new(SNAPSHOTS_DIR).join(target.as_path())
}

/// Moves `src_rel` from `src_root` to `dst_rel` under `dst_root`, falling
/// back to a recursive copy-then-remove when the two roots don't share a
/// filesystem (or any other rename failure) — mirrors the teacher's
/// rename-with-EPERM/cross-device fallback in `atomic_dir::util::recover2`.
pub(crate) fn move_or_copy(
    src_root: &Dir,
    src_rel: &Path,
    dst_root: &Dir,
    dst_rel: &Path,
) -> io::Result<()> {
    if let Some(parent) = dst_rel.parent()
        && !parent.as_os_str().is_empty()
    {
        dst_root.create_dir_all(parent)?;
    }
    if src_root.rename(src_rel, dst_root, dst_rel).is_ok() {
        return Ok(());
    }
    copy_recursive(src_root, src_rel, dst_root, dst_rel)?;
    let meta = src_root.metadata(src_rel)?;
    if meta.is_dir() {
        src_root.remove_dir_all(src_rel)
    } else {
        src_root.remove_file(src_rel)
    }
}

/// Recursively copies `src_rel` (file or directory) from `src_root` into
/// `dst_rel` under `dst_root`. The two roots may be the same `Dir` (e.g.
/// copying within staging) or different ones (base -> staging, staging ->
/// base). Symlinks are not given special treatment, per spec.md's
/// non-goals.
fn copy_recursive(src_root: &Dir, src_rel: &Path, dst_root: &Dir, dst_rel: &Path) -> io::Result<()> {
    let meta = src_root.metadata(src_rel)?;
    if meta.is_dir() {
        dst_root.create_dir_all(dst_rel)?;
        for entry in src_root.read_dir(src_rel)? {
            let entry = entry?;
            let name = entry.file_name();
            copy_recursive(
                src_root,
                &src_rel.join(&name),
                dst_root,
                &dst_rel.join(&name),
            )?;
        }
        Ok(())
    } else {
        if let Some(parent) = dst_rel.parent()
            && !parent.as_os_str().is_empty()
        {
            dst_root.create_dir_all(parent)?;
        }
        src_root.copy(src_rel, dst_root, dst_rel)?;
        Ok(())
    }
}

pub(crate) struct StagingArea {
    staging_root: Dir,
    id: TxId,
    dir: Dir,
}

impl StagingArea {
    pub(crate) fn create(staging_root: &Dir, id: TxId) -> io::Result<Self> {
        let name = id.to_string();
        staging_root.create_dir_all(&name)?;
        let dir = staging_root.open_dir(&name)?;
        dir.create_dir_all(SNAPSHOTS_DIR)?;
        Ok(Self {
            staging_root: staging_root.try_clone()?,
            id,
            dir,
        })
    }

    pub(crate) fn open_existing(staging_root: &Dir, id: TxId) -> io::Result<Option<Self>> {
        match staging_root.open_dir(id.to_string()) {
            Ok(dir) => Ok(Some(Self {
                staging_root: staging_root.try_clone()?,
                id,
                dir,
            })),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err),
        }
    }

    pub(crate) fn dir(&self) -> &Dir {
        &self.dir
    }

    fn ensure_parent(&self, rel: &Path) -> io::Result<()> {
        if let Some(parent) = rel.parent()
            && !parent.as_os_str().is_empty()
        {
            self.dir.create_dir_all(parent)?;
        }
        Ok(())
    }

    pub(crate) fn write_file(&self, rel: &RelPathBuf, data: &[u8]) -> io::Result<()> {
        self.ensure_parent(rel.as_path())?;
        self.dir.write(rel.as_path(), data)
    }

    pub(crate) fn read_file(&self, rel: &RelPathBuf) -> io::Result<Vec<u8>> {
        self.dir.read(rel.as_path())
    }

    pub(crate) fn exists(&self, rel: &RelPathBuf) -> bool {
        self.dir.try_exists(rel.as_path()).unwrap_or(false)
    }

    pub(crate) fn mkdir(&self, rel: &RelPathBuf, recursive: bool) -> io::Result<()> {
        self.ensure_parent(rel.as_path())?;
        if recursive {
            self.dir.create_dir_all(rel.as_path())
        } else {
            match self.dir.create_dir(rel.as_path()) {
                Ok(()) => Ok(()),
                Err(err) if err.kind() == io::ErrorKind::AlreadyExists => Ok(()),
                Err(err) => Err(err),
            }
        }
    }

    pub(crate) fn remove_entry(&self, rel: &RelPathBuf) -> io::Result<()> {
        let meta = match self.dir.metadata(rel.as_path()) {
            Ok(meta) => meta,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(err) => return Err(err),
        };
        if meta.is_dir() {
            self.dir.remove_dir_all(rel.as_path())
        } else {
            self.dir.remove_file(rel.as_path())
        }
    }

    /// Copies `src_rel` within staging to `dst_rel` within staging
    /// (used when materializing a rename/copy whose source is itself
    /// already-staged content).
    pub(crate) fn copy_within(&self, src_rel: &RelPathBuf, dst_rel: &RelPathBuf) -> io::Result<()> {
        self.ensure_parent(dst_rel.as_path())?;
        copy_recursive(
            &self.dir,
            src_rel.as_path(),
            &self.dir,
            dst_rel.as_path(),
        )
    }

    /// Copies `src_rel` from the base directory into staging at `dst_rel`.
    pub(crate) fn copy_from_base(
        &self,
        base: &Dir,
        src_rel: &RelPathBuf,
        dst_rel: &RelPathBuf,
    ) -> io::Result<()> {
        self.ensure_parent(dst_rel.as_path())?;
        copy_recursive(base, src_rel.as_path(), &self.dir, dst_rel.as_path())
    }

    pub(crate) fn snapshot_from_base(&self, base: &Dir, target: &RelPathBuf) -> io::Result<()> {
        let snap_rel = snapshot_rel_path(target);
        if let Some(parent) = snap_rel.parent()
            && !parent.as_os_str().is_empty()
        {
            self.dir.create_dir_all(parent)?;
        }
        copy_recursive(base, target.as_path(), &self.dir, &snap_rel)
    }

    pub(crate) fn snapshot_exists(&self, target: &RelPathBuf) -> bool {
        self.dir.try_exists(snapshot_rel_path(target)).unwrap_or(false)
    }

    pub(crate) fn restore_snapshot_to_base(&self, base: &Dir, target: &RelPathBuf) -> io::Result<()> {
        let snap_rel = snapshot_rel_path(target);
        copy_recursive(&self.dir, &snap_rel, base, target.as_path())
    }

    /// Copies the staged content at `target` to the same relative path under
    /// `base`, leaving the staging copy intact (used by `CP` at
    /// commit-execute, where other staged artifacts may still reference the
    /// same staging subtree).
    pub(crate) fn copy_to_base(&self, base: &Dir, target: &RelPathBuf) -> io::Result<()> {
        copy_recursive(&self.dir, target.as_path(), base, target.as_path())
    }

    pub(crate) fn remove_all(self) -> io::Result<()> {
        drop(self.dir);
        self.staging_root.remove_dir_all(self.id.to_string())
    }
}
