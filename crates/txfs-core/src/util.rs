//! Small filesystem helpers shared by the journal store and the staging
//! area, adapted from the teacher's `atomic-dir::util` (`write_file_atomic_at`,
//! `TempFile`, `safe_path_parent`).

use std::{
    io::{self, Write as _},
    path::Path,
};

use cap_std::fs::Dir;
use rand::distr::SampleString as _;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CreateMode {
    /// Atomically replace the destination if it already exists.
    Overwrite,
    /// Atomically create the destination; fails if it already exists.
    CreateNew,
}

struct TempFile<'a> {
    root: &'a Dir,
    file_name: String,
    file: Option<cap_std::fs::File>,
}

impl<'a> TempFile<'a> {
    fn new_in(root: &'a Dir) -> io::Result<Self> {
        let file_name = format!(
            ".{}.tmp",
            rand::distr::Alphanumeric.sample_string(&mut rand::rng(), 10)
        );
        let file = root.open_with(
            &file_name,
            cap_std::fs::OpenOptions::new().write(true).create_new(true),
        )?;
        Ok(TempFile {
            root,
            file_name,
            file: Some(file),
        })
    }

    fn persist(mut self, path: &Path) -> io::Result<cap_std::fs::File> {
        let file = self.file.take().expect("TempFile is valid");
        match self.root.rename(&self.file_name, self.root, path) {
            Ok(()) => Ok(file),
            Err(err) => {
                self.file = Some(file);
                Err(err)
            }
        }
    }

    fn persist_noclobber(mut self, path: &Path) -> io::Result<cap_std::fs::File> {
        let file = self.file.take().expect("TempFile is valid");
        match self.root.hard_link(&self.file_name, self.root, path) {
            Ok(()) => {
                self.root.remove_file(&self.file_name)?;
                Ok(file)
            }
            Err(err) => {
                self.file = Some(file);
                Err(err)
            }
        }
    }
}

impl std::ops::Deref for TempFile<'_> {
    type Target = cap_std::fs::File;

    fn deref(&self) -> &Self::Target {
        self.file.as_ref().expect("TempFile is valid")
    }
}

impl std::ops::DerefMut for TempFile<'_> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.file.as_mut().expect("TempFile is valid")
    }
}

impl Drop for TempFile<'_> {
    fn drop(&mut self) {
        if self.file.take().is_some() {
            drop(self.root.remove_file(&self.file_name));
        }
    }
}

/// Writes `data` to `path` (relative to `root`) via write-temp-then-rename,
/// optionally forcing the content to stable storage (`fsync`-equivalent)
/// before the rename, per the durable-write contract in the journal spec.
pub(crate) fn write_file_atomic(
    root: &Dir,
    path: &Path,
    data: &[u8],
    durable: bool,
    write_mode: CreateMode,
) -> io::Result<()> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        root.create_dir_all(parent)?;
    }

    let mut temp_file = TempFile::new_in(root)?;
    temp_file.write_all(data)?;
    temp_file.flush()?;
    if durable {
        temp_file.sync_data()?;
    }

    let file = match write_mode {
        CreateMode::Overwrite => temp_file.persist(path)?,
        CreateMode::CreateNew => temp_file.persist_noclobber(path)?,
    };
    drop(file);
    Ok(())
}
