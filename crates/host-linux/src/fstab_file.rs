//! Lock-protected access to the persistent mount table file.

use anyhow::{Context, Result};
use fs2::FileExt;
use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use tracing::debug;

pub(crate) fn read_table(path: &Path) -> Result<String> {
    match fs::read_to_string(path) {
        Ok(contents) => Ok(contents),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(String::new()),
        Err(err) => Err(err).with_context(|| format!("read {}", path.display())),
    }
}

/// Runs one read-modify-write cycle while holding an exclusive lock on
/// `lock_path`, so other mountwright processes cannot interleave edits.
///
/// The previous contents are kept in `<table>.mountwright.bak` and the new
/// contents land through a rename, so readers never observe a torn file.
pub(crate) fn update_table(
    path: &Path,
    lock_path: &Path,
    edit: &mut dyn FnMut(String) -> Result<String>,
) -> Result<()> {
    let lock = open_lock(lock_path)?;
    lock.lock_exclusive()
        .with_context(|| format!("lock {}", lock_path.display()))?;

    let result = rewrite(path, edit);
    if let Err(err) = FileExt::unlock(&lock) {
        debug!(lock = %lock_path.display(), error = %err, "unlock failed; released on close");
    }
    result
}

fn rewrite(path: &Path, edit: &mut dyn FnMut(String) -> Result<String>) -> Result<()> {
    let current = read_table(path)?;
    let updated = edit(current.clone())?;
    if updated == current {
        debug!(table = %path.display(), "mount table unchanged");
        return Ok(());
    }

    if path.exists() {
        let backup = sibling(path, "mountwright.bak");
        fs::copy(path, &backup)
            .with_context(|| format!("back up {} to {}", path.display(), backup.display()))?;
    }

    let staging = sibling(path, "mountwright.tmp");
    let mut file = File::create(&staging)
        .with_context(|| format!("create {}", staging.display()))?;
    file.write_all(updated.as_bytes())
        .with_context(|| format!("write {}", staging.display()))?;
    file.sync_all()
        .with_context(|| format!("sync {}", staging.display()))?;
    if let Ok(metadata) = fs::metadata(path) {
        fs::set_permissions(&staging, metadata.permissions())
            .with_context(|| format!("set permissions on {}", staging.display()))?;
    }
    fs::rename(&staging, path)
        .with_context(|| format!("replace {} with {}", path.display(), staging.display()))?;
    debug!(table = %path.display(), "mount table rewritten");
    Ok(())
}

fn open_lock(lock_path: &Path) -> Result<File> {
    if let Some(parent) = lock_path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("create lock directory {}", parent.display()))?;
    }
    OpenOptions::new()
        .create(true)
        .write(true)
        .open(lock_path)
        .with_context(|| format!("open lock file {}", lock_path.display()))
}

fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let name = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| "fstab".to_string());
    path.with_file_name(format!("{}.{}", name, suffix))
}
