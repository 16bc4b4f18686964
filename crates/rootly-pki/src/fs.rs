//! Crash-safe file writes.
//!
//! Every persisted artifact goes through [`atomic_write`]: the bytes land in a
//! hidden temporary file in the target directory, are flushed to disk, and
//! are then renamed over the destination. Readers only ever see the old file
//! or the complete new one.
//!
//! [`atomic_write_all`] extends this to a set of files that must change
//! together, such as a certificate and its key.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{Error, Result};

/// Permissions applied to a written file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileMode {
    /// World-readable (certificates, serial counters, indexes).
    Public,
    /// Owner-only (private keys).
    Private,
}

/// Writes `contents` to `path` atomically.
///
/// The rename is retried once if it fails; the temporary file is removed
/// when the write does not commit.
///
/// # Errors
///
/// Returns [`Error::Io`] if the temporary file cannot be written or the
/// rename fails twice.
pub fn atomic_write(path: &Path, contents: &[u8], mode: FileMode) -> Result<()> {
    let tmp = temp_path(path)?;
    if let Err(e) = write_synced(&tmp, contents, mode) {
        let _ = fs::remove_file(&tmp);
        return Err(Error::io(format!("writing {}", tmp.display()), e));
    }

    if let Err(e) = rename_retrying(&tmp, path) {
        let _ = fs::remove_file(&tmp);
        return Err(Error::io(format!("renaming into {}", path.display()), e));
    }

    sync_parent(path);
    debug!(path = %path.display(), bytes = contents.len(), "file committed");
    Ok(())
}

/// Replaces several files as one unit, renaming them in slice order.
///
/// Every new file is written and synced before the first rename, and every
/// existing target is hard-linked to a hidden backup. If a rename fails,
/// the targets already replaced are restored from their backups, or removed
/// if they did not exist before, so the set is either fully old or fully new.
///
/// # Errors
///
/// Returns [`Error::Io`] if staging, backing up, or renaming fails. A target
/// that is not a regular file fails the backup step, before anything moves.
pub fn atomic_write_all(files: &[(&Path, &[u8], FileMode)]) -> Result<()> {
    let mut staged: Vec<Staged> = Vec::with_capacity(files.len());
    for &(path, contents, mode) in files {
        let tmp = match temp_path(path) {
            Ok(tmp) => tmp,
            Err(e) => {
                discard(&staged);
                return Err(e);
            }
        };
        if let Err(e) = write_synced(&tmp, contents, mode) {
            let _ = fs::remove_file(&tmp);
            discard(&staged);
            return Err(Error::io(format!("writing {}", tmp.display()), e));
        }
        let backup = match back_up(path) {
            Ok(backup) => backup,
            Err(e) => {
                let _ = fs::remove_file(&tmp);
                discard(&staged);
                return Err(e);
            }
        };
        staged.push(Staged {
            target: path.to_path_buf(),
            tmp,
            backup,
        });
    }

    for (done, file) in staged.iter().enumerate() {
        if let Err(e) = rename_retrying(&file.tmp, &file.target) {
            roll_back(&staged[..done]);
            discard(&staged[done..]);
            return Err(Error::io(format!("renaming into {}", file.target.display()), e));
        }
    }

    for file in &staged {
        if let Some(backup) = &file.backup {
            let _ = fs::remove_file(backup);
        }
        sync_parent(&file.target);
    }
    debug!(files = staged.len(), "file set committed");
    Ok(())
}

/// Reads a file, mapping a missing file to `None`.
///
/// # Errors
///
/// Returns [`Error::Io`] for any other read failure.
pub fn read_optional(path: &Path) -> Result<Option<Vec<u8>>> {
    match fs::read(path) {
        Ok(bytes) => Ok(Some(bytes)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(Error::io(format!("reading {}", path.display()), e)),
    }
}

/// Creates `dir` and its parents if needed.
///
/// # Errors
///
/// Returns [`Error::Io`] if the directory cannot be created.
pub fn ensure_dir(dir: &Path) -> Result<()> {
    fs::create_dir_all(dir).map_err(|e| Error::io(format!("creating {}", dir.display()), e))
}

/// Returns true for the hidden temporary and backup files produced by
/// [`atomic_write`] and [`atomic_write_all`].
#[must_use]
pub fn is_temp_file(name: &str) -> bool {
    name.starts_with('.') && (name.ends_with(".tmp") || name.ends_with(".bak"))
}

struct Staged {
    target: PathBuf,
    tmp: PathBuf,
    backup: Option<PathBuf>,
}

fn temp_path(path: &Path) -> Result<PathBuf> {
    hidden_sibling(path, "tmp")
}

fn hidden_sibling(path: &Path, extension: &str) -> Result<PathBuf> {
    let name = path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| Error::Validation(format!("invalid target path {}", path.display())))?;
    Ok(path.with_file_name(format!(".{name}.{}.{extension}", Uuid::new_v4().simple())))
}

fn rename_retrying(from: &Path, to: &Path) -> std::io::Result<()> {
    fs::rename(from, to).or_else(|first| {
        warn!(path = %to.display(), error = %first, "rename failed, retrying once");
        fs::rename(from, to)
    })
}

fn back_up(target: &Path) -> Result<Option<PathBuf>> {
    match fs::symlink_metadata(target) {
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(Error::io(format!("inspecting {}", target.display()), e)),
        Ok(meta) if !meta.is_file() => {
            return Err(Error::io(
                format!("replacing {}", target.display()),
                std::io::Error::other("not a regular file"),
            ));
        }
        Ok(_) => {}
    }
    let backup = hidden_sibling(target, "bak")?;
    fs::hard_link(target, &backup)
        .or_else(|_| fs::copy(target, &backup).map(|_| ()))
        .map_err(|e| Error::io(format!("backing up {}", target.display()), e))?;
    Ok(Some(backup))
}

fn roll_back(committed: &[Staged]) {
    for file in committed.iter().rev() {
        let restored = match &file.backup {
            Some(backup) => fs::rename(backup, &file.target),
            None => fs::remove_file(&file.target),
        };
        if let Err(e) = restored {
            warn!(path = %file.target.display(), error = %e, "could not restore file after failed commit");
        }
    }
}

fn discard(staged: &[Staged]) {
    for file in staged {
        let _ = fs::remove_file(&file.tmp);
        if let Some(backup) = &file.backup {
            let _ = fs::remove_file(backup);
        }
    }
}

fn write_synced(tmp: &Path, contents: &[u8], mode: FileMode) -> std::io::Result<()> {
    let mut file = open_new(tmp, mode)?;
    file.write_all(contents)?;
    file.sync_all()
}

#[cfg(unix)]
fn open_new(tmp: &Path, mode: FileMode) -> std::io::Result<File> {
    use std::os::unix::fs::OpenOptionsExt;
    let bits = match mode {
        FileMode::Public => 0o644,
        FileMode::Private => 0o600,
    };
    OpenOptions::new()
        .write(true)
        .create_new(true)
        .mode(bits)
        .open(tmp)
}

#[cfg(not(unix))]
fn open_new(tmp: &Path, _mode: FileMode) -> std::io::Result<File> {
    OpenOptions::new().write(true).create_new(true).open(tmp)
}

// Makes the rename durable. Not every platform can open a directory.
fn sync_parent(path: &Path) {
    #[cfg(unix)]
    if let Some(dir) = path.parent().and_then(|p| File::open(p).ok()) {
        let _ = dir.sync_all();
    }
    #[cfg(not(unix))]
    let _ = path;
}
