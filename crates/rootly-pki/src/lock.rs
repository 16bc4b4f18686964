//! Per-id exclusive locks.
//!
//! A [`LockTable`] hands out at most one [`LockGuard`] per key at a time.
//! Different keys never contend. The guard releases its key on drop, so a
//! lock is freed on every exit path, including early returns and errors.
//!
//! A table built with [`LockTable::file_backed`] also holds an advisory
//! lock on one file per key for as long as the guard lives. That extends
//! the exclusion to every process working on the same directories, such
//! as two `rootly` invocations running side by side.

use std::collections::HashSet;
use std::fmt;
use std::fs::{File, OpenOptions};
use std::hash::Hash;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use fs2::FileExt;
use parking_lot::{Condvar, Mutex};
use tracing::trace;

use crate::error::{Error, Result};
use crate::fs::ensure_dir;

/// How often a contended lock file is retried.
const LOCK_FILE_POLL: Duration = Duration::from_millis(10);

type LockPath<K> = dyn Fn(&K) -> PathBuf + Send + Sync;

struct Inner<K> {
    held: Mutex<HashSet<K>>,
    released: Condvar,
    lock_path: Option<Box<LockPath<K>>>,
}

/// A set of named exclusive locks.
pub struct LockTable<K> {
    inner: Arc<Inner<K>>,
}

impl<K> Clone for LockTable<K> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<K> Default for LockTable<K> {
    fn default() -> Self {
        Self::with_lock_path(None)
    }
}

impl<K> LockTable<K> {
    fn with_lock_path(lock_path: Option<Box<LockPath<K>>>) -> Self {
        Self {
            inner: Arc::new(Inner {
                held: Mutex::new(HashSet::new()),
                released: Condvar::new(),
                lock_path,
            }),
        }
    }

    /// Creates a table whose guards also lock the file `lock_path(key)`.
    ///
    /// The file is created on first use and never removed.
    #[must_use]
    pub fn file_backed(lock_path: impl Fn(&K) -> PathBuf + Send + Sync + 'static) -> Self {
        Self::with_lock_path(Some(Box::new(lock_path)))
    }
}

impl<K> fmt::Debug for LockTable<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockTable")
            .field("held", &self.inner.held.lock().len())
            .field("file_backed", &self.inner.lock_path.is_some())
            .finish()
    }
}

impl<K> LockTable<K>
where
    K: Eq + Hash + Clone + fmt::Display,
{
    /// Creates an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Blocks until `key` is free or `deadline` passes.
    ///
    /// For a file-backed table the in-process wait comes first, then the
    /// lock file is polled until the same deadline.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Timeout`] if the deadline passes first and
    /// [`Error::Io`] if the lock file cannot be opened.
    pub fn acquire(&self, key: &K, deadline: Instant) -> Result<LockGuard<K>> {
        let mut held = self.inner.held.lock();
        while held.contains(key) {
            if self.inner.released.wait_until(&mut held, deadline).timed_out()
                && held.contains(key)
            {
                return Err(Error::Timeout(format!("waiting for lock on '{key}'")));
            }
        }
        held.insert(key.clone());
        drop(held);

        let mut guard = LockGuard {
            table: Arc::clone(&self.inner),
            key: key.clone(),
            file: None,
        };
        if let Some(lock_path) = &self.inner.lock_path {
            // dropping `guard` on error frees the in-process slot
            guard.file = Some(lock_file(&lock_path(key), key, deadline)?);
        }
        trace!(key = %key, "lock acquired");
        Ok(guard)
    }

    /// Takes `key` only if it is free right now, in this process and, for a
    /// file-backed table, in every other.
    pub fn try_acquire(&self, key: &K) -> Option<LockGuard<K>> {
        let mut held = self.inner.held.lock();
        if !held.insert(key.clone()) {
            return None;
        }
        drop(held);

        let mut guard = LockGuard {
            table: Arc::clone(&self.inner),
            key: key.clone(),
            file: None,
        };
        if let Some(lock_path) = &self.inner.lock_path {
            let file = open_lock_file(&lock_path(key)).ok()?;
            file.try_lock_exclusive().ok()?;
            guard.file = Some(file);
        }
        Some(guard)
    }

    /// Returns true while some guard holds `key`.
    pub fn is_held(&self, key: &K) -> bool {
        self.inner.held.lock().contains(key)
    }
}

fn open_lock_file(path: &Path) -> Result<File> {
    if let Some(parent) = path.parent() {
        ensure_dir(parent)?;
    }
    OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(path)
        .map_err(|e| Error::io(format!("opening lock file {}", path.display()), e))
}

fn lock_file<K: fmt::Display>(path: &Path, key: &K, deadline: Instant) -> Result<File> {
    let file = open_lock_file(path)?;
    let contended = fs2::lock_contended_error().raw_os_error();
    loop {
        match file.try_lock_exclusive() {
            Ok(()) => return Ok(file),
            Err(e) if e.raw_os_error() == contended => {
                let now = Instant::now();
                if now >= deadline {
                    return Err(Error::Timeout(format!("waiting for lock on '{key}'")));
                }
                std::thread::sleep(LOCK_FILE_POLL.min(deadline - now));
            }
            Err(e) => return Err(Error::io(format!("locking {}", path.display()), e)),
        }
    }
}

/// Scoped ownership of one key in a [`LockTable`].
pub struct LockGuard<K: Eq + Hash> {
    table: Arc<Inner<K>>,
    key: K,
    file: Option<File>,
}

impl<K: Eq + Hash> LockGuard<K> {
    /// The key this guard holds.
    pub const fn key(&self) -> &K {
        &self.key
    }
}

impl<K: Eq + Hash + fmt::Display> fmt::Debug for LockGuard<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockGuard")
            .field("key", &self.key.to_string())
            .finish()
    }
}

impl<K: Eq + Hash> Drop for LockGuard<K> {
    fn drop(&mut self) {
        if let Some(file) = self.file.take() {
            // closing the file releases the lock as well
            let _ = FileExt::unlock(&file);
        }
        self.table.held.lock().remove(&self.key);
        self.table.released.notify_all();
    }
}

/// Fails with [`Error::Timeout`] once `deadline` has passed.
///
/// Called right before the first write of an operation; nothing is ever
/// aborted after it starts mutating state.
pub fn ensure_before(deadline: Instant, operation: &str) -> Result<()> {
    if Instant::now() >= deadline {
        return Err(Error::Timeout(format!("{operation} did not start before its deadline")));
    }
    Ok(())
}
