//! # Path Allocation
//!
//! Filenames carry the metadata the aggregator needs (`<prefix>_<pid>-<n>.db`
//! where the prefix encodes metric type and gauge mode), so allocating a
//! filename is also claiming exclusive write ownership of it. Ownership is an
//! advisory exclusive `flock(2)` held for the life of the process; the probe
//! walks `n = 0, 1, 2, ...` until a lock is obtained.
//!
//! `flock` locks belong to the open file description, so a second open of
//! the same path *within one process* would succeed and silently alias the
//! writer. A process-wide table of claimed paths closes that hole.

use std::fs::{self, File, OpenOptions};
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use eyre::{bail, Result, WrapErr};
use hashbrown::HashSet;
use parking_lot::Mutex;

/// A filename claimed by this process. Holds the locked file handle; the
/// advisory lock is released when the handle is dropped.
#[derive(Debug)]
pub struct AllocatedPath {
    pub path: PathBuf,
    pub file: File,
}

impl AllocatedPath {
    /// Release the claim and unlock explicitly, for callers that want the
    /// error rather than a silent drop.
    pub fn unlock(self) -> Result<()> {
        PathAllocator::release(&self.path);

        // SAFETY: see try_lock_exclusive.
        let ret = unsafe { libc::flock(self.file.as_raw_fd(), libc::LOCK_UN) };
        if ret != 0 {
            bail!(
                "failed to unlock '{}': {}",
                self.path.display(),
                std::io::Error::last_os_error()
            );
        }
        Ok(())
    }
}

/// Allocates lock-guarded `*.db` paths inside a directory.
#[derive(Debug)]
pub struct PathAllocator;

static CLAIMED: OnceLock<Mutex<HashSet<PathBuf>>> = OnceLock::new();

fn claimed() -> &'static Mutex<HashSet<PathBuf>> {
    CLAIMED.get_or_init(|| Mutex::new(HashSet::new()))
}

impl PathAllocator {
    /// Claim `<dir>/<prefix>_<pid>-<n>.db` for the smallest `n` this process
    /// can lock. Creates the directory and the file as needed.
    pub fn acquire(dir: &Path, prefix: &str, pid: &str) -> Result<AllocatedPath> {
        fs::create_dir_all(dir)
            .wrap_err_with(|| format!("failed to create metrics directory '{}'", dir.display()))?;

        // Serialize probing so two threads cannot race past the claimed-path
        // check and lock the same candidate twice through separate fds.
        let mut table = claimed().lock();

        for n in 0.. {
            let path = dir.join(format!("{prefix}_{pid}-{n}.db"));

            if table.contains(&path) {
                continue;
            }

            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(false)
                .open(&path)
                .wrap_err_with(|| format!("failed to open '{}'", path.display()))?;

            if try_lock_exclusive(&file) {
                table.insert(path.clone());
                return Ok(AllocatedPath { path, file });
            }
            // Locked by a live sibling process; probe the next candidate.
        }

        unreachable!("path probe loop is unbounded");
    }

    /// Drop a path from the process-wide claim table. The advisory lock
    /// itself is released when the corresponding file handle closes.
    pub fn release(path: &Path) {
        claimed().lock().remove(path);
    }

    /// True if this process currently holds a claim on `path`.
    pub fn is_claimed(path: &Path) -> bool {
        claimed().lock().contains(path)
    }
}

fn try_lock_exclusive(file: &File) -> bool {
    // SAFETY: flock(2) on an owned, open descriptor; no memory is touched.
    let ret = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
    ret == 0
}
