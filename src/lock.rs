//! Advisory file locks.
//!
//! Everything that coordinates across processes in slink (the service
//! registry, port reservations, the authorized_keys append) goes through
//! these `flock`-based locks. They work across hosts that share the
//! filesystem as long as the filesystem implements flock coherently (local
//! disks and modern NFS do); the registry additionally keys per host so a
//! non-coherent mount degrades to per-host safety, not corruption.

use crate::error::{Error, Result};
use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

/// How long to sleep between attempts while waiting on a contended lock.
const RETRY_INTERVAL: Duration = Duration::from_millis(25);

/// An exclusive advisory lock on a file path, released on drop.
///
/// The lock file itself is left behind on release. The lock, not the file,
/// is the reservation; deleting it would race against a concurrent locker
/// holding the old inode.
#[derive(Debug)]
pub struct FileLock {
    file: File,
    path: PathBuf,
}

impl FileLock {
    /// Try to take the lock without blocking. `Ok(None)` means another
    /// process (or another handle in this process) holds it.
    pub fn try_acquire(path: &Path) -> Result<Option<FileLock>> {
        let file = open_lock_file(path)?;
        if try_flock_exclusive(&file)? {
            Ok(Some(FileLock {
                file,
                path: path.to_path_buf(),
            }))
        } else {
            Ok(None)
        }
    }

    /// Take the lock, waiting up to `timeout`. A single deadline bounds the
    /// whole wait; expiry surfaces as the retryable [`Error::LockTimeout`].
    pub fn acquire(path: &Path, timeout: Duration) -> Result<FileLock> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(lock) = Self::try_acquire(path)? {
                return Ok(lock);
            }
            if Instant::now() >= deadline {
                return Err(Error::LockTimeout {
                    path: path.display().to_string(),
                    timeout_secs: timeout.as_secs(),
                });
            }
            std::thread::sleep(RETRY_INTERVAL);
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        // Closing the fd releases the flock; unlock explicitly so the drop
        // order of clones of this File (there are none today) can't matter.
        unsafe {
            libc::flock(self.file.as_raw_fd(), libc::LOCK_UN);
        }
    }
}

fn open_lock_file(path: &Path) -> Result<File> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| {
            Error::Filesystem(format!(
                "Failed to create lock directory {}: {}",
                parent.display(),
                e
            ))
        })?;
    }

    let mut options = OpenOptions::new();
    options
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .custom_flags(libc::O_NOFOLLOW)
        .mode(0o600);

    options.open(path).map_err(|e| {
        Error::Filesystem(format!("Failed to open lock file {}: {}", path.display(), e))
    })
}

fn try_flock_exclusive(file: &File) -> Result<bool> {
    let fd = file.as_raw_fd();
    // SAFETY: `fd` comes from an open `File` that outlives this call;
    // LOCK_EX | LOCK_NB is a valid flock operation.
    let rc = unsafe { libc::flock(fd, libc::LOCK_EX | libc::LOCK_NB) };
    if rc == 0 {
        return Ok(true);
    }
    let err = io::Error::last_os_error();
    if err.kind() == io::ErrorKind::WouldBlock || err.raw_os_error() == Some(libc::EWOULDBLOCK) {
        return Ok(false);
    }
    Err(Error::Io(err))
}
