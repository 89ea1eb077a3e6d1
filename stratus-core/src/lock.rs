//! Advisory file lock shared by every stratus process using the same storage.
//!
//! The scheduler daemon and operator commands run as separate processes, so the
//! in-process run lock alone cannot keep them apart. Holding a [`RunLock`] means no
//! other holder of the same lock file is running the pipeline or writing schedule state.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info};

/// How often a blocked acquirer re-checks the lock.
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Exclusive `flock` on a lock file, released on drop.
#[derive(Debug)]
pub struct RunLock {
    file: File,
}

impl RunLock {
    /// Try once. `Ok(None)` means another holder has it.
    pub fn try_acquire(path: &Path) -> std::io::Result<Option<Self>> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;

        if !lock_exclusive_nonblocking(&file)? {
            return Ok(None);
        }

        // Holder's pid, for operators inspecting a stuck lock.
        file.set_len(0)?;
        let mut writer = &file;
        let _ = writer.write_all(std::process::id().to_string().as_bytes());
        let _ = writer.flush();

        Ok(Some(Self { file }))
    }

    /// Wait until the lock is free. Cancel-safe: dropping the future gives up the wait.
    pub async fn acquire(path: &Path) -> std::io::Result<Self> {
        let mut announced = false;
        loop {
            if let Some(lock) = Self::try_acquire(path)? {
                debug!(path = %path.display(), "Run lock acquired");
                return Ok(lock);
            }
            if !announced {
                info!(path = %path.display(), "Another stratus process holds the run lock, waiting");
                announced = true;
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }
}

impl Drop for RunLock {
    fn drop(&mut self) {
        unlock(&self.file);
        // The file stays: removing it lets a waiter lock a deleted inode.
    }
}

#[cfg(unix)]
fn lock_exclusive_nonblocking(file: &File) -> std::io::Result<bool> {
    use std::os::unix::io::AsRawFd;
    let result = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
    if result == 0 {
        return Ok(true);
    }
    let err = std::io::Error::last_os_error();
    if err.kind() == std::io::ErrorKind::WouldBlock {
        Ok(false)
    } else {
        Err(err)
    }
}

#[cfg(unix)]
fn unlock(file: &File) {
    use std::os::unix::io::AsRawFd;
    unsafe {
        libc::flock(file.as_raw_fd(), libc::LOCK_UN);
    }
}

// Without flock the open handle is the only guard.
#[cfg(not(unix))]
fn lock_exclusive_nonblocking(_file: &File) -> std::io::Result<bool> {
    Ok(true)
}

#[cfg(not(unix))]
fn unlock(_file: &File) {}
