//! Cross-process master mutex.
//!
//! Backed by an exclusive lock on a well-known lock file (`flock` on Unix,
//! `LockFileEx` on Windows). The lock belongs to the open file, so it is
//! released when the [`MasterGuard`] is dropped or the process dies.

use std::fs::{File, OpenOptions};
use std::path::PathBuf;
use std::time::Duration;

use tokio::time::Instant;
use tracing::debug;

use crate::config::deadline_after;
use crate::error::{EpmapError, Result};

/// Interval between lock attempts while another process holds it.
const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Named mutual exclusion shared by every epmapd process.
#[derive(Debug, Clone)]
pub struct MasterMutex {
    path: PathBuf,
    timeout: Duration,
}

/// Proof of holding the master mutex. Dropping it releases the lock.
#[derive(Debug)]
pub struct MasterGuard {
    _file: File,
}

impl MasterMutex {
    /// Create a mutex bound to `path` with a bounded acquire wait.
    pub fn new(path: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            path: path.into(),
            timeout,
        }
    }

    /// Acquire the mutex, waiting at most the configured timeout.
    pub async fn acquire(&self) -> Result<MasterGuard> {
        let deadline = deadline_after(self.timeout);
        loop {
            if let Some(guard) = self.try_acquire()? {
                debug!(path = %self.path.display(), "Master mutex acquired");
                return Ok(guard);
            }
            if Instant::now() >= deadline {
                return Err(EpmapError::MasterMutexTimeout);
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    /// Try to acquire the mutex without waiting.
    pub fn try_acquire(&self) -> Result<Option<MasterGuard>> {
        if let Some(dir) = self.path.parent() {
            std::fs::create_dir_all(dir)?;
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&self.path)?;

        if lock_exclusive_nonblocking(&file)? {
            Ok(Some(MasterGuard { _file: file }))
        } else {
            Ok(None)
        }
    }
}

#[cfg(unix)]
fn lock_exclusive_nonblocking(file: &File) -> Result<bool> {
    use std::os::unix::io::AsRawFd;

    let fd = file.as_raw_fd();
    // SAFETY: fd is a valid descriptor owned by `file` for the duration of the call
    let rc = unsafe { libc::flock(fd, libc::LOCK_EX | libc::LOCK_NB) };
    if rc == 0 {
        return Ok(true);
    }

    let err = std::io::Error::last_os_error();
    if err.raw_os_error() == Some(libc::EWOULDBLOCK) {
        Ok(false)
    } else {
        Err(EpmapError::Io(err))
    }
}

#[cfg(windows)]
fn lock_exclusive_nonblocking(file: &File) -> Result<bool> {
    use std::os::windows::io::AsRawHandle;
    use windows_sys::Win32::Foundation::{ERROR_LOCK_VIOLATION, HANDLE};
    use windows_sys::Win32::Storage::FileSystem::{
        LockFileEx, LOCKFILE_EXCLUSIVE_LOCK, LOCKFILE_FAIL_IMMEDIATELY,
    };

    let handle = file.as_raw_handle() as HANDLE;
    // SAFETY: handle is valid from as_raw_handle, OVERLAPPED is zeroed correctly
    let ok = unsafe {
        let mut overlapped = std::mem::zeroed::<windows_sys::Win32::System::IO::OVERLAPPED>();
        LockFileEx(
            handle,
            LOCKFILE_EXCLUSIVE_LOCK | LOCKFILE_FAIL_IMMEDIATELY,
            0,
            u32::MAX,
            u32::MAX,
            &mut overlapped,
        )
    };
    if ok != 0 {
        return Ok(true);
    }

    let err = std::io::Error::last_os_error();
    if err.raw_os_error() == Some(ERROR_LOCK_VIOLATION as i32) {
        Ok(false)
    } else {
        Err(EpmapError::Io(err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_acquire_and_release() {
        let dir = tempfile::tempdir().unwrap();
        let mutex = MasterMutex::new(dir.path().join("epmap.lock"), Duration::from_millis(100));

        let guard = mutex.acquire().await.unwrap();
        assert!(mutex.try_acquire().unwrap().is_none());

        drop(guard);
        assert!(mutex.try_acquire().unwrap().is_some());
    }

    #[tokio::test]
    async fn test_unbounded_timeout_acquires_free_lock() {
        let dir = tempfile::tempdir().unwrap();
        let mutex = MasterMutex::new(dir.path().join("epmap.lock"), Duration::MAX);

        assert!(mutex.acquire().await.is_ok());
    }

    #[tokio::test]
    async fn test_acquire_times_out_while_held() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sub").join("epmap.lock");
        let holder = MasterMutex::new(&path, Duration::from_millis(100));
        let contender = MasterMutex::new(&path, Duration::from_millis(50));

        let _guard = holder.acquire().await.unwrap();
        let result = contender.acquire().await;
        assert!(matches!(result, Err(EpmapError::MasterMutexTimeout)));
    }

    #[tokio::test]
    async fn test_waiter_gets_lock_after_release() {
        let dir = tempfile::tempdir().unwrap();
        let mutex = MasterMutex::new(dir.path().join("epmap.lock"), Duration::from_secs(2));

        let guard = mutex.acquire().await.unwrap();
        let waiter = tokio::spawn({
            let mutex = mutex.clone();
            async move { mutex.acquire().await.map(|_| ()) }
        });

        tokio::time::sleep(Duration::from_millis(30)).await;
        drop(guard);

        assert!(waiter.await.unwrap().is_ok());
    }
}
