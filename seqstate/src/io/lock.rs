//! Advisory exclusive lock scoped to one environment.
//!
//! The lock file lives outside the environment directory so that wiping the
//! environment never releases or deletes it. The lock is held for as long as
//! the [`EnvLock`] value lives; the OS drops it when the process exits.

use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::Path;
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, info};

use crate::error::{IoContext, Result, SeqstateError};

const POLL_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Debug)]
pub struct EnvLock {
    _file: File,
}

impl EnvLock {
    /// Acquire the lock at `path`. `timeout = None` waits indefinitely.
    pub fn acquire(environment: &str, path: &Path, timeout: Option<Duration>) -> Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .io_context(|| format!("create lock dir {}", parent.display()))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(path)
            .io_context(|| format!("open lock file {}", path.display()))?;

        let lock_err = |source| SeqstateError::Lock {
            environment: environment.to_string(),
            source,
        };

        match timeout {
            None => {
                if !try_lock(&file).map_err(lock_err)? {
                    info!(environment, "waiting for environment lock");
                    lock_blocking(&file).map_err(lock_err)?;
                }
            }
            Some(limit) => {
                let start = Instant::now();
                let mut announced = false;
                while !try_lock(&file).map_err(lock_err)? {
                    let waited = start.elapsed();
                    if waited >= limit {
                        return Err(SeqstateError::LockTimeout {
                            environment: environment.to_string(),
                            waited_secs: waited.as_secs(),
                        });
                    }
                    if !announced {
                        info!(environment, timeout_secs = limit.as_secs(), "waiting for environment lock");
                        announced = true;
                    }
                    thread::sleep(POLL_INTERVAL.min(limit - waited));
                }
            }
        }

        debug!(environment, path = %path.display(), "environment lock acquired");
        Ok(Self { _file: file })
    }
}

/// Non-blocking `flock(LOCK_EX | LOCK_NB)`; `Ok(false)` when held elsewhere.
#[cfg(unix)]
fn try_lock(file: &File) -> io::Result<bool> {
    use std::os::unix::io::AsRawFd;
    // SAFETY: `file` owns a valid descriptor for the duration of the call.
    #[allow(unsafe_code)]
    let result = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
    if result == 0 {
        return Ok(true);
    }
    let err = io::Error::last_os_error();
    if err.kind() == io::ErrorKind::WouldBlock || err.raw_os_error() == Some(libc::EWOULDBLOCK) {
        return Ok(false);
    }
    Err(err)
}

#[cfg(unix)]
fn lock_blocking(file: &File) -> io::Result<()> {
    use std::os::unix::io::AsRawFd;
    loop {
        // SAFETY: `file` owns a valid descriptor for the duration of the call.
        #[allow(unsafe_code)]
        let result = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX) };
        if result == 0 {
            return Ok(());
        }
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            return Err(err);
        }
    }
}

#[cfg(not(unix))]
fn try_lock(_file: &File) -> io::Result<bool> {
    tracing::warn!("advisory environment locks are not supported on this platform");
    Ok(true)
}

#[cfg(not(unix))]
fn lock_blocking(_file: &File) -> io::Result<()> {
    Ok(())
}
