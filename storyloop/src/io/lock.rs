//! Advisory file locks guarding the task store.
//!
//! The lock lives in a sibling file (`<store>.lock`) so its lifetime does not
//! depend on whether the data file exists. Acquisition polls `try_lock_*`
//! until a timeout or cancellation; the lock is released when the guard drops.

use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use fs2::FileExt;
use tracing::{debug, trace, warn};

use crate::cancel::CancelToken;
use crate::error::{LockMode, StoreError};

pub const LOCK_SUFFIX: &str = ".lock";

/// Path of the lock file guarding `data_path`.
pub fn lock_path_for(data_path: &Path) -> PathBuf {
    let mut name = data_path
        .file_name()
        .map(|name| name.to_os_string())
        .unwrap_or_default();
    name.push(LOCK_SUFFIX);
    data_path.with_file_name(name)
}

/// Bounded-wait acquisition settings.
#[derive(Debug, Clone, Copy)]
pub struct LockOptions {
    pub timeout: Duration,
    pub poll_interval: Duration,
}

impl Default for LockOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(5),
            poll_interval: Duration::from_millis(50),
        }
    }
}

/// A held lock. Dropping the guard releases it.
#[derive(Debug)]
pub struct LockGuard {
    file: File,
    path: PathBuf,
    mode: LockMode,
}

impl LockGuard {
    pub fn mode(&self) -> LockMode {
        self.mode
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if let Err(err) = FileExt::unlock(&self.file) {
            warn!(path = %self.path.display(), err = %err, "failed to release lock");
        } else {
            trace!(path = %self.path.display(), mode = %self.mode, "lock released");
        }
    }
}

/// Acquire `mode` on the lock file at `path`, polling until `options.timeout`.
pub fn acquire(
    path: &Path,
    mode: LockMode,
    options: LockOptions,
    cancel: &CancelToken,
) -> Result<LockGuard, StoreError> {
    let file = open_lock_file(path)?;
    let start = Instant::now();
    loop {
        if cancel.is_cancelled() {
            return Err(StoreError::Cancelled {
                path: path.to_path_buf(),
                mode,
            });
        }
        let attempt = match mode {
            LockMode::Shared => FileExt::try_lock_shared(&file),
            LockMode::Exclusive => FileExt::try_lock_exclusive(&file),
        };
        match attempt {
            Ok(()) => {
                debug!(
                    path = %path.display(),
                    %mode,
                    waited_ms = start.elapsed().as_millis() as u64,
                    "lock acquired"
                );
                return Ok(LockGuard {
                    file,
                    path: path.to_path_buf(),
                    mode,
                });
            }
            Err(err) if is_contended(&err) => {}
            Err(err) => return Err(StoreError::io("lock", path, err)),
        }

        let waited = start.elapsed();
        if waited >= options.timeout {
            warn!(path = %path.display(), %mode, waited_ms = waited.as_millis() as u64, "lock wait timed out");
            return Err(StoreError::LockTimeout {
                path: path.to_path_buf(),
                mode,
                waited,
            });
        }
        let nap = options.poll_interval.min(options.timeout - waited);
        cancel.sleep(nap);
    }
}

fn open_lock_file(path: &Path) -> Result<File, StoreError> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent)
            .map_err(|err| StoreError::io("create lock dir", parent, err))?;
    }
    OpenOptions::new()
        .create(true)
        .read(true)
        .write(true)
        .truncate(false)
        .open(path)
        .map_err(|err| StoreError::io("open lock file", path, err))
}

fn is_contended(err: &io::Error) -> bool {
    err.kind() == io::ErrorKind::WouldBlock
        || err.raw_os_error() == fs2::lock_contended_error().raw_os_error()
}
