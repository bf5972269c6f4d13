//! Atomic file replacement and advisory lock files.

use std::{
    fs::{self, File, OpenOptions},
    io::{self, Write as _},
    path::{Path, PathBuf},
    time::Duration,
};

use fs2::FileExt;
use tempfile::NamedTempFile;
use thiserror::Error;
use tokio::time;
use tracing::{debug, warn};

use crate::retry::{RetryError, RetryPolicy, Transient};

/// Replace `path` with `bytes` without readers ever seeing a partial file.
///
/// The content goes to a temporary file in the same directory, gets `mode` applied and is
/// fsynced before being renamed over `path`. Any failure leaves `path` untouched.
pub(crate) fn write_atomic(path: &Path, bytes: &[u8], mode: u32) -> io::Result<()> {
    let dir = parent_dir(path);

    fs::create_dir_all(&dir)?;

    let mut temp = NamedTempFile::new_in(&dir)?;

    temp.as_file_mut().write_all(bytes)?;
    temp.as_file_mut().flush()?;

    set_mode(temp.as_file(), mode)?;

    temp.as_file().sync_all()?;
    temp.persist(path).map_err(|error| error.error)?;

    Ok(())
}

/// Read a file, treating a missing file as `None`.
pub(crate) fn read_optional(path: &Path) -> io::Result<Option<String>> {
    match fs::read_to_string(path) {
        Ok(contents) => Ok(Some(contents)),
        Err(error) if error.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(error) => Err(error),
    }
}

/// Create `path` with `bytes`, failing if it already exists.
pub(crate) fn write_new(path: &Path, bytes: &[u8], mode: u32) -> io::Result<()> {
    if let Some(dir) = path.parent().filter(|dir| !dir.as_os_str().is_empty()) {
        fs::create_dir_all(dir)?;
    }

    let mut file = OpenOptions::new().write(true).create_new(true).open(path)?;

    set_mode(&file, mode)?;

    file.write_all(bytes)?;
    file.sync_all()
}

pub(crate) fn parent_dir(path: &Path) -> PathBuf {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    }
}

#[cfg(unix)]
fn set_mode(file: &File, mode: u32) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;

    file.set_permissions(fs::Permissions::from_mode(mode))
}

#[cfg(not(unix))]
fn set_mode(_file: &File, _mode: u32) -> io::Result<()> {
    Ok(())
}

/// Lock file errors.
#[derive(Debug, Error)]
pub(crate) enum LockError {
    /// Another process or task holds the lock.
    #[error("lock {path} is held by another writer")]
    Contended {
        /// Lock file.
        path: PathBuf,
    },

    /// Lock file could not be opened or locked.
    #[error("failed to lock {path}")]
    Io {
        /// Lock file.
        path: PathBuf,

        /// Underlying IO error.
        #[source]
        source: io::Error,
    },
}

impl Transient for LockError {
    fn is_transient(&self) -> bool {
        matches!(self, Self::Contended { .. })
    }
}

/// Exclusive advisory lock, released on drop.
#[derive(Debug)]
pub(crate) struct FileLock {
    file: File,
    path: PathBuf,
}

impl FileLock {
    /// Try to take the lock without blocking.
    pub(crate) fn try_acquire(path: &Path) -> Result<Self, LockError> {
        let io_error = |source| LockError::Io {
            path: path.to_path_buf(),
            source,
        };

        if let Some(dir) = path.parent().filter(|dir| !dir.as_os_str().is_empty()) {
            fs::create_dir_all(dir).map_err(io_error)?;
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .map_err(io_error)?;

        match FileExt::try_lock_exclusive(&file) {
            // Removed by the previous holder; the next attempt creates a fresh file.
            Ok(()) if is_unlinked(&file) => Err(LockError::Contended {
                path: path.to_path_buf(),
            }),
            Ok(()) => Ok(Self {
                file,
                path: path.to_path_buf(),
            }),
            Err(error) if is_contended(&error) => Err(LockError::Contended {
                path: path.to_path_buf(),
            }),
            Err(source) => Err(io_error(source)),
        }
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        if let Err(error) = FileExt::unlock(&self.file) {
            warn!(path = %self.path.display(), %error, "failed to release lock");
        }
    }
}

#[cfg(unix)]
fn is_unlinked(file: &File) -> bool {
    use std::os::unix::fs::MetadataExt;

    file.metadata().is_ok_and(|metadata| metadata.nlink() == 0)
}

#[cfg(not(unix))]
fn is_unlinked(_file: &File) -> bool {
    false
}

fn is_contended(error: &io::Error) -> bool {
    error.kind() == io::ErrorKind::WouldBlock
        || error.raw_os_error() == fs2::lock_contended_error().raw_os_error()
}

/// Take the lock, retrying with backoff while it is contended.
pub(crate) async fn acquire_lock(
    path: &Path,
    retry: &RetryPolicy,
) -> Result<FileLock, RetryError<LockError>> {
    retry
        .run("acquire lock", || async { FileLock::try_acquire(path) })
        .await
}

const LOCK_POLL_MIN: Duration = Duration::from_millis(10);
const LOCK_POLL_MAX: Duration = Duration::from_millis(500);

/// Wait up to `timeout` for a lock held for the length of a whole operation.
///
/// Returns [`LockError::Contended`] once `timeout` has passed.
pub(crate) async fn wait_for_lock(path: &Path, timeout: Duration) -> Result<FileLock, LockError> {
    let waiting = async {
        let mut delay = LOCK_POLL_MIN;

        loop {
            match FileLock::try_acquire(path) {
                Err(LockError::Contended { .. }) => {
                    debug!(path = %path.display(), ?delay, "lock is held, waiting");

                    time::sleep(delay).await;
                    delay = (delay * 2).min(LOCK_POLL_MAX);
                }
                result => return result,
            }
        }
    };

    match time::timeout(timeout, waiting).await {
        Ok(result) => result,
        Err(_elapsed) => Err(LockError::Contended {
            path: path.to_path_buf(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use testresult::TestResult;

    use super::*;

    #[test]
    fn atomic_write_replaces_content_and_applies_mode() -> TestResult {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("nested").join("userlist.txt");

        write_atomic(&path, b"first\n", 0o600)?;
        write_atomic(&path, b"second\n", 0o600)?;

        assert_eq!(fs::read_to_string(&path)?, "second\n");
        assert_eq!(fs::read_dir(parent_dir(&path))?.count(), 1);

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;

            assert_eq!(fs::metadata(&path)?.permissions().mode() & 0o777, 0o600);
        }

        Ok(())
    }

    #[test]
    fn missing_files_read_as_none() -> TestResult {
        let dir = tempfile::tempdir()?;

        assert_eq!(read_optional(&dir.path().join("absent"))?, None);

        Ok(())
    }

    #[test]
    fn write_new_refuses_to_overwrite() -> TestResult {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("backup");

        write_new(&path, b"one", 0o600)?;

        let second = write_new(&path, b"two", 0o600);

        assert_eq!(
            second.map_err(|error| error.kind()),
            Err(io::ErrorKind::AlreadyExists)
        );
        assert_eq!(fs::read_to_string(&path)?, "one");

        Ok(())
    }

    #[test]
    fn second_lock_is_contended_until_first_is_dropped() -> TestResult {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("registry.lock");

        let first = FileLock::try_acquire(&path)?;

        assert!(matches!(
            FileLock::try_acquire(&path),
            Err(LockError::Contended { .. })
        ));

        drop(first);

        FileLock::try_acquire(&path)?;

        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn waiting_outlasts_a_long_holder() -> TestResult {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("tenant-beta.lock");

        let holder = FileLock::try_acquire(&path)?;
        let release = tokio::spawn(async move {
            time::sleep(Duration::from_secs(30)).await;
            drop(holder);
        });

        wait_for_lock(&path, Duration::from_secs(60)).await?;
        release.await?;

        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn waiting_gives_up_after_the_timeout() -> TestResult {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("tenant-beta.lock");

        let _holder = FileLock::try_acquire(&path)?;

        let result = wait_for_lock(&path, Duration::from_secs(5)).await;

        assert!(matches!(result, Err(LockError::Contended { .. })));

        Ok(())
    }
}
