//! Credential cache file on disk, with its lock and backups.

use std::{
    io,
    path::{Path, PathBuf},
};

use jiff::Timestamp;
use tracing::debug;

use crate::{
    config::EngineConfig,
    credentials::errors::CacheError,
    files::{self, FileLock, LockError},
    retry::{RetryError, RetryPolicy},
};

const LOCK_FILE: &str = "credential-cache.lock";

const BACKUP_FILE_MODE: u32 = 0o600;

/// Location of the live cache and everything written next to it.
#[derive(Debug, Clone)]
pub struct CacheFile {
    path: PathBuf,
    backup_dir: PathBuf,
    lock_path: PathBuf,
    mode: u32,
}

impl CacheFile {
    /// Cache file described by `config`.
    #[must_use]
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            path: config.cache_path.clone(),
            backup_dir: config.backup_dir(),
            lock_path: config.lock_dir().join(LOCK_FILE),
            mode: config.cache_file_mode,
        }
    }

    /// Live cache path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Current content; `None` if the cache does not exist yet.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::Read`] when the file exists but cannot be read.
    pub fn read(&self) -> Result<Option<String>, CacheError> {
        files::read_optional(&self.path).map_err(|source| CacheError::Read {
            path: self.path.clone(),
            source,
        })
    }

    /// Take the writer lock, waiting with backoff while another writer holds it.
    pub(crate) async fn lock(&self, retry: &RetryPolicy) -> Result<FileLock, CacheError> {
        files::acquire_lock(&self.lock_path, retry)
            .await
            .map_err(|error| match error.into_inner() {
                LockError::Contended { path } => CacheError::Locked { path },
                LockError::Io { path, source } => CacheError::Write { path, source },
            })
    }

    /// Snapshot `contents` into a new timestamped backup and return its path.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::Backup`] when the backup cannot be written.
    pub fn backup(&self, contents: &str) -> Result<PathBuf, CacheError> {
        let file_name = self
            .path
            .file_name()
            .map_or_else(|| "cache".into(), |name| name.to_string_lossy());
        let stamp = Timestamp::now().strftime("%Y%m%dT%H%M%SZ").to_string();

        let mut suffix = 0_u32;

        loop {
            let name = if suffix == 0 {
                format!("{file_name}.{stamp}.bak")
            } else {
                format!("{file_name}.{stamp}-{suffix}.bak")
            };
            let path = self.backup_dir.join(name);

            match files::write_new(&path, contents.as_bytes(), BACKUP_FILE_MODE) {
                Ok(()) => {
                    debug!(path = %path.display(), "wrote sync backup");

                    return Ok(path);
                }
                Err(error) if error.kind() == io::ErrorKind::AlreadyExists => {
                    suffix += 1;
                }
                Err(source) => return Err(CacheError::Backup { path, source }),
            }
        }
    }

    /// Write quarantined cache lines next to `backup`.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::Backup`] when the quarantine file cannot be written.
    pub fn write_quarantine(&self, backup: &Path, lines: &[String]) -> Result<PathBuf, CacheError> {
        let mut path = backup.as_os_str().to_owned();
        path.push(".quarantine");

        let path = PathBuf::from(path);

        let mut contents = String::new();

        for line in lines {
            contents.push_str(line);
            contents.push('\n');
        }

        files::write_atomic(&path, contents.as_bytes(), BACKUP_FILE_MODE).map_err(|source| {
            CacheError::Backup {
                path: path.clone(),
                source,
            }
        })?;

        Ok(path)
    }

    /// Atomically replace the live cache.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::Write`]; the previous cache is still live in that case.
    pub fn write(&self, contents: &str) -> Result<(), CacheError> {
        files::write_atomic(&self.path, contents.as_bytes(), self.mode).map_err(|source| {
            CacheError::Write {
                path: self.path.clone(),
                source,
            }
        })
    }

    /// [`Self::write`] with bounded retries.
    pub(crate) async fn write_with_retry(
        &self,
        contents: &str,
        retry: &RetryPolicy,
    ) -> Result<(), RetryError<CacheError>> {
        retry
            .run("write credential cache", || async { self.write(contents) })
            .await
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use testresult::TestResult;

    use super::*;

    fn cache_file(dir: &Path) -> CacheFile {
        let config = EngineConfig::new(dir.join("hosts"), dir.join("userlist.txt"), "example.com");

        CacheFile::from_config(&config)
    }

    #[test]
    fn backups_never_overwrite_each_other() -> TestResult {
        let dir = tempfile::tempdir()?;
        let cache = cache_file(dir.path());

        let first = cache.backup("one\n")?;
        let second = cache.backup("two\n")?;

        assert_ne!(first, second);
        assert_eq!(fs::read_to_string(first)?, "one\n");
        assert_eq!(fs::read_to_string(second)?, "two\n");

        Ok(())
    }

    #[test]
    fn quarantine_sits_next_to_backup() -> TestResult {
        let dir = tempfile::tempdir()?;
        let cache = cache_file(dir.path());

        let backup = cache.backup("")?;
        let quarantine = cache.write_quarantine(&backup, &["\"bad\" \"md5\"".to_string()])?;

        assert_eq!(quarantine.parent(), backup.parent());
        assert!(quarantine.to_string_lossy().ends_with(".bak.quarantine"));
        assert_eq!(fs::read_to_string(quarantine)?, "\"bad\" \"md5\"\n");

        Ok(())
    }

    #[test]
    fn missing_cache_reads_as_none() -> TestResult {
        let dir = tempfile::tempdir()?;

        assert_eq!(cache_file(dir.path()).read()?, None);

        Ok(())
    }

    #[tokio::test]
    async fn second_writer_is_locked_out() -> TestResult {
        let dir = tempfile::tempdir()?;
        let cache = cache_file(dir.path());

        let _held = cache.lock(&RetryPolicy::once()).await?;

        assert!(matches!(
            cache.lock(&RetryPolicy::once()).await,
            Err(CacheError::Locked { .. })
        ));

        Ok(())
    }
}
