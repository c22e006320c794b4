// backuptool/src/backup/lock.rs
use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};
use uuid::Uuid;

use super::paths::format_date;
use crate::errors::{BackupError, Result};

const LOCKS_DIR: &str = ".locks";

/// Contents of an in-progress marker.
#[derive(Debug, Serialize, Deserialize)]
struct MarkerEntry {
    run_id: Uuid,
    pid: u32,
    started_at: DateTime<Utc>,
}

/// Held for the duration of one run; removes its marker when dropped.
#[derive(Debug)]
pub struct RunLock {
    path: PathBuf,
    run_id: Uuid,
}

impl RunLock {
    /// Claims `run_date` by atomically creating `<backup_dir>/.locks/<date>.lock`.
    ///
    /// A marker older than `stale_after` is assumed to belong to a crashed run and is
    /// replaced once.
    pub async fn acquire(backup_dir: &Path, run_date: NaiveDate, stale_after: Duration) -> Result<Self> {
        let dir = backup_dir.join(LOCKS_DIR);
        tokio::fs::create_dir_all(&dir).await?;
        let path = dir.join(format!("{}.lock", format_date(run_date)));

        match Self::create(&path).await {
            Ok(lock) => Ok(lock),
            Err(BackupError::Io(e)) if e.kind() == ErrorKind::AlreadyExists => {
                if !Self::is_stale(&path, stale_after).await {
                    return Err(BackupError::RunAlreadyInProgress(run_date));
                }
                warn!(marker = %path.display(), "replacing stale in-progress marker");
                match tokio::fs::remove_file(&path).await {
                    Ok(()) => {}
                    Err(e) if e.kind() == ErrorKind::NotFound => {}
                    Err(e) => return Err(e.into()),
                }
                Self::create(&path).await.map_err(|e| match e {
                    BackupError::Io(io) if io.kind() == ErrorKind::AlreadyExists => {
                        BackupError::RunAlreadyInProgress(run_date)
                    }
                    other => other,
                })
            }
            Err(e) => Err(e),
        }
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    async fn create(path: &Path) -> Result<Self> {
        let mut file = tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path)
            .await?;
        let entry = MarkerEntry {
            run_id: Uuid::new_v4(),
            pid: std::process::id(),
            started_at: Utc::now(),
        };
        let data = serde_json::to_vec(&entry)
            .map_err(|e| BackupError::Io(std::io::Error::other(e)))?;
        file.write_all(&data).await?;
        file.flush().await?;
        debug!(marker = %path.display(), run_id = %entry.run_id, "acquired run marker");
        Ok(RunLock {
            path: path.to_path_buf(),
            run_id: entry.run_id,
        })
    }

    /// Unreadable or half-written markers count as live.
    async fn is_stale(path: &Path, stale_after: Duration) -> bool {
        let Ok(data) = tokio::fs::read(path).await else {
            return false;
        };
        match serde_json::from_slice::<MarkerEntry>(&data) {
            Ok(entry) => Utc::now() - entry.started_at > stale_after,
            Err(_) => false,
        }
    }
}

impl Drop for RunLock {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            warn!(marker = %self.path.display(), error = %e, "failed to remove run marker");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn day() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 4, 1).unwrap()
    }

    #[tokio::test]
    async fn second_acquire_for_same_date_is_rejected() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let first = RunLock::acquire(dir.path(), day(), Duration::hours(24)).await?;

        let second = RunLock::acquire(dir.path(), day(), Duration::hours(24)).await;
        assert!(matches!(second, Err(BackupError::RunAlreadyInProgress(d)) if d == day()));

        let other_day = day().succ_opt().unwrap();
        let third = RunLock::acquire(dir.path(), other_day, Duration::hours(24)).await?;
        assert_ne!(first.run_id(), third.run_id());
        Ok(())
    }

    #[tokio::test]
    async fn dropping_the_lock_frees_the_date() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let marker = dir.path().join(".locks").join("2024-04-01.lock");
        {
            let _lock = RunLock::acquire(dir.path(), day(), Duration::hours(24)).await?;
            assert!(marker.exists());
        }
        assert!(!marker.exists());
        RunLock::acquire(dir.path(), day(), Duration::hours(24)).await?;
        Ok(())
    }

    #[tokio::test]
    async fn stale_marker_is_replaced() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let locks = dir.path().join(".locks");
        std::fs::create_dir_all(&locks)?;
        let old = MarkerEntry {
            run_id: Uuid::new_v4(),
            pid: 1,
            started_at: Utc::now() - Duration::hours(30),
        };
        std::fs::write(locks.join("2024-04-01.lock"), serde_json::to_vec(&old)?)?;

        let lock = RunLock::acquire(dir.path(), day(), Duration::hours(24)).await?;
        assert_ne!(lock.run_id(), old.run_id);
        Ok(())
    }

    #[tokio::test]
    async fn garbage_marker_is_treated_as_live() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let locks = dir.path().join(".locks");
        std::fs::create_dir_all(&locks)?;
        std::fs::write(locks.join("2024-04-01.lock"), b"{")?;

        let result = RunLock::acquire(dir.path(), day(), Duration::hours(24)).await;
        assert!(matches!(result, Err(BackupError::RunAlreadyInProgress(_))));
        Ok(())
    }
}
