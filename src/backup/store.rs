// backuptool/src/backup/store.rs
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::debug;
use walkdir::WalkDir;

use super::paths::{BACKUP_NAMESPACE, DB_DIR, WWW_DIR};
use super::retention::ArtifactSet;
use crate::errors::{BackupError, Result};

const HIDDEN_PREFIX: char = '.';

/// The local `backup/` tree: creation, listing and removal of artifact sets.
#[derive(Debug, Clone)]
pub struct LocalStore {
    root: PathBuf,
}

impl LocalStore {
    pub fn new(local_root: impl Into<PathBuf>) -> Self {
        LocalStore {
            root: local_root.into(),
        }
    }

    pub fn backup_dir(&self) -> PathBuf {
        self.root.join(BACKUP_NAMESPACE)
    }

    /// Creates `backup/db` and `backup/www`; existing directories are left alone.
    pub async fn prepare(&self) -> Result<()> {
        let backup_dir = self.backup_dir();
        for sub in [DB_DIR, WWW_DIR] {
            tokio::fs::create_dir_all(backup_dir.join(sub)).await?;
        }
        debug!(dir = %backup_dir.display(), "local backup tree ready");
        Ok(())
    }

    /// Every file and directory below `backup/`, as `/`-separated paths starting with
    /// `backup/`. Directories carry a trailing `/`. Hidden entries such as the lock
    /// directory are skipped with their contents.
    pub async fn list(&self) -> Result<Vec<String>> {
        let root = self.root.clone();
        let backup_dir = self.backup_dir();
        tokio::task::spawn_blocking(move || {
            let mut paths = Vec::new();
            if !backup_dir.is_dir() {
                return Ok(paths);
            }
            let walker = WalkDir::new(&backup_dir)
                .follow_links(false)
                .min_depth(1)
                .into_iter()
                .filter_entry(|e| !e.file_name().to_string_lossy().starts_with(HIDDEN_PREFIX));
            for entry in walker {
                let entry = entry.map_err(|e| BackupError::Io(std::io::Error::other(e)))?;
                let Some(mut key) = relative_key(&root, entry.path()) else {
                    continue;
                };
                if entry.file_type().is_dir() {
                    key.push('/');
                }
                paths.push(key);
            }
            Ok(paths)
        })
        .await
        .map_err(|e| BackupError::Io(std::io::Error::other(e)))?
    }

    /// Removes a whole set from disk. Already-missing paths count as removed.
    pub async fn remove(&self, set: &ArtifactSet) -> Result<()> {
        if set.path.split('/').any(|seg| seg == ".." || seg.is_empty()) {
            return Err(BackupError::InvalidName(set.path.clone()));
        }
        let target = set
            .path
            .split('/')
            .fold(self.root.clone(), |acc, seg| acc.join(seg));
        let result = if set.is_dir {
            tokio::fs::remove_dir_all(&target).await
        } else {
            tokio::fs::remove_file(&target).await
        };
        match result {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

fn relative_key(root: &Path, path: &Path) -> Option<String> {
    let relative = path.strip_prefix(root).ok()?;
    let key = relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect::<Vec<_>>()
        .join("/");
    (!key.is_empty()).then_some(key)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backup::retention::collect_sets;

    #[tokio::test]
    async fn lists_tree_without_lock_directory() -> anyhow::Result<()> {
        let root = tempfile::tempdir()?;
        let store = LocalStore::new(root.path());
        store.prepare().await?;
        let day_dir = store.backup_dir().join("db/2024-06-01");
        std::fs::create_dir_all(&day_dir)?;
        std::fs::write(day_dir.join("app_2024-06-01.sql"), b"--")?;
        std::fs::create_dir_all(store.backup_dir().join(".locks"))?;
        std::fs::write(store.backup_dir().join(".locks/2024-06-01.lock"), b"{}")?;

        let mut paths = store.list().await?;
        paths.sort();
        assert_eq!(
            paths,
            vec![
                "backup/db/",
                "backup/db/2024-06-01/",
                "backup/db/2024-06-01/app_2024-06-01.sql",
                "backup/www/",
            ]
        );
        Ok(())
    }

    #[tokio::test]
    async fn removes_dated_directory_and_dated_file() -> anyhow::Result<()> {
        let root = tempfile::tempdir()?;
        let store = LocalStore::new(root.path());
        store.prepare().await?;
        std::fs::create_dir_all(store.backup_dir().join("db/2024-06-01"))?;
        std::fs::write(store.backup_dir().join("db/2024-06-01/app_2024-06-01.sql"), b"--")?;
        std::fs::write(store.backup_dir().join("www/site_2024-06-01.tar.gz"), b"gz")?;

        let sets = collect_sets(BACKUP_NAMESPACE, &store.list().await?);
        assert_eq!(sets.len(), 2);
        for set in &sets {
            store.remove(set).await?;
        }
        assert!(!store.backup_dir().join("db/2024-06-01").exists());
        assert!(!store.backup_dir().join("www/site_2024-06-01.tar.gz").exists());
        assert!(store.backup_dir().join("www").is_dir());

        // A second removal of the same sets is a no-op.
        for set in &sets {
            store.remove(set).await?;
        }
        Ok(())
    }

    #[tokio::test]
    async fn missing_backup_dir_lists_nothing() -> anyhow::Result<()> {
        let root = tempfile::tempdir()?;
        assert!(LocalStore::new(root.path().join("absent")).list().await?.is_empty());
        Ok(())
    }
}
