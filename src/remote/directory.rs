// backuptool/src/remote/directory.rs
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

use super::{RemoteItem, RemoteTransfer};
use crate::errors::{BackupError, Result};

/// A mirror on a mounted filesystem (NAS share, second disk).
///
/// Remote keys map to paths below `base`; `/` is the key separator on every platform.
#[derive(Debug, Clone)]
pub struct DirectoryTransfer {
    base: PathBuf,
}

impl DirectoryTransfer {
    pub fn new(base: impl Into<PathBuf>) -> Self {
        DirectoryTransfer { base: base.into() }
    }

    fn resolve(&self, key: &str) -> Result<PathBuf> {
        let key = key.trim_matches('/');
        if key.split('/').any(|seg| seg == "..") {
            return Err(BackupError::InvalidName(key.to_string()));
        }
        Ok(key
            .split('/')
            .filter(|seg| !seg.is_empty())
            .fold(self.base.clone(), |acc, seg| acc.join(seg)))
    }

    fn key_for(&self, path: &Path) -> Option<String> {
        let relative = path.strip_prefix(&self.base).ok()?;
        let key = relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy().into_owned())
            .collect::<Vec<_>>()
            .join("/");
        (!key.is_empty()).then_some(key)
    }
}

#[async_trait]
impl RemoteTransfer for DirectoryTransfer {
    async fn put(&self, local_path: &Path, remote_path: &str) -> Result<()> {
        let target = self.resolve(remote_path)?;
        let err = |e: std::io::Error| BackupError::transfer("put", remote_path, e);
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(err)?;
        }
        // Copy next to the target and rename so readers never see half a file.
        let staging = target.with_extension("partial");
        tokio::fs::copy(local_path, &staging).await.map_err(err)?;
        if let Err(e) = tokio::fs::rename(&staging, &target).await {
            let _ = tokio::fs::remove_file(&staging).await;
            return Err(err(e));
        }
        Ok(())
    }

    async fn list(&self, remote_prefix: &str, recursive: bool) -> Result<Vec<RemoteItem>> {
        let transfer = self.clone();
        let prefix = remote_prefix.to_string();
        // Walk from the deepest directory the prefix names, then filter by the full prefix.
        let dir_part = match prefix.rfind('/') {
            Some(idx) => &prefix[..idx],
            None => "",
        };
        let start = self.resolve(dir_part)?;
        tokio::task::spawn_blocking(move || {
            let mut items = Vec::new();
            if !start.exists() {
                return Ok(items);
            }
            let mut walker = WalkDir::new(&start).follow_links(false).min_depth(1);
            if !recursive {
                walker = walker.max_depth(1);
            }
            for entry in walker {
                let entry = entry.map_err(|e| BackupError::transfer("list", &prefix, e))?;
                let Some(mut key) = transfer.key_for(entry.path()) else {
                    continue;
                };
                if entry.file_type().is_dir() {
                    key.push('/');
                }
                if !key.starts_with(&prefix) {
                    continue;
                }
                let modified = entry
                    .metadata()
                    .ok()
                    .and_then(|m| m.modified().ok())
                    .map(DateTime::<Utc>::from);
                items.push(RemoteItem {
                    path: key,
                    modified,
                });
            }
            Ok(items)
        })
        .await
        .map_err(|e| BackupError::transfer("list", remote_prefix, e))?
    }

    async fn delete(&self, remote_path: &str) -> Result<()> {
        let target = self.resolve(remote_path)?;
        let err = |e: std::io::Error| BackupError::transfer("delete", remote_path, e);
        let metadata = match tokio::fs::symlink_metadata(&target).await {
            Ok(m) => m,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(err(e)),
        };
        if metadata.is_dir() {
            tokio::fs::remove_dir(&target).await.map_err(err)
        } else {
            tokio::fs::remove_file(&target).await.map_err(err)
        }
    }

    fn describe(&self) -> String {
        format!("directory {}", self.base.display())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn put_list_delete_round() -> anyhow::Result<()> {
        let local = tempfile::tempdir()?;
        let remote = tempfile::tempdir()?;
        let file = local.path().join("app.sql");
        std::fs::write(&file, b"-- dump")?;

        let transfer = DirectoryTransfer::new(remote.path());
        transfer.put(&file, "off/backup/db/2024-01-01/app_2024-01-01.sql").await?;
        assert_eq!(
            std::fs::read(remote.path().join("off/backup/db/2024-01-01/app_2024-01-01.sql"))?,
            b"-- dump"
        );

        let mut keys: Vec<String> = transfer
            .list("off/backup/", true)
            .await?
            .into_iter()
            .map(|i| i.path)
            .collect();
        keys.sort();
        assert_eq!(
            keys,
            vec![
                "off/backup/db/",
                "off/backup/db/2024-01-01/",
                "off/backup/db/2024-01-01/app_2024-01-01.sql",
            ]
        );

        let shallow = transfer.list("off/backup/", false).await?;
        assert_eq!(shallow.len(), 1);

        // Non-empty directories are refused; emptied ones go away.
        assert!(transfer.delete("off/backup/db/2024-01-01").await.is_err());
        transfer.delete("off/backup/db/2024-01-01/app_2024-01-01.sql").await?;
        transfer.delete("off/backup/db/2024-01-01").await?;
        assert!(!remote.path().join("off/backup/db/2024-01-01").exists());
        // Deleting something already gone is fine.
        transfer.delete("off/backup/db/2024-01-01").await?;
        Ok(())
    }

    #[tokio::test]
    async fn listing_a_missing_prefix_is_empty() -> anyhow::Result<()> {
        let remote = tempfile::tempdir()?;
        let transfer = DirectoryTransfer::new(remote.path());
        assert!(transfer.list("nothing/here/", true).await?.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn rejects_parent_traversal() -> anyhow::Result<()> {
        let remote = tempfile::tempdir()?;
        let transfer = DirectoryTransfer::new(remote.path());
        assert!(matches!(
            transfer.delete("../outside").await,
            Err(BackupError::InvalidName(_))
        ));
        Ok(())
    }
}
