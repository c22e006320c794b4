// backuptool/src/testutil.rs
use async_trait::async_trait;
use flate2::read::GzDecoder;
use std::collections::{BTreeMap, HashSet};
use std::io::Read;
use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

use crate::backup::db_dump::{DatabaseDumper, DatabaseEnumerator};
use crate::backup::events::{EventSink, StageEvent, StageEventKind};
use crate::backup::run::Stage;
use crate::errors::{BackupError, Result};
use crate::remote::{DirectoryTransfer, RemoteItem, RemoteTransfer};

/// Keeps every event in memory.
#[derive(Debug, Default)]
pub struct RecordingSink {
    events: Mutex<Vec<StageEvent>>,
}

impl RecordingSink {
    pub fn events(&self) -> Vec<StageEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn kinds(&self, stage: Stage) -> Vec<StageEventKind> {
        self.events()
            .into_iter()
            .filter(|e| e.stage == stage)
            .map(|e| e.kind)
            .collect()
    }
}

impl EventSink for RecordingSink {
    fn emit(&self, event: StageEvent) {
        self.events.lock().unwrap().push(event);
    }
}

/// Writes `-- dump of <db>` instead of running a real dump program.
#[derive(Debug, Default)]
pub struct FakeDumper {
    failing: HashSet<String>,
    delay: Option<Duration>,
    calls: Mutex<Vec<String>>,
}

impl FakeDumper {
    pub fn failing(names: &[&str]) -> Self {
        FakeDumper {
            failing: names.iter().map(|s| s.to_string()).collect(),
            ..Default::default()
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn calls(&self) -> Vec<String> {
        let mut calls = self.calls.lock().unwrap().clone();
        calls.sort();
        calls
    }
}

#[async_trait]
impl DatabaseDumper for FakeDumper {
    async fn dump(&self, db_name: &str, destination: &Path, _timeout: Duration) -> Result<()> {
        self.calls.lock().unwrap().push(db_name.to_string());
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if self.failing.contains(db_name) {
            return Err(BackupError::DumpProcess {
                db_name: db_name.to_string(),
                exit_code: Some(1),
                stderr: "FATAL: role \"backup\" does not exist".to_string(),
            });
        }
        tokio::fs::write(destination, format!("-- dump of {db_name}\n")).await?;
        Ok(())
    }
}

/// An enumerator whose source is unreachable.
#[derive(Debug, Default)]
pub struct DownEnumerator;

#[async_trait]
impl DatabaseEnumerator for DownEnumerator {
    async fn list_databases(&self) -> Result<Vec<String>> {
        Err(BackupError::Connection("connection refused".to_string()))
    }
}

/// A directory remote that rejects puts and deletes of keys containing `fail_on`.
#[derive(Debug)]
pub struct FlakyTransfer {
    inner: DirectoryTransfer,
    fail_on: String,
}

impl FlakyTransfer {
    pub fn new(base: &Path, fail_on: &str) -> Self {
        FlakyTransfer {
            inner: DirectoryTransfer::new(base),
            fail_on: fail_on.to_string(),
        }
    }

    fn check(&self, operation: &'static str, path: &str) -> Result<()> {
        if path.contains(&self.fail_on) {
            return Err(BackupError::transfer(operation, path, "access denied"));
        }
        Ok(())
    }
}

#[async_trait]
impl RemoteTransfer for FlakyTransfer {
    async fn put(&self, local_path: &Path, remote_path: &str) -> Result<()> {
        self.check("put", remote_path)?;
        self.inner.put(local_path, remote_path).await
    }

    async fn list(&self, remote_prefix: &str, recursive: bool) -> Result<Vec<RemoteItem>> {
        self.inner.list(remote_prefix, recursive).await
    }

    async fn delete(&self, remote_path: &str) -> Result<()> {
        self.check("delete", remote_path)?;
        self.inner.delete(remote_path).await
    }

    fn describe(&self) -> String {
        format!("flaky {}", self.inner.describe())
    }
}

/// Every entry of a `.tar.gz`, keyed by entry path.
pub fn read_archive(path: &Path) -> anyhow::Result<BTreeMap<String, Vec<u8>>> {
    let file = std::fs::File::open(path)?;
    let mut archive = tar::Archive::new(GzDecoder::new(file));
    let mut entries = BTreeMap::new();
    for entry in archive.entries()? {
        let mut entry = entry?;
        let name = entry.path()?.to_string_lossy().into_owned();
        let mut data = Vec::new();
        entry.read_to_end(&mut data)?;
        entries.insert(name, data);
    }
    Ok(entries)
}

/// Relative paths of every file below `root`, `/`-separated and sorted.
pub fn tree(root: &Path) -> Vec<String> {
    let mut files: Vec<String> = walkdir::WalkDir::new(root)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .filter_map(|e| {
            e.path()
                .strip_prefix(root)
                .ok()
                .map(|p| p.to_string_lossy().replace('\\', "/"))
        })
        .collect();
    files.sort();
    files
}
