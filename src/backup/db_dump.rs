// backuptool/src/backup/db_dump.rs
use async_trait::async_trait;
use chrono::NaiveDate;
use sqlx::{Connection, PgConnection, Row};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::events::{EventSink, StageTally};
use super::paths::{ArtifactPath, PathNamer};
use super::run::{Stage, StageResult};
use crate::errors::{BackupError, Result};
use crate::utils::{base_url_without_db, find_executable, redact_url};
use crate::utils::pool::run_bounded;

pub const DATABASE_PLACEHOLDER: &str = "{database}";
pub const URL_PLACEHOLDER: &str = "{url}";
const STDERR_LIMIT: usize = 4096;

/// Lists the databases available on the source system.
#[async_trait]
pub trait DatabaseEnumerator: Send + Sync {
    async fn list_databases(&self) -> Result<Vec<String>>;
}

/// Writes one database's dump to a file.
#[async_trait]
pub trait DatabaseDumper: Send + Sync {
    /// Creates or overwrites exactly `destination`. Must give up after `timeout`.
    async fn dump(&self, db_name: &str, destination: &Path, timeout: Duration) -> Result<()>;
}

/// Enumerates non-template, connectable databases of a Postgres server.
#[derive(Debug, Clone)]
pub struct PgEnumerator {
    source_url: String,
}

impl PgEnumerator {
    pub fn new(source_url: impl Into<String>) -> Self {
        PgEnumerator {
            source_url: source_url.into(),
        }
    }
}

#[async_trait]
impl DatabaseEnumerator for PgEnumerator {
    async fn list_databases(&self) -> Result<Vec<String>> {
        let base_url = base_url_without_db(&self.source_url)?;
        let admin_url = format!("{}/postgres", base_url);
        debug!(url = %redact_url(&admin_url), "fetching list of databases");

        let mut conn = PgConnection::connect(&admin_url).await.map_err(|e| {
            BackupError::Connection(format!(
                "Failed to connect to 'postgres' database on {} for listing databases: {e}",
                redact_url(&base_url)
            ))
        })?;
        let rows = sqlx::query(
            "SELECT datname FROM pg_database WHERE datistemplate = false AND datallowconn = true ORDER BY datname;",
        )
        .fetch_all(&mut conn)
        .await
        .map_err(|e| BackupError::Connection(format!("Failed to fetch database list from pg_database: {e}")))?;

        let names = rows
            .iter()
            .map(|row| row.try_get::<String, _>("datname"))
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| BackupError::Connection(format!("Failed to read 'datname': {e}")))?;
        let _ = conn.close().await;
        info!(count = names.len(), "found databases");
        Ok(names)
    }
}

/// A fixed list from configuration.
#[derive(Debug, Clone)]
pub struct StaticEnumerator {
    names: Vec<String>,
}

impl StaticEnumerator {
    pub fn new(names: Vec<String>) -> Self {
        StaticEnumerator { names }
    }
}

#[async_trait]
impl DatabaseEnumerator for StaticEnumerator {
    async fn list_databases(&self) -> Result<Vec<String>> {
        Ok(self.names.clone())
    }
}

/// Runs an external dump program and captures its stdout into the destination file.
#[derive(Debug, Clone)]
pub struct CommandDumper {
    program: PathBuf,
    args: Vec<String>,
    base_url: Option<String>,
}

impl CommandDumper {
    /// `args` may contain `{database}` and `{url}` (the source URL pointed at the database).
    pub fn new(program: &str, args: Vec<String>, source_url: Option<&str>) -> Result<Self> {
        let program = find_executable(program)?;
        let base_url = source_url.map(base_url_without_db).transpose()?;
        if base_url.is_none() && args.iter().any(|a| a.contains(URL_PLACEHOLDER)) {
            return Err(BackupError::Config(format!(
                "dump arguments use {URL_PLACEHOLDER} but no database url is configured"
            )));
        }
        debug!(program = %program.display(), "found dump executable");
        Ok(CommandDumper {
            program,
            args,
            base_url,
        })
    }

    fn render_args(&self, db_name: &str) -> Vec<String> {
        let url = self
            .base_url
            .as_ref()
            .map(|base| format!("{base}/{db_name}"))
            .unwrap_or_default();
        self.args
            .iter()
            .map(|arg| {
                arg.replace(DATABASE_PLACEHOLDER, db_name)
                    .replace(URL_PLACEHOLDER, &url)
            })
            .collect()
    }

    async fn run(&self, db_name: &str, destination: &Path, timeout: Duration) -> Result<()> {
        let file = tokio::fs::File::create(destination).await?.into_std().await;
        let durable = file.try_clone()?;

        let mut child = Command::new(&self.program)
            .args(self.render_args(db_name))
            .stdin(Stdio::null())
            .stdout(Stdio::from(file))
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let mut stderr_pipe = child.stderr.take();
        let mut stderr_reader = tokio::spawn(async move {
            let mut buf = Vec::new();
            if let Some(pipe) = stderr_pipe.as_mut() {
                let _ = pipe.read_to_end(&mut buf).await;
            }
            buf
        });

        let started = Instant::now();
        let status = match tokio::time::timeout(timeout, child.wait()).await {
            Ok(status) => status?,
            Err(_) => {
                warn!(db_name, secs = timeout.as_secs(), "dump timed out, killing process");
                let _ = child.kill().await;
                stderr_reader.abort();
                return Err(BackupError::DumpTimeout {
                    db_name: db_name.to_string(),
                    secs: timeout.as_secs(),
                });
            }
        };
        // A leftover grandchild may keep the pipe open; never wait past the deadline for it.
        let remaining = timeout.saturating_sub(started.elapsed());
        let stderr = match tokio::time::timeout(remaining, &mut stderr_reader).await {
            Ok(joined) => joined.unwrap_or_default(),
            Err(_) => {
                debug!(db_name, "stderr still open after exit, not waiting for it");
                stderr_reader.abort();
                Vec::new()
            }
        };

        if !status.success() {
            let mut text = String::from_utf8_lossy(&stderr).trim().to_string();
            if text.len() > STDERR_LIMIT {
                let mut cut = STDERR_LIMIT;
                while !text.is_char_boundary(cut) {
                    cut -= 1;
                }
                text.truncate(cut);
            }
            return Err(BackupError::DumpProcess {
                db_name: db_name.to_string(),
                exit_code: status.code(),
                stderr: text,
            });
        }

        tokio::task::spawn_blocking(move || durable.sync_all())
            .await
            .map_err(|e| BackupError::Io(std::io::Error::other(e)))??;
        Ok(())
    }
}

#[async_trait]
impl DatabaseDumper for CommandDumper {
    async fn dump(&self, db_name: &str, destination: &Path, timeout: Duration) -> Result<()> {
        let result = self.run(db_name, destination, timeout).await;
        if result.is_err() {
            // A truncated dump must never pass for a backup.
            let _ = tokio::fs::remove_file(destination).await;
        }
        result
    }
}

/// Applies the configured exclude set, preserving enumeration order.
pub fn filter_databases(names: Vec<String>, exclude: &HashSet<String>) -> Vec<String> {
    let mut seen = HashSet::new();
    names
        .into_iter()
        .filter(|name| {
            if exclude.contains(name) {
                debug!(db_name = %name, "skipping excluded database");
                return false;
            }
            seen.insert(name.clone())
        })
        .collect()
}

/// Everything the dump stage needs besides the database list.
pub(crate) struct DumpJob<'a> {
    pub namer: &'a PathNamer,
    pub dumper: Arc<dyn DatabaseDumper>,
    pub run_date: NaiveDate,
    pub timeout: Duration,
    pub pool_size: usize,
}

/// Dumps every database on the worker pool; one failure never affects the others.
///
/// Returns the stage result and the artifacts that were written successfully.
pub(crate) async fn dump_databases(
    job: DumpJob<'_>,
    databases: Vec<String>,
    cancel: &CancellationToken,
    sink: Arc<dyn EventSink>,
) -> Result<(StageResult, Vec<ArtifactPath>)> {
    tokio::fs::create_dir_all(job.namer.local_dump_dir(job.run_date)).await?;
    info!(count = databases.len(), date = %job.run_date, "Starting database dump process");

    let mut tally = StageTally::start(Stage::Dump, databases.len(), sink);
    let mut planned = Vec::new();
    for db_name in databases {
        match job.namer.local_dump_path(&db_name, job.run_date) {
            Ok(artifact) => planned.push((db_name, artifact)),
            Err(e) => tally.failed(db_name, e),
        }
    }

    let dumper = job.dumper;
    let timeout = job.timeout;
    let outcome = run_bounded(planned, job.pool_size, cancel, |(db_name, artifact)| {
        let dumper = dumper.clone();
        async move {
            let result = match tokio::time::timeout(timeout, dumper.dump(&db_name, &artifact.local, timeout)).await {
                Ok(result) => result,
                Err(_) => {
                    warn!(db_name = %db_name, secs = timeout.as_secs(), "dumper overran its timeout, abandoning it");
                    let _ = tokio::fs::remove_file(&artifact.local).await;
                    Err(BackupError::DumpTimeout {
                        db_name: db_name.clone(),
                        secs: timeout.as_secs(),
                    })
                }
            };
            (db_name, artifact, result)
        }
    })
    .await;

    let mut produced = Vec::new();
    for (db_name, artifact, result) in outcome.completed {
        match result {
            Ok(()) => {
                info!(db_name = %db_name, path = %artifact.local.display(), "✓ database dumped");
                tally.succeeded(db_name);
                produced.push(artifact);
            }
            Err(e) => tally.failed(db_name, e),
        }
    }
    for _ in 0..outcome.panicked {
        tally.failed("<worker>", "dump task panicked");
    }
    produced.sort_by(|a, b| a.relative.cmp(&b.relative));
    Ok((tally.finish(outcome.skipped.len()), produced))
}
