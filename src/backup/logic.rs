// backuptool/src/backup/logic.rs
use chrono::NaiveDate;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use super::archive::TreeArchiver;
use super::db_dump::{DatabaseDumper, DatabaseEnumerator, DumpJob, dump_databases, filter_databases};
use super::events::{EventSink, StageTally, stage_fatal};
use super::lock::RunLock;
use super::paths::{ArtifactPath, BACKUP_NAMESPACE, PathNamer};
use super::retention::{ArtifactSet, collect_sets, prune};
use super::run::{BackupRun, RunState, Stage, StageResult, StageStatus};
use super::store::LocalStore;
use crate::config::BackupConfig;
use crate::errors::{BackupError, Result};
use crate::remote::RemoteTransfer;
use crate::utils::pool::run_bounded;

/// Sequences dump → archive → upload → prune for one run date.
pub struct BackupOrchestrator {
    config: BackupConfig,
    namer: PathNamer,
    store: LocalStore,
    enumerator: Arc<dyn DatabaseEnumerator>,
    dumper: Arc<dyn DatabaseDumper>,
    remote: Option<Arc<dyn RemoteTransfer>>,
    sink: Arc<dyn EventSink>,
}

impl BackupOrchestrator {
    pub fn new(
        config: BackupConfig,
        enumerator: Arc<dyn DatabaseEnumerator>,
        dumper: Arc<dyn DatabaseDumper>,
        remote: Option<Arc<dyn RemoteTransfer>>,
        sink: Arc<dyn EventSink>,
    ) -> Result<Self> {
        let namer = PathNamer::new(&config.local_root, config.remote_root(), &config.archive_file_name)?;
        let store = LocalStore::new(&config.local_root);
        Ok(BackupOrchestrator {
            config,
            namer,
            store,
            enumerator,
            dumper,
            remote,
            sink,
        })
    }

    /// Executes one run.
    ///
    /// `Err` means the run never started (lock held, local tree unusable, already
    /// cancelled). Everything that happens once stages begin is reported in the
    /// returned `BackupRun`.
    pub async fn run(&self, run_date: NaiveDate, cancel: &CancellationToken) -> Result<BackupRun> {
        if cancel.is_cancelled() {
            return Err(BackupError::Cancelled(format!("run for {run_date} cancelled before start")));
        }
        self.store.prepare().await?;
        let lock = RunLock::acquire(&self.store.backup_dir(), run_date, self.config.stale_lock_after).await?;
        info!(
            %run_date,
            run_id = %lock.run_id(),
            remote = %self.remote.as_ref().map(|r| r.describe()).unwrap_or_else(|| "none".to_string()),
            "🚀 Starting backup run"
        );

        let cancel = cancel.child_token();
        let deadline = self.config.run_timeout.map(|limit| {
            let token = cancel.clone();
            tokio::spawn(async move {
                tokio::time::sleep(limit).await;
                warn!(secs = limit.as_secs(), "run timeout reached, draining current stage");
                token.cancel();
            })
        });

        let mut run = BackupRun::new(run_date);
        self.execute(&mut run, &cancel).await;

        if let Some(handle) = deadline {
            handle.abort();
        }
        drop(lock);
        info!(
            %run_date,
            state = ?run.state,
            status = %run.overall_status(),
            "Backup run finished"
        );
        Ok(run)
    }

    async fn execute(&self, run: &mut BackupRun, cancel: &CancellationToken) {
        let run_date = run.run_date;

        run.state = RunState::DumpingDatabases;
        let (dump_result, dumps) = self.dump_stage(run_date, cancel).await;
        if !self.advance(run, dump_result) {
            return;
        }

        run.state = RunState::ArchivingTree;
        let archive = self.namer.local_archive_path(run_date);
        let archive_result = match TreeArchiver::new(self.config.worker_pool_size)
            .archive(&self.config.source_directory, &archive.local, cancel, self.sink.clone())
            .await
        {
            Ok(result) => result,
            Err(e) => {
                error!(error = %e, "archive stage could not run");
                stage_fatal(self.sink.as_ref(), Stage::Archive, e)
            }
        };
        // Skipped files mean the previous archive was kept; it is not today's.
        let archive_replaced = archive_result.items_skipped == 0;
        if !self.advance(run, archive_result) {
            return;
        }

        if let Some(remote) = &self.remote {
            run.state = RunState::Uploading;
            let mut artifacts = dumps;
            if archive_replaced {
                artifacts.push(archive);
            }
            run.record(self.upload_stage(remote.clone(), artifacts, run_date, cancel).await);
        } else {
            info!("no remote configured, skipping upload");
        }

        run.state = RunState::Pruning;
        run.record(self.prune_local(run_date, cancel).await);
        if let Some(remote) = &self.remote {
            run.record(self.prune_remote(remote.clone(), run_date, cancel).await);
        }

        run.finish(RunState::Done);
    }

    /// Records a stage; a critical stage that failed outright ends the run.
    fn advance(&self, run: &mut BackupRun, result: StageResult) -> bool {
        let stop = result.stage.is_critical() && result.status == StageStatus::Failure;
        if stop {
            error!(stage = %result.stage, "critical stage failed, backup not taken");
        }
        run.record(result);
        if stop {
            run.finish(RunState::Failed);
        }
        !stop
    }

    async fn dump_stage(&self, run_date: NaiveDate, cancel: &CancellationToken) -> (StageResult, Vec<ArtifactPath>) {
        let names = match self.enumerator.list_databases().await {
            Ok(names) => names,
            Err(e) => {
                error!(error = %e, "cannot enumerate databases");
                return (stage_fatal(self.sink.as_ref(), Stage::Dump, e), Vec::new());
            }
        };
        let databases = filter_databases(names, &self.config.database.exclude);
        let job = DumpJob {
            namer: &self.namer,
            dumper: self.dumper.clone(),
            run_date,
            timeout: self.config.database.dump_timeout,
            pool_size: self.config.worker_pool_size,
        };
        match dump_databases(job, databases, cancel, self.sink.clone()).await {
            Ok(done) => done,
            Err(e) => {
                error!(error = %e, "dump stage could not run");
                (stage_fatal(self.sink.as_ref(), Stage::Dump, e), Vec::new())
            }
        }
    }

    async fn upload_stage(
        &self,
        remote: Arc<dyn RemoteTransfer>,
        artifacts: Vec<ArtifactPath>,
        run_date: NaiveDate,
        cancel: &CancellationToken,
    ) -> StageResult {
        info!(count = artifacts.len(), remote = %remote.describe(), "uploading artifacts");
        let mut tally = StageTally::start(Stage::Upload, artifacts.len(), self.sink.clone());
        let mut planned = Vec::new();
        for artifact in artifacts {
            match self.namer.remote_path(&artifact.relative, run_date) {
                Ok(key) => planned.push((artifact, key)),
                Err(e) => tally.failed(artifact.relative, e),
            }
        }

        let outcome = run_bounded(planned, self.config.worker_pool_size, cancel, |(artifact, key)| {
            let remote = remote.clone();
            async move {
                let result = remote.put(&artifact.local, &key).await;
                (key, result)
            }
        })
        .await;

        for (key, result) in outcome.completed {
            match result {
                Ok(()) => tally.succeeded(key),
                Err(e) => tally.failed(key, e),
            }
        }
        for _ in 0..outcome.panicked {
            tally.failed("<worker>", "upload task panicked");
        }
        tally.finish(outcome.skipped.len())
    }

    async fn prune_local(&self, today: NaiveDate, cancel: &CancellationToken) -> StageResult {
        let paths = match self.store.list().await {
            Ok(paths) => paths,
            Err(e) => return stage_fatal(self.sink.as_ref(), Stage::PruneLocal, e),
        };
        let store = &self.store;
        prune(
            Stage::PruneLocal,
            collect_sets(BACKUP_NAMESPACE, &paths),
            self.config.local_retention,
            today,
            cancel,
            self.sink.clone(),
            |set| async move { store.remove(&set).await },
        )
        .await
    }

    async fn prune_remote(
        &self,
        remote: Arc<dyn RemoteTransfer>,
        today: NaiveDate,
        cancel: &CancellationToken,
    ) -> StageResult {
        let namespace = self.namer.remote_namespace();
        let paths: Vec<String> = match remote.list(&namespace, true).await {
            Ok(items) => items.into_iter().map(|item| item.path).collect(),
            Err(e) => {
                warn!(error = %e, "cannot list remote artifacts");
                return stage_fatal(self.sink.as_ref(), Stage::PruneRemote, e);
            }
        };
        let remote = remote.as_ref();
        prune(
            Stage::PruneRemote,
            collect_sets(&namespace, &paths),
            self.config.retention,
            today,
            cancel,
            self.sink.clone(),
            |set| delete_remote_set(remote, set),
        )
        .await
    }
}

/// Deletes every member, then the directory itself. A directory whose members
/// could not all be deleted is kept for the next run.
async fn delete_remote_set(remote: &dyn RemoteTransfer, set: ArtifactSet) -> Result<()> {
    let mut first_error = None;
    for member in &set.members {
        if let Err(e) = remote.delete(member).await {
            warn!(path = %member, error = %e, "remote delete failed");
            first_error.get_or_insert(e);
        }
    }
    if let Some(e) = first_error {
        return Err(e);
    }
    if set.is_dir {
        remote.delete(&format!("{}/", set.path)).await?;
    }
    Ok(())
}
