pub mod archive;
pub mod db_dump;
pub mod events;
pub mod lock;
mod logic;
pub mod paths;
pub mod retention;
pub mod run;
pub mod store;

use chrono::NaiveDate;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::{BackupConfig, RemoteBackend};
use crate::errors::{BackupError, Result};
use crate::remote::{DirectoryTransfer, RemoteTransfer, S3Transfer};
use db_dump::{CommandDumper, DatabaseEnumerator, PgEnumerator, StaticEnumerator};
use events::EventSink;
use run::BackupRun;

pub use logic::BackupOrchestrator;

/// Wires the production collaborators (Postgres enumeration, external dump program,
/// configured remote) into an orchestrator.
pub async fn build_orchestrator(config: BackupConfig, sink: Arc<dyn EventSink>) -> Result<BackupOrchestrator> {
    let db = &config.database;
    let enumerator: Arc<dyn DatabaseEnumerator> = match (&db.include, &db.url) {
        (Some(names), _) => {
            info!(count = names.len(), "using configured database list");
            Arc::new(StaticEnumerator::new(names.clone()))
        }
        (None, Some(url)) => Arc::new(PgEnumerator::new(url.clone())),
        (None, None) => {
            return Err(BackupError::Config(
                "no database url to enumerate databases from".to_string(),
            ));
        }
    };
    let dumper = Arc::new(CommandDumper::new(
        &db.dump_program,
        db.dump_args.clone(),
        db.url.as_deref(),
    )?);

    let remote: Option<Arc<dyn RemoteTransfer>> = match config.remote.as_ref().map(|r| &r.backend) {
        Some(RemoteBackend::S3(s3_config)) => {
            let transfer = S3Transfer::connect(s3_config).await;
            if let Err(e) = transfer.check_connection().await {
                // Upload and remote prune will record the individual failures.
                warn!(error = %e, "remote bucket check failed");
            }
            Some(Arc::new(transfer))
        }
        Some(RemoteBackend::Directory(path)) => Some(Arc::new(DirectoryTransfer::new(path))),
        None => None,
    };

    BackupOrchestrator::new(config, enumerator, dumper, remote, sink)
}

/// Public entry point for the backup process.
pub async fn run_backup_flow(
    config: BackupConfig,
    run_date: NaiveDate,
    sink: Arc<dyn EventSink>,
    cancel: &CancellationToken,
) -> Result<BackupRun> {
    let orchestrator = build_orchestrator(config, sink).await?;
    orchestrator.run(run_date, cancel).await
}
