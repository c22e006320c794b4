// backuptool/src/backup/run.rs
use chrono::{DateTime, NaiveDate, Utc};
use std::fmt;

/// Exit code when every attempted stage succeeded.
pub const EXIT_SUCCESS: u8 = 0;
/// Exit code when the backup was not taken (pre-run error or a critical stage failed).
pub const EXIT_BACKUP_FAILED: u8 = 1;
/// Exit code when the backup was taken but some stage degraded.
pub const EXIT_DEGRADED: u8 = 2;

/// One phase of the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    Dump,
    Archive,
    Upload,
    PruneLocal,
    PruneRemote,
}

impl Stage {
    /// Dump and archive decide whether a backup exists at all.
    pub fn is_critical(self) -> bool {
        matches!(self, Stage::Dump | Stage::Archive)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Stage::Dump => "dump",
            Stage::Archive => "archive",
            Stage::Upload => "upload",
            Stage::PruneLocal => "prune-local",
            Stage::PruneRemote => "prune-remote",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Ordered so that `max` yields the worst outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum StageStatus {
    Success,
    PartialFailure,
    Failure,
}

impl fmt::Display for StageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            StageStatus::Success => "success",
            StageStatus::PartialFailure => "partial failure",
            StageStatus::Failure => "failure",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemError {
    pub identifier: String,
    pub cause: String,
}

#[derive(Debug, Clone)]
pub struct StageResult {
    pub stage: Stage,
    pub status: StageStatus,
    pub items_processed: usize,
    pub items_failed: usize,
    /// Items never started because the run was cancelled.
    pub items_skipped: usize,
    pub errors: Vec<ItemError>,
    /// Set when the stage could not begin at all.
    pub fatal: Option<String>,
}

impl StageResult {
    pub fn fatal(stage: Stage, cause: impl ToString) -> Self {
        StageResult {
            stage,
            status: StageStatus::Failure,
            items_processed: 0,
            items_failed: 0,
            items_skipped: 0,
            errors: Vec::new(),
            fatal: Some(cause.to_string()),
        }
    }

    pub fn from_items(
        stage: Stage,
        items_processed: usize,
        errors: Vec<ItemError>,
        items_skipped: usize,
    ) -> Self {
        let items_failed = errors.len().min(items_processed);
        let status = if items_failed > 0 || items_skipped > 0 {
            StageStatus::PartialFailure
        } else {
            StageStatus::Success
        };
        StageResult {
            stage,
            status,
            items_processed,
            items_failed,
            items_skipped,
            errors,
            fatal: None,
        }
    }

    pub fn items_succeeded(&self) -> usize {
        self.items_processed - self.items_failed
    }

    /// One-line human summary, e.g. `dump: partial failure (3 ok, 1 failed: app)`.
    pub fn summary(&self) -> String {
        if let Some(cause) = &self.fatal {
            return format!("{}: {} ({})", self.stage, self.status, cause);
        }
        let mut line = format!(
            "{}: {} ({} ok, {} failed",
            self.stage,
            self.status,
            self.items_succeeded(),
            self.items_failed
        );
        if self.items_skipped > 0 {
            line.push_str(&format!(", {} skipped", self.items_skipped));
        }
        if !self.errors.is_empty() {
            let ids: Vec<&str> = self.errors.iter().map(|e| e.identifier.as_str()).collect();
            line.push_str(&format!(": {}", ids.join(", ")));
        }
        line.push(')');
        line
    }
}

/// Orchestrator state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Idle,
    DumpingDatabases,
    ArchivingTree,
    Uploading,
    Pruning,
    Done,
    Failed,
}

/// One execution of the pipeline.
#[derive(Debug, Clone)]
pub struct BackupRun {
    pub run_date: NaiveDate,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub state: RunState,
    pub stages: Vec<StageResult>,
}

impl BackupRun {
    pub fn new(run_date: NaiveDate) -> Self {
        BackupRun {
            run_date,
            started_at: Utc::now(),
            finished_at: None,
            state: RunState::Idle,
            stages: Vec::new(),
        }
    }

    pub fn stage(&self, stage: Stage) -> Option<&StageResult> {
        self.stages.iter().find(|s| s.stage == stage)
    }

    /// Worst status among attempted stages.
    pub fn overall_status(&self) -> StageStatus {
        self.stages
            .iter()
            .map(|s| s.status)
            .max()
            .unwrap_or(StageStatus::Success)
    }

    pub fn exit_code(&self) -> u8 {
        let critical_failed = self
            .stages
            .iter()
            .any(|s| s.stage.is_critical() && s.status == StageStatus::Failure);
        if critical_failed || self.state == RunState::Failed {
            EXIT_BACKUP_FAILED
        } else if self.overall_status() == StageStatus::Success {
            EXIT_SUCCESS
        } else {
            EXIT_DEGRADED
        }
    }

    pub(crate) fn record(&mut self, result: StageResult) {
        self.stages.push(result);
    }

    pub(crate) fn finish(&mut self, state: RunState) {
        self.state = state;
        self.finished_at = Some(Utc::now());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn err(id: &str) -> ItemError {
        ItemError {
            identifier: id.to_string(),
            cause: "boom".to_string(),
        }
    }

    #[test]
    fn status_follows_failed_and_skipped_items() {
        assert_eq!(
            StageResult::from_items(Stage::Dump, 3, vec![], 0).status,
            StageStatus::Success
        );
        assert_eq!(
            StageResult::from_items(Stage::Dump, 3, vec![err("a")], 0).status,
            StageStatus::PartialFailure
        );
        assert_eq!(
            StageResult::from_items(Stage::Dump, 1, vec![], 2).status,
            StageStatus::PartialFailure
        );
        assert_eq!(
            StageResult::fatal(Stage::Archive, "nope").status,
            StageStatus::Failure
        );
    }

    #[test]
    fn failed_never_exceeds_processed() {
        let result = StageResult::from_items(Stage::Archive, 1, vec![err("a"), err("b")], 0);
        assert!(result.items_failed <= result.items_processed);
    }

    #[test]
    fn exit_code_separates_failed_from_degraded() {
        let date = NaiveDate::from_ymd_opt(2024, 5, 1).unwrap();

        let mut ok = BackupRun::new(date);
        ok.record(StageResult::from_items(Stage::Dump, 2, vec![], 0));
        ok.record(StageResult::from_items(Stage::Upload, 2, vec![], 0));
        ok.finish(RunState::Done);
        assert_eq!(ok.exit_code(), EXIT_SUCCESS);

        let mut degraded = BackupRun::new(date);
        degraded.record(StageResult::from_items(Stage::Dump, 2, vec![], 0));
        degraded.record(StageResult::fatal(Stage::Upload, "remote down"));
        degraded.finish(RunState::Done);
        assert_eq!(degraded.overall_status(), StageStatus::Failure);
        assert_eq!(degraded.exit_code(), EXIT_DEGRADED);

        let mut failed = BackupRun::new(date);
        failed.record(StageResult::fatal(Stage::Archive, "read-only fs"));
        failed.finish(RunState::Failed);
        assert_eq!(failed.exit_code(), EXIT_BACKUP_FAILED);
    }

    #[test]
    fn summary_lists_failing_identifiers() {
        let result = StageResult::from_items(Stage::Dump, 3, vec![err("billing")], 0);
        assert_eq!(
            result.summary(),
            "dump: partial failure (2 ok, 1 failed: billing)"
        );
    }
}
