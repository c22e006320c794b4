// backuptool/src/errors.rs
use chrono::NaiveDate;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum BackupError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Cannot reach database source: {0}")]
    Connection(String),

    #[error("Dump of database {db_name} failed (exit code {}): {stderr}", describe_exit(.exit_code))]
    DumpProcess {
        db_name: String,
        exit_code: Option<i32>,
        stderr: String,
    },

    #[error("Dump of database {db_name} timed out after {secs} seconds")]
    DumpTimeout { db_name: String, secs: u64 },

    #[error("Cannot open archive {}: {cause}", .path.display())]
    ArchiveOpen { path: PathBuf, cause: String },

    #[error("Source for archival is not a directory: {}", .0.display())]
    ArchiveSource(PathBuf),

    #[error("Transfer {operation} failed for {path}: {cause}")]
    Transfer {
        operation: &'static str,
        path: String,
        cause: String,
    },

    #[error("Invalid artifact name {0:?}")]
    InvalidName(String),

    #[error("A backup run for {0} is already in progress")]
    RunAlreadyInProgress(NaiveDate),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Operation cancelled: {0}")]
    Cancelled(String),
}

impl BackupError {
    pub(crate) fn transfer(
        operation: &'static str,
        path: impl Into<String>,
        cause: impl ToString,
    ) -> Self {
        BackupError::Transfer {
            operation,
            path: path.into(),
            cause: cause.to_string(),
        }
    }
}

fn describe_exit(code: &Option<i32>) -> String {
    match code {
        Some(code) => code.to_string(),
        None => "killed by signal".to_string(),
    }
}

pub type Result<T> = std::result::Result<T, BackupError>;
