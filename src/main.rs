//! Backup Tool
//!
//! Runs one backup of databases and web root, then applies retention.

// backuptool/src/main.rs
use anyhow::{Context, Result, bail};
use backuptool::backup::events::TracingSink;
use backuptool::backup::paths::parse_date;
use backuptool::backup::run::{BackupRun, EXIT_BACKUP_FAILED, StageStatus};
use backuptool::backup::run_backup_flow;
use backuptool::config::BackupConfig;
use chrono::{Local, NaiveDate};
use std::env;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::warn;
use tracing_subscriber::EnvFilter;

const DEFAULT_CONFIG_PATH: &str = "config.json";

struct CliArgs {
    config_path: PathBuf,
    run_date: NaiveDate,
}

/// Main entry point for the backup tool
#[tokio::main]
async fn main() -> ExitCode {
    dotenv::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    match run_app().await {
        Ok(run) => {
            print_summary(&run);
            ExitCode::from(run.exit_code())
        }
        Err(e) => {
            eprintln!("❌ Error: {:?}", e);
            ExitCode::from(EXIT_BACKUP_FAILED)
        }
    }
}

async fn run_app() -> Result<BackupRun> {
    let args = parse_args(env::args().skip(1))?;
    let config = BackupConfig::load_from_json(&args.config_path).context(format!(
        "Failed to load backup configuration from {}",
        args.config_path.display()
    ))?;

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, finishing in-flight work");
            on_signal.cancel();
        }
    });

    println!("🚀 Starting Backup Process for {}...", args.run_date);
    run_backup_flow(config, args.run_date, Arc::new(TracingSink), &cancel)
        .await
        .context("Backup process failed")
}

fn parse_args(mut args: impl Iterator<Item = String>) -> Result<CliArgs> {
    let mut config_path = None;
    let mut run_date = None;
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--date" => {
                let value = args.next().context("--date needs a value (YYYY-MM-DD)")?;
                run_date = Some(parse_date(&value).with_context(|| format!("Invalid --date value: {value}"))?);
            }
            flag if flag.starts_with("--") => bail!("Unknown option: {flag}"),
            path if config_path.is_none() => config_path = Some(PathBuf::from(path)),
            extra => bail!("Unexpected argument: {extra}"),
        }
    }
    Ok(CliArgs {
        config_path: config_path.unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH)),
        run_date: run_date.unwrap_or_else(|| Local::now().date_naive()),
    })
}

fn print_summary(run: &BackupRun) {
    println!("📋 Backup run for {}:", run.run_date);
    for stage in &run.stages {
        let marker = match stage.status {
            StageStatus::Success => "✅",
            StageStatus::PartialFailure => "⚠️",
            StageStatus::Failure => "❌",
        };
        println!("  {marker} {}", stage.summary());
        for err in &stage.errors {
            println!("      - {}: {}", err.identifier, err.cause);
        }
    }
    match run.overall_status() {
        StageStatus::Success => println!("✅ Backup completed successfully."),
        _ if run.exit_code() == EXIT_BACKUP_FAILED => eprintln!("❌ Backup was not taken."),
        _ => eprintln!("⚠️ Backup taken, but some steps did not complete."),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> impl Iterator<Item = String> {
        list.iter().map(|s| s.to_string()).collect::<Vec<_>>().into_iter()
    }

    #[test]
    fn defaults_to_config_json_and_today() -> Result<()> {
        let parsed = parse_args(args(&[]))?;
        assert_eq!(parsed.config_path, PathBuf::from(DEFAULT_CONFIG_PATH));
        assert_eq!(parsed.run_date, Local::now().date_naive());
        Ok(())
    }

    #[test]
    fn accepts_path_and_date_in_any_order() -> Result<()> {
        let parsed = parse_args(args(&["--date", "2024-02-29", "/etc/backup.json"]))?;
        assert_eq!(parsed.config_path, PathBuf::from("/etc/backup.json"));
        assert_eq!(parsed.run_date, NaiveDate::from_ymd_opt(2024, 2, 29).unwrap());
        Ok(())
    }

    #[test]
    fn rejects_bad_arguments() {
        assert!(parse_args(args(&["--date"])).is_err());
        assert!(parse_args(args(&["--date", "29.02.2024"])).is_err());
        assert!(parse_args(args(&["--verbose"])).is_err());
        assert!(parse_args(args(&["a.json", "b.json"])).is_err());
    }
}
