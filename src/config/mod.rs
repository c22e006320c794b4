// backuptool/src/config/mod.rs
use chrono::Duration as DateDuration;
use serde::Deserialize;
use std::collections::HashSet;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::warn;

use crate::backup::paths::{DATE_PLACEHOLDER, validate_name};
use crate::backup::retention::RetentionPolicy;
use crate::errors::{BackupError, Result};

pub const DEFAULT_ARCHIVE_FILE_NAME: &str = "backup.tar.gz";
pub const DEFAULT_DUMP_PROGRAM: &str = "pg_dump";
pub const DEFAULT_DUMP_TIMEOUT_SECS: u64 = 3600;
pub const DEFAULT_WINDOW_DAYS: u32 = 7;
pub const DEFAULT_WORKER_POOL_SIZE: usize = 4;
pub const DEFAULT_STALE_LOCK_HOURS: u32 = 24;

const ENV_SOURCE_URL: &str = "SOURCE_DATABASE_URL";
const ENV_S3_KEY_ID: &str = "BACKUP_S3_ACCESS_KEY_ID";
const ENV_S3_SECRET: &str = "BACKUP_S3_SECRET_ACCESS_KEY";

fn default_exclude() -> Vec<String> {
    ["postgres", "template0", "template1"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn default_dump_args() -> Vec<String> {
    ["--no-owner", "--no-acl", "--dbname={url}"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

// Structs for deserializing config.json
#[derive(Debug, Clone, Default, Deserialize)]
pub struct JsonDatabaseConfig {
    pub url: Option<String>,
    pub include: Option<Vec<String>>,
    pub exclude: Option<Vec<String>>,
    pub dump_program: Option<String>,
    pub dump_args: Option<Vec<String>>,
    pub dump_timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct JsonRetentionConfig {
    pub window_days: Option<u32>,
    pub local_window_days: Option<u32>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum JsonRemoteConfig {
    S3 {
        bucket_name: Option<String>,
        region: Option<String>,
        access_key_id: Option<String>,
        secret_access_key: Option<String>,
        endpoint_url: Option<String>,
        #[serde(default)]
        force_path_style: bool,
        root: Option<String>,
    },
    Directory {
        path: Option<PathBuf>,
        root: Option<String>,
    },
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawJsonConfig {
    pub local_root: Option<PathBuf>,
    pub source_directory: Option<PathBuf>,
    pub archive_file_name: Option<String>,
    #[serde(default)]
    pub database: JsonDatabaseConfig,
    #[serde(default)]
    pub retention: JsonRetentionConfig,
    pub worker_pool_size: Option<usize>,
    pub run_timeout_secs: Option<u64>,
    pub stale_lock_hours: Option<u32>,
    pub remote: Option<JsonRemoteConfig>,
}

// Application's internal configuration structs
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub url: Option<String>,
    pub include: Option<Vec<String>>,
    pub exclude: HashSet<String>,
    pub dump_program: String,
    pub dump_args: Vec<String>,
    pub dump_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct S3Config {
    pub endpoint_url: Option<String>,
    pub region: String,
    pub access_key_id: String,
    pub secret_access_key: String,
    pub bucket_name: String,
    pub force_path_style: bool,
}

#[derive(Debug, Clone)]
pub enum RemoteBackend {
    S3(S3Config),
    Directory(PathBuf),
}

#[derive(Debug, Clone)]
pub struct RemoteConfig {
    pub backend: RemoteBackend,
    /// Prefix every remote key starts with; may be empty.
    pub root: String,
}

#[derive(Debug, Clone)]
pub struct BackupConfig {
    pub local_root: PathBuf,
    pub source_directory: PathBuf,
    pub archive_file_name: String,
    pub database: DatabaseConfig,
    pub retention: RetentionPolicy,
    pub local_retention: RetentionPolicy,
    pub worker_pool_size: usize,
    pub run_timeout: Option<Duration>,
    pub stale_lock_after: DateDuration,
    pub remote: Option<RemoteConfig>,
}

/// Values that may come from the environment instead of the file.
#[derive(Debug, Clone, Default)]
pub struct EnvOverrides {
    pub source_database_url: Option<String>,
    pub s3_access_key_id: Option<String>,
    pub s3_secret_access_key: Option<String>,
}

impl EnvOverrides {
    pub fn from_env() -> Self {
        let read = |key: &str| env::var(key).ok().filter(|v| !v.trim().is_empty());
        EnvOverrides {
            source_database_url: read(ENV_SOURCE_URL),
            s3_access_key_id: read(ENV_S3_KEY_ID),
            s3_secret_access_key: read(ENV_S3_SECRET),
        }
    }
}

impl BackupConfig {
    pub fn load_from_json(config_path: &Path) -> Result<Self> {
        let config_content = fs::read_to_string(config_path).map_err(|e| {
            BackupError::Config(format!(
                "Failed to read config file at {}: {e}",
                config_path.display()
            ))
        })?;
        let raw: RawJsonConfig = serde_json::from_str(&config_content).map_err(|e| {
            BackupError::Config(format!(
                "Failed to parse JSON from config file at {}: {e}",
                config_path.display()
            ))
        })?;
        Self::from_raw(raw, &EnvOverrides::from_env())
    }

    pub fn from_raw(raw: RawJsonConfig, overrides: &EnvOverrides) -> Result<Self> {
        let local_root = required_path(raw.local_root, "local_root")?;
        let source_directory = required_path(raw.source_directory, "source_directory")?;

        let archive_file_name = raw
            .archive_file_name
            .filter(|s| !s.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_ARCHIVE_FILE_NAME.to_string());
        validate_name(&archive_file_name.replace(DATE_PLACEHOLDER, "x"))
            .map_err(|_| config_err(format!("archive_file_name {archive_file_name:?} must be a plain file name")))?;

        let database = load_database_config(raw.database, overrides)?;

        let window_days = raw.retention.window_days.unwrap_or(DEFAULT_WINDOW_DAYS);
        let local_window_days = raw.retention.local_window_days.unwrap_or(window_days);

        let worker_pool_size = raw.worker_pool_size.unwrap_or(DEFAULT_WORKER_POOL_SIZE);
        if worker_pool_size == 0 {
            return Err(config_err("worker_pool_size must be at least 1"));
        }
        if raw.run_timeout_secs == Some(0) {
            return Err(config_err("run_timeout_secs must be positive when set"));
        }

        let remote = raw
            .remote
            .map(|r| load_remote_config(r, overrides))
            .transpose()?;

        Ok(BackupConfig {
            local_root,
            source_directory,
            archive_file_name,
            database,
            retention: RetentionPolicy::new(window_days),
            local_retention: RetentionPolicy::new(local_window_days),
            worker_pool_size,
            run_timeout: raw.run_timeout_secs.map(Duration::from_secs),
            stale_lock_after: DateDuration::hours(i64::from(
                raw.stale_lock_hours.unwrap_or(DEFAULT_STALE_LOCK_HOURS),
            )),
            remote,
        })
    }

    pub fn remote_root(&self) -> &str {
        self.remote.as_ref().map(|r| r.root.as_str()).unwrap_or("")
    }
}

fn config_err(msg: impl Into<String>) -> BackupError {
    BackupError::Config(msg.into())
}

fn required_path(value: Option<PathBuf>, key: &str) -> Result<PathBuf> {
    match value {
        Some(p) if !p.as_os_str().is_empty() => Ok(p),
        _ => Err(config_err(format!("{key} must be set in config.json"))),
    }
}

fn load_database_config(raw: JsonDatabaseConfig, overrides: &EnvOverrides) -> Result<DatabaseConfig> {
    let url = overrides
        .source_database_url
        .clone()
        .or(raw.url)
        .filter(|u| !u.trim().is_empty());

    let include = raw.include.filter(|list| !list.is_empty());
    if let Some(list) = &include {
        if let Some(bad) = list.iter().find(|n| validate_name(n).is_err()) {
            return Err(config_err(format!("Invalid database name in database.include: {bad:?}")));
        }
    }
    if include.is_none() && url.is_none() {
        return Err(config_err(
            "database.url (or SOURCE_DATABASE_URL) must be set when database.include is not given",
        ));
    }

    let dump_args = raw.dump_args.unwrap_or_else(default_dump_args);
    if url.is_none() && dump_args.iter().any(|a| a.contains("{url}")) {
        return Err(config_err("database.dump_args use {url} but database.url is not set"));
    }

    let dump_timeout_secs = raw.dump_timeout_secs.unwrap_or(DEFAULT_DUMP_TIMEOUT_SECS);
    if dump_timeout_secs == 0 {
        return Err(config_err("database.dump_timeout_secs must be positive"));
    }

    Ok(DatabaseConfig {
        url,
        include,
        exclude: raw.exclude.unwrap_or_else(default_exclude).into_iter().collect(),
        dump_program: raw
            .dump_program
            .filter(|p| !p.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_DUMP_PROGRAM.to_string()),
        dump_args,
        dump_timeout: Duration::from_secs(dump_timeout_secs),
    })
}

fn load_remote_config(raw: JsonRemoteConfig, overrides: &EnvOverrides) -> Result<RemoteConfig> {
    let non_empty = |v: Option<String>| v.filter(|s| !s.trim().is_empty());
    match raw {
        JsonRemoteConfig::S3 {
            bucket_name,
            region,
            access_key_id,
            secret_access_key,
            endpoint_url,
            force_path_style,
            root,
        } => {
            let access_key_id = overrides.s3_access_key_id.clone().or(non_empty(access_key_id));
            let secret_access_key = overrides
                .s3_secret_access_key
                .clone()
                .or(non_empty(secret_access_key));
            match (non_empty(bucket_name), non_empty(region), access_key_id, secret_access_key) {
                (Some(bucket_name), Some(region), Some(access_key_id), Some(secret_access_key)) => {
                    Ok(RemoteConfig {
                        backend: RemoteBackend::S3(S3Config {
                            endpoint_url: non_empty(endpoint_url),
                            region,
                            access_key_id,
                            secret_access_key,
                            bucket_name,
                            force_path_style,
                        }),
                        root: normalize_root(root),
                    })
                }
                _ => Err(config_err(
                    "remote s3 configuration requires bucket_name, region, access_key_id and secret_access_key",
                )),
            }
        }
        JsonRemoteConfig::Directory { path, root } => {
            let path = required_path(path, "remote.path")?;
            if !path.is_dir() {
                warn!(path = %path.display(), "remote directory does not exist yet; it will be created on first upload");
            }
            Ok(RemoteConfig {
                backend: RemoteBackend::Directory(path),
                root: normalize_root(root),
            })
        }
    }
}

fn normalize_root(root: Option<String>) -> String {
    root.map(|r| r.trim().trim_matches('/').to_string())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn parse(value: serde_json::Value) -> Result<BackupConfig> {
        let raw: RawJsonConfig = serde_json::from_value(value).expect("raw config");
        BackupConfig::from_raw(raw, &EnvOverrides::default())
    }

    #[test]
    fn minimal_config_gets_defaults() -> anyhow::Result<()> {
        let config = parse(json!({
            "local_root": "/srv/storage",
            "source_directory": "/var/www/app",
            "database": { "url": "postgres://backup@db:5432/postgres" }
        }))?;
        assert_eq!(config.archive_file_name, DEFAULT_ARCHIVE_FILE_NAME);
        assert_eq!(config.retention.window_days, 7);
        assert_eq!(config.local_retention.window_days, 7);
        assert_eq!(config.worker_pool_size, 4);
        assert_eq!(config.database.dump_program, "pg_dump");
        assert_eq!(config.database.dump_timeout, Duration::from_secs(3600));
        assert!(config.database.exclude.contains("template0"));
        assert!(config.remote.is_none());
        assert_eq!(config.remote_root(), "");
        Ok(())
    }

    #[test]
    fn full_config_with_s3_remote() -> anyhow::Result<()> {
        let config = parse(json!({
            "local_root": "/srv/storage",
            "source_directory": "/var/www/app",
            "archive_file_name": "site_{date}.tar.gz",
            "database": {
                "include": ["app", "crm"],
                "exclude": ["crm"],
                "dump_program": "mysqldump",
                "dump_args": ["-u", "root", "{database}"],
                "dump_timeout_secs": 60
            },
            "retention": { "window_days": 14, "local_window_days": 3 },
            "worker_pool_size": 8,
            "run_timeout_secs": 7200,
            "remote": {
                "kind": "s3",
                "bucket_name": "backups",
                "region": "fra1",
                "access_key_id": "AKIA",
                "secret_access_key": "shh",
                "endpoint_url": "https://fra1.digitaloceanspaces.com",
                "root": "/nightly/"
            }
        }))?;
        assert_eq!(config.database.include.as_deref(), Some(&["app".to_string(), "crm".to_string()][..]));
        assert_eq!(config.retention.window_days, 14);
        assert_eq!(config.local_retention.window_days, 3);
        assert_eq!(config.run_timeout, Some(Duration::from_secs(7200)));
        assert_eq!(config.remote_root(), "nightly");
        match &config.remote.as_ref().unwrap().backend {
            RemoteBackend::S3(s3) => {
                assert_eq!(s3.bucket_name, "backups");
                assert_eq!(s3.endpoint_url.as_deref(), Some("https://fra1.digitaloceanspaces.com"));
            }
            other => panic!("unexpected backend {other:?}"),
        }
        Ok(())
    }

    #[test]
    fn env_overrides_win_over_file() -> anyhow::Result<()> {
        let raw: RawJsonConfig = serde_json::from_value(json!({
            "local_root": "/srv",
            "source_directory": "/www",
            "database": { "url": "postgres://file@db/postgres" },
            "remote": { "kind": "s3", "bucket_name": "b", "region": "r" }
        }))?;
        let overrides = EnvOverrides {
            source_database_url: Some("postgres://env@db/postgres".to_string()),
            s3_access_key_id: Some("id".to_string()),
            s3_secret_access_key: Some("secret".to_string()),
        };
        let config = BackupConfig::from_raw(raw, &overrides)?;
        assert_eq!(config.database.url.as_deref(), Some("postgres://env@db/postgres"));
        assert!(matches!(config.remote.unwrap().backend, RemoteBackend::S3(_)));
        Ok(())
    }

    #[test]
    fn rejects_invalid_configs() {
        let base = || {
            json!({
                "local_root": "/srv",
                "source_directory": "/www",
                "database": { "url": "postgres://u@db/postgres" }
            })
        };

        let mut missing_root = base();
        missing_root.as_object_mut().unwrap().remove("local_root");
        assert!(matches!(parse(missing_root), Err(BackupError::Config(_))));

        let mut zero_pool = base();
        zero_pool["worker_pool_size"] = json!(0);
        assert!(parse(zero_pool).is_err());

        let mut bad_archive = base();
        bad_archive["archive_file_name"] = json!("../escape.tar.gz");
        assert!(parse(bad_archive).is_err());

        let mut incomplete_s3 = base();
        incomplete_s3["remote"] = json!({ "kind": "s3", "bucket_name": "b" });
        assert!(parse(incomplete_s3).is_err());

        let mut no_url = base();
        no_url["database"] = json!({});
        assert!(parse(no_url).is_err());

        let mut url_arg_without_url = base();
        url_arg_without_url["database"] = json!({ "include": ["app"] });
        assert!(parse(url_arg_without_url).is_err(), "default args need {{url}}");

        let mut bad_include = base();
        bad_include["database"]["include"] = json!(["ok", "a/b"]);
        assert!(parse(bad_include).is_err());
    }

    #[test]
    fn directory_remote_normalizes_root() -> anyhow::Result<()> {
        let config = parse(json!({
            "local_root": "/srv",
            "source_directory": "/www",
            "database": { "include": ["app"], "dump_args": ["{database}"] },
            "remote": { "kind": "directory", "path": "/mnt/nas", "root": "host-a/" }
        }))?;
        let remote = config.remote.unwrap();
        assert_eq!(remote.root, "host-a");
        assert!(matches!(remote.backend, RemoteBackend::Directory(ref p) if p == Path::new("/mnt/nas")));
        Ok(())
    }

    #[test]
    fn load_from_json_reports_missing_file() {
        let result = BackupConfig::load_from_json(Path::new("/definitely/not/here/config.json"));
        assert!(matches!(result, Err(BackupError::Config(msg)) if msg.contains("Failed to read config file")));
    }
}
