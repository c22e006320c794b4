// backuptool/src/backup/paths.rs
use chrono::NaiveDate;
use std::path::{Path, PathBuf};

use crate::errors::{BackupError, Result};

pub const BACKUP_NAMESPACE: &str = "backup";
pub const DB_DIR: &str = "db";
pub const WWW_DIR: &str = "www";
pub const DATE_PLACEHOLDER: &str = "{date}";
const DATE_FORMAT: &str = "%Y-%m-%d";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArtifactKind {
    DatabaseDump,
    DirectoryArchive,
}

/// A produced artifact, addressed both by its namespace-relative path and its local location.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactPath {
    pub kind: ArtifactKind,
    pub date: NaiveDate,
    /// `/`-separated, starts with `backup/`.
    pub relative: String,
    pub local: PathBuf,
}

pub fn format_date(date: NaiveDate) -> String {
    date.format(DATE_FORMAT).to_string()
}

pub fn parse_date(s: &str) -> Option<NaiveDate> {
    if s.len() != 10 {
        return None;
    }
    NaiveDate::parse_from_str(s, DATE_FORMAT).ok()
}

/// Rejects names that could escape their directory.
pub fn validate_name(name: &str) -> Result<()> {
    if name.trim().is_empty()
        || name == "."
        || name == ".."
        || name.contains(['/', '\\', '\0'])
    {
        return Err(BackupError::InvalidName(name.to_string()));
    }
    Ok(())
}

/// Computes every storage location the pipeline writes to.
#[derive(Debug, Clone)]
pub struct PathNamer {
    local_root: PathBuf,
    remote_root: String,
    archive_file_name: String,
}

impl PathNamer {
    pub fn new(
        local_root: impl Into<PathBuf>,
        remote_root: &str,
        archive_file_name: &str,
    ) -> Result<Self> {
        validate_name(&archive_file_name.replace(DATE_PLACEHOLDER, ""))?;
        Ok(PathNamer {
            local_root: local_root.into(),
            remote_root: remote_root.trim_matches('/').to_string(),
            archive_file_name: archive_file_name.to_string(),
        })
    }

    pub fn local_root(&self) -> &Path {
        &self.local_root
    }

    /// `backup/db/<date>/<db>_<date>.sql`
    pub fn local_dump_path(&self, db_name: &str, date: NaiveDate) -> Result<ArtifactPath> {
        validate_name(db_name)?;
        let day = format_date(date);
        let relative = format!("{BACKUP_NAMESPACE}/{DB_DIR}/{day}/{db_name}_{day}.sql");
        Ok(self.artifact(ArtifactKind::DatabaseDump, date, relative))
    }

    /// Directory holding one day's dumps.
    pub fn local_dump_dir(&self, date: NaiveDate) -> PathBuf {
        self.local_root
            .join(BACKUP_NAMESPACE)
            .join(DB_DIR)
            .join(format_date(date))
    }

    /// `backup/www/<archive_file_name>` with `{date}` substituted.
    pub fn local_archive_path(&self, date: NaiveDate) -> ArtifactPath {
        let name = self
            .archive_file_name
            .replace(DATE_PLACEHOLDER, &format_date(date));
        let relative = format!("{BACKUP_NAMESPACE}/{WWW_DIR}/{name}");
        self.artifact(ArtifactKind::DirectoryArchive, date, relative)
    }

    /// Remote key mirroring `relative` under the remote root.
    ///
    /// A path that carries no date tag is placed in a `<date>/` directory next to its
    /// file name so that remote retention can age it.
    pub fn remote_path(&self, relative: &str, date: NaiveDate) -> Result<String> {
        let relative = relative.trim_start_matches('/');
        if relative.is_empty() || relative.split('/').any(|seg| seg == ".." || seg.is_empty()) {
            return Err(BackupError::InvalidName(relative.to_string()));
        }
        let day = format_date(date);
        let keyed = if relative.contains(&day) {
            relative.to_string()
        } else {
            match relative.rsplit_once('/') {
                Some((dir, file)) => format!("{dir}/{day}/{file}"),
                None => format!("{day}/{relative}"),
            }
        };
        Ok(self.remote_key(&keyed))
    }

    /// Prefix under which every remote artifact lives.
    pub fn remote_namespace(&self) -> String {
        self.remote_key(&format!("{BACKUP_NAMESPACE}/"))
    }

    fn remote_key(&self, relative: &str) -> String {
        if self.remote_root.is_empty() {
            relative.to_string()
        } else {
            format!("{}/{}", self.remote_root, relative)
        }
    }

    fn artifact(&self, kind: ArtifactKind, date: NaiveDate, relative: String) -> ArtifactPath {
        let local = relative
            .split('/')
            .fold(self.local_root.clone(), |acc, seg| acc.join(seg));
        ArtifactPath {
            kind,
            date,
            relative,
            local,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn day(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn namer() -> PathNamer {
        PathNamer::new("/srv/store", "offsite/", "backup.tar.gz").unwrap()
    }

    #[test]
    fn dump_path_is_deterministic_and_date_stamped() -> anyhow::Result<()> {
        let namer = namer();
        let a = namer.local_dump_path("billing", day(2024, 3, 9))?;
        let b = namer.local_dump_path("billing", day(2024, 3, 9))?;
        assert_eq!(a, b);
        assert_eq!(a.relative, "backup/db/2024-03-09/billing_2024-03-09.sql");
        assert_eq!(
            a.local,
            Path::new("/srv/store/backup/db/2024-03-09/billing_2024-03-09.sql")
        );
        assert_eq!(a.kind, ArtifactKind::DatabaseDump);
        Ok(())
    }

    #[test]
    fn distinct_databases_never_collide() -> anyhow::Result<()> {
        let namer = namer();
        let date = day(2024, 3, 9);
        let names = ["app", "app_2024", "billing", "app-2024", "App"];
        let mut paths: Vec<String> = names
            .iter()
            .map(|n| namer.local_dump_path(n, date).map(|p| p.relative))
            .collect::<Result<_>>()?;
        paths.sort();
        paths.dedup();
        assert_eq!(paths.len(), names.len());
        Ok(())
    }

    #[test]
    fn rejects_separators_and_empty_names() {
        let namer = namer();
        let date = day(2024, 3, 9);
        for bad in ["", "  ", "a/b", "a\\b", "..", "."] {
            assert!(
                matches!(namer.local_dump_path(bad, date), Err(BackupError::InvalidName(_))),
                "{bad:?} should be rejected"
            );
        }
    }

    #[test]
    fn archive_name_supports_date_placeholder() -> anyhow::Result<()> {
        let date = day(2024, 1, 2);
        let fixed = namer().local_archive_path(date);
        assert_eq!(fixed.relative, "backup/www/backup.tar.gz");

        let dated = PathNamer::new("/srv", "", "site_{date}.tar.gz")?.local_archive_path(date);
        assert_eq!(dated.relative, "backup/www/site_2024-01-02.tar.gz");
        assert!(PathNamer::new("/srv", "", "nested/{date}.tgz").is_err());
        Ok(())
    }

    #[test]
    fn remote_path_mirrors_local_tree() -> anyhow::Result<()> {
        let namer = namer();
        let date = day(2024, 3, 9);
        let dump = namer.local_dump_path("billing", date)?;
        assert_eq!(
            namer.remote_path(&dump.relative, date)?,
            "offsite/backup/db/2024-03-09/billing_2024-03-09.sql"
        );
        let archive = namer.local_archive_path(date);
        assert_eq!(
            namer.remote_path(&archive.relative, date)?,
            "offsite/backup/www/2024-03-09/backup.tar.gz"
        );
        assert_eq!(namer.remote_namespace(), "offsite/backup/");
        assert!(namer.remote_path("backup/../etc/passwd", date).is_err());
        Ok(())
    }

    #[test]
    fn parse_date_accepts_only_iso_days() {
        assert_eq!(parse_date("2024-02-29"), Some(day(2024, 2, 29)));
        assert_eq!(parse_date("2024-2-9"), None);
        assert_eq!(parse_date("www"), None);
    }
}
