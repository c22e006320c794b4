// backuptool/src/backup/archive.rs
use flate2::Compression;
use flate2::write::GzEncoder;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::UNIX_EPOCH;
use tar::{Builder, EntryType, Header};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use super::events::{EventSink, StageTally};
use super::run::{Stage, StageResult};
use crate::errors::{BackupError, Result};
use crate::utils::pool::run_bounded;

/// Files up to this size are read by the worker pool; larger ones are streamed by the writer.
pub const DEFAULT_STAGE_LIMIT: u64 = 8 * 1024 * 1024;

/// A regular file found by the pre-pass walk.
#[derive(Debug, Clone)]
struct SourceFile {
    path: PathBuf,
    name: String,
}

/// A file made ready for the single archive writer.
enum Staged {
    Bytes {
        name: String,
        data: Vec<u8>,
        mode: u32,
        mtime: u64,
    },
    Path {
        name: String,
        path: PathBuf,
    },
    Failed {
        name: String,
        cause: String,
    },
}

/// Archives a directory tree into one gzipped tar file.
#[derive(Debug, Clone)]
pub struct TreeArchiver {
    pool_size: usize,
    stage_limit: u64,
}

impl TreeArchiver {
    pub fn new(pool_size: usize) -> Self {
        TreeArchiver {
            pool_size: pool_size.max(1),
            stage_limit: DEFAULT_STAGE_LIMIT,
        }
    }

    pub fn with_stage_limit(mut self, bytes: u64) -> Self {
        self.stage_limit = bytes;
        self
    }

    /// Creates a GZipped TAR archive of every regular file below `source_root`.
    ///
    /// Entry names are relative to `source_root` and always `/`-separated. Directories
    /// are not stored and symlinks are skipped without being followed. The archive is
    /// written to `<destination>.partial`, opened before the walk starts; if that fails
    /// nothing is walked and `ArchiveOpen` is returned. Per-file problems end up in the
    /// stage result.
    ///
    /// The staged file replaces `destination` only when every file was attempted and
    /// the archive was finalized. A cancelled or failed attempt leaves any previous
    /// archive at `destination` untouched and reports `items_skipped > 0` or `Failure`.
    pub async fn archive(
        &self,
        source_root: &Path,
        destination: &Path,
        cancel: &CancellationToken,
        sink: Arc<dyn EventSink>,
    ) -> Result<StageResult> {
        if cancel.is_cancelled() {
            info!(destination = %destination.display(), "cancelled before archiving, keeping previous archive");
            return Ok(StageTally::start(Stage::Archive, 0, sink).finish(1));
        }
        if !tokio::fs::metadata(source_root)
            .await
            .map(|m| m.is_dir())
            .unwrap_or(false)
        {
            return Err(BackupError::ArchiveSource(source_root.to_path_buf()));
        }

        let staging = staging_path(destination);
        let archive_file = open_destination(destination, &staging).await?;
        info!(
            source = %source_root.display(),
            destination = %destination.display(),
            "creating tar.gz archive"
        );

        let root = source_root.to_path_buf();
        let mut own_files = Vec::new();
        for path in [staging.as_path(), destination] {
            if let Ok(canonical) = tokio::fs::canonicalize(path).await {
                own_files.push(canonical);
            }
        }
        let (files, walk_errors) = tokio::task::spawn_blocking(move || discover(&root, &own_files))
            .await
            .map_err(|e| BackupError::Io(std::io::Error::other(e)))?;
        debug!(files = files.len(), "pre-pass walk complete");

        let mut tally = StageTally::start(Stage::Archive, files.len() + walk_errors.len(), sink);
        for (item, cause) in walk_errors {
            tally.failed(item, cause);
        }

        let (tx, rx) = mpsc::channel::<Staged>(self.pool_size);
        let dest = destination.to_path_buf();
        let writer = tokio::task::spawn_blocking(move || write_archive(archive_file, rx, tally, dest));

        let stage_limit = self.stage_limit;
        let outcome = run_bounded(files, self.pool_size, cancel, |file: SourceFile| {
            let tx = tx.clone();
            async move {
                let staged = stage_file(file, stage_limit).await;
                // The writer only hangs up after a fatal error it reports itself.
                let _ = tx.send(staged).await;
            }
        })
        .await;
        drop(tx);

        let (tally, finished) = writer
            .await
            .map_err(|e| BackupError::Io(std::io::Error::other(e)))?;
        if let Err(e) = finished {
            discard(&staging).await;
            return Ok(tally.fail(e));
        }

        let skipped = outcome.skipped.len() + outcome.panicked;
        if skipped > 0 {
            discard(&staging).await;
            warn!(
                destination = %destination.display(),
                skipped,
                "archive incomplete, keeping previous archive"
            );
            return Ok(tally.finish(skipped));
        }

        if let Err(e) = tokio::fs::rename(&staging, destination).await {
            discard(&staging).await;
            return Ok(tally.fail(BackupError::ArchiveOpen {
                path: destination.to_path_buf(),
                cause: format!("failed to move staged archive into place: {e}"),
            }));
        }

        let result = tally.finish(0);
        info!(
            destination = %destination.display(),
            entries = result.items_succeeded(),
            failed = result.items_failed,
            "✓ Tar.gz archive written"
        );
        Ok(result)
    }
}

/// `<destination>.partial`, next to the destination so the final rename stays on one filesystem.
fn staging_path(destination: &Path) -> PathBuf {
    let mut name = destination
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".partial");
    destination.with_file_name(name)
}

async fn open_destination(destination: &Path, staging: &Path) -> Result<File> {
    let open_err = |e: std::io::Error| BackupError::ArchiveOpen {
        path: destination.to_path_buf(),
        cause: e.to_string(),
    };
    if let Some(parent) = destination.parent() {
        tokio::fs::create_dir_all(parent).await.map_err(open_err)?;
    }
    let file = tokio::fs::File::create(staging).await.map_err(open_err)?;
    Ok(file.into_std().await)
}

async fn discard(staging: &Path) {
    if let Err(e) = tokio::fs::remove_file(staging).await {
        warn!(path = %staging.display(), error = %e, "failed to remove staged archive");
    }
}

/// Walks `root` without following links, returning regular files and walk errors.
/// `skip` holds the canonical paths of our own archive files, in case they lie inside `root`.
fn discover(root: &Path, skip: &[PathBuf]) -> (Vec<SourceFile>, Vec<(String, String)>) {
    let mut files = Vec::new();
    let mut errors = Vec::new();
    for entry in WalkDir::new(root).follow_links(false).min_depth(1) {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                let item = e
                    .path()
                    .map(|p| entry_name(root, p))
                    .unwrap_or_else(|| root.display().to_string());
                errors.push((item, e.to_string()));
                continue;
            }
        };
        let file_type = entry.file_type();
        if file_type.is_symlink() {
            debug!(path = %entry.path().display(), "skipping symlink");
        } else if file_type.is_file() {
            if skip.iter().any(|own| {
                own.file_name() == Some(entry.file_name())
                    && std::fs::canonicalize(entry.path()).is_ok_and(|p| p == *own)
            }) {
                continue;
            }
            files.push(SourceFile {
                name: entry_name(root, entry.path()),
                path: entry.into_path(),
            });
        }
    }
    (files, errors)
}

/// Root-relative name joined with `/` regardless of platform.
fn entry_name(root: &Path, path: &Path) -> String {
    let relative = path.strip_prefix(root).unwrap_or(path);
    relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect::<Vec<_>>()
        .join("/")
}

async fn stage_file(file: SourceFile, stage_limit: u64) -> Staged {
    let metadata = match tokio::fs::symlink_metadata(&file.path).await {
        Ok(m) => m,
        Err(e) => {
            return Staged::Failed {
                name: file.name,
                cause: e.to_string(),
            };
        }
    };
    if !metadata.is_file() {
        return Staged::Failed {
            name: file.name,
            cause: "no longer a regular file".to_string(),
        };
    }
    if metadata.len() > stage_limit {
        return Staged::Path {
            name: file.name,
            path: file.path,
        };
    }
    match tokio::fs::read(&file.path).await {
        Ok(data) => Staged::Bytes {
            name: file.name,
            data,
            mode: file_mode(&metadata),
            mtime: metadata
                .modified()
                .ok()
                .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
                .map(|d| d.as_secs())
                .unwrap_or(0),
        },
        Err(e) => Staged::Failed {
            name: file.name,
            cause: e.to_string(),
        },
    }
}

#[cfg(unix)]
fn file_mode(metadata: &std::fs::Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    metadata.permissions().mode() & 0o7777
}

#[cfg(not(unix))]
fn file_mode(_metadata: &std::fs::Metadata) -> u32 {
    0o644
}

/// Owns the archive handle; every append goes through here.
fn write_archive(
    archive_file: File,
    mut rx: mpsc::Receiver<Staged>,
    mut tally: StageTally,
    destination: PathBuf,
) -> (StageTally, Result<()>) {
    let encoder = GzEncoder::new(archive_file, Compression::default());
    let mut builder = Builder::new(encoder);
    builder.follow_symlinks(false);

    while let Some(staged) = rx.blocking_recv() {
        match staged {
            Staged::Bytes {
                name,
                data,
                mode,
                mtime,
            } => {
                let mut header = Header::new_gnu();
                header.set_entry_type(EntryType::Regular);
                header.set_size(data.len() as u64);
                header.set_mode(mode);
                header.set_mtime(mtime);
                match builder.append_data(&mut header, &name, data.as_slice()) {
                    Ok(()) => tally.succeeded(name),
                    Err(e) => tally.failed(name, e),
                }
            }
            Staged::Path { name, path } => match builder.append_path_with_name(&path, &name) {
                Ok(()) => tally.succeeded(name),
                Err(e) => tally.failed(name, e),
            },
            Staged::Failed { name, cause } => tally.failed(name, cause),
        }
    }

    let finished = finish_archive(builder, &destination);
    (tally, finished)
}

fn finish_archive(builder: Builder<GzEncoder<File>>, destination: &Path) -> Result<()> {
    let finish_err = |e: std::io::Error| BackupError::ArchiveOpen {
        path: destination.to_path_buf(),
        cause: format!("failed to finalize archive: {e}"),
    };
    let encoder = builder.into_inner().map_err(finish_err)?;
    let file = encoder.finish().map_err(finish_err)?;
    file.sync_all().map_err(finish_err)?;
    Ok(())
}
