// backuptool/src/remote/mod.rs
pub(crate) mod directory;
pub(crate) mod s3;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::path::Path;

use crate::errors::Result;

pub use directory::DirectoryTransfer;
pub use s3::S3Transfer;

/// One entry of a remote listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteItem {
    /// Full remote key. Directory markers end with `/`.
    pub path: String,
    pub modified: Option<DateTime<Utc>>,
}

/// The put/list/delete contract the pipeline needs from a remote store.
///
/// Every call addresses a single item; batching is the caller's business.
#[async_trait]
pub trait RemoteTransfer: Send + Sync {
    async fn put(&self, local_path: &Path, remote_path: &str) -> Result<()>;

    async fn list(&self, remote_prefix: &str, recursive: bool) -> Result<Vec<RemoteItem>>;

    /// Deletes a file, or a directory that has already been emptied.
    async fn delete(&self, remote_path: &str) -> Result<()>;

    /// Human-readable description for log lines.
    fn describe(&self) -> String;
}
