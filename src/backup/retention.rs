// backuptool/src/backup/retention.rs
use chrono::NaiveDate;
use regex::Regex;
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::{Arc, LazyLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::events::{EventSink, StageTally};
use super::paths::parse_date;
use super::run::{Stage, StageResult};
use crate::errors::Result;

static DATE_IN_NAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\d{4}-\d{2}-\d{2})").expect("static regex"));

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetentionPolicy {
    pub window_days: u32,
}

impl RetentionPolicy {
    pub fn new(window_days: u32) -> Self {
        RetentionPolicy { window_days }
    }

    /// Strictly older than the window: an item exactly `window_days` old is kept.
    pub fn is_expired(&self, artifact_date: NaiveDate, today: NaiveDate) -> bool {
        (today - artifact_date).num_days() > i64::from(self.window_days)
    }
}

/// A unit of retention: a dated directory with its members, or a single dated file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactSet {
    pub path: String,
    pub date: NaiveDate,
    pub is_dir: bool,
    pub members: Vec<String>,
}

/// Groups listed paths below `base` into dated artifact sets.
///
/// A path segment that is exactly `YYYY-MM-DD` makes everything beneath it one set.
/// Otherwise a file whose name contains a date is a set of its own. Paths ending in
/// `/` are directory markers and never become members. Undated paths are ignored.
pub fn collect_sets(base: &str, paths: &[String]) -> Vec<ArtifactSet> {
    let base = base.trim_end_matches('/');
    let mut sets: BTreeMap<String, ArtifactSet> = BTreeMap::new();

    for path in paths {
        let Some(rest) = path
            .strip_prefix(base)
            .and_then(|r| r.strip_prefix('/'))
            .filter(|r| !r.is_empty())
        else {
            continue;
        };
        let is_marker = rest.ends_with('/');
        let segments: Vec<&str> = rest.trim_end_matches('/').split('/').collect();

        let dated_dir = segments[..segments.len() - usize::from(!is_marker)]
            .iter()
            .position(|seg| parse_date(seg).is_some());
        if let Some(idx) = dated_dir {
            let dir = format!("{}/{}", base, segments[..=idx].join("/"));
            let Some(date) = parse_date(segments[idx]) else {
                continue;
            };
            let set = sets.entry(dir.clone()).or_insert_with(|| ArtifactSet {
                path: dir,
                date,
                is_dir: true,
                members: Vec::new(),
            });
            if !is_marker {
                set.members.push(path.clone());
            }
            continue;
        }

        if is_marker {
            continue;
        }
        let file_name = segments[segments.len() - 1];
        let date = DATE_IN_NAME
            .captures_iter(file_name)
            .find_map(|c| parse_date(&c[1]));
        if let Some(date) = date {
            sets.insert(
                path.clone(),
                ArtifactSet {
                    path: path.clone(),
                    date,
                    is_dir: false,
                    members: vec![path.clone()],
                },
            );
        }
    }

    sets.into_values().collect()
}

/// Deletes every expired set through `deleter`.
///
/// Deletion failures are recorded per set and never stop the remaining deletions.
/// Cancellation is observed before each deletion.
pub async fn prune<F, Fut>(
    stage: Stage,
    sets: Vec<ArtifactSet>,
    policy: RetentionPolicy,
    today: NaiveDate,
    cancel: &CancellationToken,
    sink: Arc<dyn EventSink>,
    deleter: F,
) -> StageResult
where
    F: Fn(ArtifactSet) -> Fut,
    Fut: Future<Output = Result<()>>,
{
    let (expired, retained): (Vec<_>, Vec<_>) = sets
        .into_iter()
        .partition(|set| policy.is_expired(set.date, today));
    debug!(stage = stage.as_str(), retained = retained.len(), "retention scan");

    let mut tally = StageTally::start(stage, expired.len(), sink);
    let mut remaining = expired.into_iter();
    let mut skipped = 0;
    while let Some(set) = remaining.next() {
        if cancel.is_cancelled() {
            skipped = 1 + remaining.len();
            break;
        }
        let path = set.path.clone();
        match deleter(set).await {
            Ok(()) => {
                info!(stage = stage.as_str(), %path, "pruned expired artifact");
                tally.succeeded(path);
            }
            Err(e) => tally.failed(path, e),
        }
    }
    tally.finish(skipped)
}
