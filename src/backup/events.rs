// backuptool/src/backup/events.rs
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, info, warn};

use super::run::{ItemError, Stage, StageResult, StageStatus};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StageEventKind {
    Started {
        total: Option<usize>,
    },
    ItemProgress {
        item: String,
        processed: usize,
        total: usize,
    },
    ItemFailed {
        item: String,
        cause: String,
    },
    Finished {
        status: StageStatus,
        processed: usize,
        failed: usize,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageEvent {
    pub stage: Stage,
    pub kind: StageEventKind,
}

/// Consumer of the pipeline's event stream. Rendering is entirely up to the sink.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: StageEvent);
}

/// Writes every event to the `tracing` subscriber.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn emit(&self, event: StageEvent) {
        let stage = event.stage.as_str();
        match event.kind {
            StageEventKind::Started { total } => info!(stage, ?total, "stage started"),
            StageEventKind::ItemProgress {
                item,
                processed,
                total,
            } => debug!(stage, %item, processed, total, "item done"),
            StageEventKind::ItemFailed { item, cause } => warn!(stage, %item, %cause, "item failed"),
            StageEventKind::Finished {
                status,
                processed,
                failed,
            } => info!(stage, %status, processed, failed, "stage finished"),
        }
    }
}

/// Forwards events to a channel so another task can render them.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: UnboundedSender<StageEvent>,
}

impl ChannelSink {
    pub fn new(tx: UnboundedSender<StageEvent>) -> Self {
        ChannelSink { tx }
    }
}

impl EventSink for ChannelSink {
    fn emit(&self, event: StageEvent) {
        // A closed receiver just means nobody is rendering anymore.
        let _ = self.tx.send(event);
    }
}

/// Accumulates per-item outcomes for one stage and mirrors them to the sink.
pub(crate) struct StageTally {
    stage: Stage,
    sink: Arc<dyn EventSink>,
    total: usize,
    processed: usize,
    errors: Vec<ItemError>,
}

impl StageTally {
    pub(crate) fn start(stage: Stage, total: usize, sink: Arc<dyn EventSink>) -> Self {
        sink.emit(StageEvent {
            stage,
            kind: StageEventKind::Started { total: Some(total) },
        });
        StageTally {
            stage,
            sink,
            total,
            processed: 0,
            errors: Vec::new(),
        }
    }

    pub(crate) fn succeeded(&mut self, item: impl Into<String>) {
        self.processed += 1;
        self.progress(item.into());
    }

    pub(crate) fn failed(&mut self, item: impl Into<String>, cause: impl ToString) {
        let item = item.into();
        let cause = cause.to_string();
        self.processed += 1;
        self.sink.emit(StageEvent {
            stage: self.stage,
            kind: StageEventKind::ItemFailed {
                item: item.clone(),
                cause: cause.clone(),
            },
        });
        self.errors.push(ItemError {
            identifier: item.clone(),
            cause,
        });
        self.progress(item);
    }

    fn progress(&self, item: String) {
        self.sink.emit(StageEvent {
            stage: self.stage,
            kind: StageEventKind::ItemProgress {
                item,
                processed: self.processed,
                total: self.total.max(self.processed),
            },
        });
    }

    /// Ends a stage that broke down after it started, keeping the per-item record.
    pub(crate) fn fail(self, cause: impl ToString) -> StageResult {
        let mut result = StageResult::from_items(self.stage, self.processed, self.errors, 0);
        result.status = StageStatus::Failure;
        result.fatal = Some(cause.to_string());
        emit_finished(self.sink.as_ref(), &result);
        result
    }

    pub(crate) fn finish(self, skipped: usize) -> StageResult {
        let result = StageResult::from_items(self.stage, self.processed, self.errors, skipped);
        emit_finished(self.sink.as_ref(), &result);
        result
    }
}

pub(crate) fn emit_finished(sink: &dyn EventSink, result: &StageResult) {
    sink.emit(StageEvent {
        stage: result.stage,
        kind: StageEventKind::Finished {
            status: result.status,
            processed: result.items_processed,
            failed: result.items_failed,
        },
    });
}

/// Reports a stage that could not begin.
pub(crate) fn stage_fatal(sink: &dyn EventSink, stage: Stage, cause: impl ToString) -> StageResult {
    sink.emit(StageEvent {
        stage,
        kind: StageEventKind::Started { total: None },
    });
    let result = StageResult::fatal(stage, cause);
    emit_finished(sink, &result);
    result
}
