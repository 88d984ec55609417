//! Structured progress reporting.
//!
//! Every event carries a [`Phase`], a human-readable message and optional
//! numeric fields. The job layer persists events so they can be queried by
//! job id whether or not the job is still running.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Mutex;

/// Pipeline phase an event belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    /// Waiting in the queue.
    Queued,
    /// Ownership and key checks.
    Prepare,
    /// Mirror reconciliation.
    StateSync,
    /// Delta computation and message persistence.
    Fetch,
    /// Downstream callback.
    PostProcess,
    /// Terminal.
    Done,
}

impl Phase {
    /// Wire name of the phase (`"state_sync"`, `"fetch"`, ...).
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Phase::Queued => "queued",
            Phase::Prepare => "prepare",
            Phase::StateSync => "state_sync",
            Phase::Fetch => "fetch",
            Phase::PostProcess => "post_process",
            Phase::Done => "done",
        }
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One structured progress event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressEvent {
    /// Phase the event was emitted in.
    pub phase: Phase,
    /// Human-readable description.
    pub message: String,
    /// Folder being processed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub folder: Option<String>,
    /// 1-based index of the folder in this pass.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub folder_index: Option<u32>,
    /// Number of folders in this pass.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub folder_total: Option<u32>,
    /// Messages in the folder.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_count: Option<u64>,
    /// Items processed so far.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub processed: Option<u64>,
    /// Items expected in total.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total: Option<u64>,
    /// When the event was emitted.
    pub at: DateTime<Utc>,
}

impl ProgressEvent {
    /// Creates an event with no numeric fields.
    #[must_use]
    pub fn new(phase: Phase, message: impl Into<String>) -> Self {
        Self {
            phase,
            message: message.into(),
            folder: None,
            folder_index: None,
            folder_total: None,
            message_count: None,
            processed: None,
            total: None,
            at: Utc::now(),
        }
    }

    /// Attaches the folder name.
    #[must_use]
    pub fn folder(mut self, folder: &str) -> Self {
        self.folder = Some(folder.to_string());
        self
    }

    /// Attaches the folder position (1-based) within the pass.
    #[must_use]
    pub fn folder_position(mut self, index: usize, total: usize) -> Self {
        self.folder_index = u32::try_from(index + 1).ok();
        self.folder_total = u32::try_from(total).ok();
        self
    }

    /// Attaches the folder's message count.
    #[must_use]
    pub fn message_count(mut self, count: usize) -> Self {
        self.message_count = Some(count as u64);
        self
    }

    /// Attaches processed/total counters.
    #[must_use]
    pub fn counts(mut self, processed: usize, total: usize) -> Self {
        self.processed = Some(processed as u64);
        self.total = Some(total as u64);
        self
    }
}

/// Receives progress events from the pipeline stages.
#[async_trait]
pub trait ProgressSink: Send + Sync {
    /// Records one event. Sinks must not fail the pipeline.
    async fn emit(&self, event: ProgressEvent);
}

/// Discards every event.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullSink;

#[async_trait]
impl ProgressSink for NullSink {
    async fn emit(&self, _event: ProgressEvent) {}
}

/// Keeps every event in memory.
#[derive(Debug, Default)]
pub struct CollectingSink {
    events: Mutex<Vec<ProgressEvent>>,
}

impl CollectingSink {
    /// Creates an empty sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a copy of the recorded events.
    #[must_use]
    pub fn events(&self) -> Vec<ProgressEvent> {
        self.events
            .lock()
            .map(|events| events.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl ProgressSink for CollectingSink {
    async fn emit(&self, event: ProgressEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event);
        }
    }
}
