//! Sync jobs: records, options and the orchestrator that runs them.
//!
//! A job moves through
//!
//! ```text
//! QUEUED ──► RUNNING ──► SUCCEEDED
//!               │
//!               ├──► FAILED ◄── (retries exhausted or permanent error)
//!               │
//!               └──► RETRYING ──► RUNNING ...
//!                  (attempt failed transiently, `error` set, retry scheduled)
//!
//! QUEUED / RETRYING / RUNNING ──► CANCELLED
//! ```
//!
//! A failed attempt that will be retried is recorded directly as RETRYING,
//! with the failure in [`SyncJob::error`]; FAILED is only ever final.
//! Terminal states are sticky: once a record is SUCCEEDED, FAILED or
//! CANCELLED, neither [`SyncJob::transition`] nor the store will move it.
//!
//! Every live job carries a lease held by the orchestrator that owns its
//! key. The orchestrator refreshes its leases with a heartbeat; a job
//! whose lease lapses is considered interrupted and is failed by
//! [`SyncOrchestrator::recover_interrupted`] in any process.
//!
//! Records live in a [`JobStore`](crate::store::JobStore), so status and
//! progress are queryable by id from any process sharing the store.

mod orchestrator;
mod run;

pub use orchestrator::{PostProcessor, SyncOrchestrator, SyncOrchestratorBuilder};

use crate::error::{Error, ErrorCategory};
use crate::model::{AccountId, FetchFilter, JobId, OwnerId, SyncStats};
use crate::progress::{Phase, ProgressEvent};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle state of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobState {
    /// Waiting for a worker.
    Queued,
    /// A worker is executing an attempt.
    Running,
    /// Finished with stats.
    Succeeded,
    /// Finished with a failure reason.
    Failed,
    /// The last attempt failed with a transient error and another attempt
    /// is scheduled; [`SyncJob::error`] holds that failure.
    Retrying,
    /// Stopped on request.
    Cancelled,
}

impl JobState {
    /// Returns `true` for states a job never leaves.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobState::Succeeded | JobState::Failed | JobState::Cancelled
        )
    }

    /// Upper-case name as stored (`"RUNNING"`, ...).
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            JobState::Queued => "QUEUED",
            JobState::Running => "RUNNING",
            JobState::Succeeded => "SUCCEEDED",
            JobState::Failed => "FAILED",
            JobState::Retrying => "RETRYING",
            JobState::Cancelled => "CANCELLED",
        }
    }

    /// Parses a stored state name.
    ///
    /// # Errors
    ///
    /// Returns [`Error::CorruptRecord`] for unknown names.
    pub fn parse(text: &str) -> crate::Result<Self> {
        Ok(match text {
            "QUEUED" => JobState::Queued,
            "RUNNING" => JobState::Running,
            "SUCCEEDED" => JobState::Succeeded,
            "FAILED" => JobState::Failed,
            "RETRYING" => JobState::Retrying,
            "CANCELLED" => JobState::Cancelled,
            other => {
                return Err(Error::CorruptRecord {
                    message: format!("unknown job state '{other}'"),
                })
            }
        })
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which folders a job covers.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "mode", content = "folders")]
pub enum FolderSelection {
    /// Every selectable folder the server lists.
    #[default]
    All,
    /// Exactly these folders, in this order.
    Only(Vec<String>),
}

/// Per-job options supplied at submission.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncOptions {
    /// Folders to reconcile and fetch.
    pub folders: FolderSelection,
    /// Optional fetch filter; switches the delta to set-difference mode.
    pub filter: FetchFilter,
    /// Overrides the configured message cap for this job.
    pub message_cap: Option<usize>,
}

impl SyncOptions {
    /// Options covering only `folders`.
    #[must_use]
    pub fn folders<I, S>(folders: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            folders: FolderSelection::Only(folders.into_iter().map(Into::into).collect()),
            ..Self::default()
        }
    }

    /// Sets the fetch filter.
    #[must_use]
    pub fn with_filter(mut self, filter: FetchFilter) -> Self {
        self.filter = filter;
        self
    }

    /// Sets the per-job message cap.
    #[must_use]
    pub fn with_message_cap(mut self, cap: usize) -> Self {
        self.message_cap = Some(cap);
        self
    }
}

/// Why a job failed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobFailure {
    /// Error class.
    pub category: ErrorCategory,
    /// Error message (never contains key material).
    pub message: String,
    /// Whether the failure was eligible for retry.
    pub retryable: bool,
}

impl From<&Error> for JobFailure {
    fn from(error: &Error) -> Self {
        Self {
            category: error.category(),
            message: error.to_string(),
            retryable: error.is_retryable(),
        }
    }
}

/// One asynchronous execution of reconcile, delta and persist for an account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncJob {
    /// Job identifier.
    pub id: JobId,
    /// Submitting user.
    pub owner: OwnerId,
    /// Target account.
    pub account: AccountId,
    /// Lifecycle state.
    pub state: JobState,
    /// Current pipeline phase.
    pub phase: Phase,
    /// Latest progress event.
    pub progress: Option<ProgressEvent>,
    /// Submission options.
    pub options: SyncOptions,
    /// Attempts started so far.
    pub attempts: u32,
    /// Retries scheduled so far.
    pub retry_count: u32,
    /// Set once cancellation has been requested.
    pub cancel_requested: bool,
    /// Orchestrator instance holding the job's key and lease.
    #[serde(default)]
    pub worker: Option<String>,
    /// Stats of the successful attempt.
    pub stats: Option<SyncStats>,
    /// Reason for the last failure.
    pub error: Option<JobFailure>,
    /// Submission time.
    pub created_at: DateTime<Utc>,
    /// Start of the latest attempt.
    pub started_at: Option<DateTime<Utc>>,
    /// When the job reached a terminal state.
    pub finished_at: Option<DateTime<Utc>>,
    /// Last modification.
    pub updated_at: DateTime<Utc>,
}

impl SyncJob {
    /// Creates a queued job.
    #[must_use]
    pub fn queued(owner: OwnerId, account: AccountId, options: SyncOptions) -> Self {
        let now = Utc::now();
        Self {
            id: JobId::new(),
            owner,
            account,
            state: JobState::Queued,
            phase: Phase::Queued,
            progress: None,
            options,
            attempts: 0,
            retry_count: 0,
            cancel_requested: false,
            worker: None,
            stats: None,
            error: None,
            created_at: now,
            started_at: None,
            finished_at: None,
            updated_at: now,
        }
    }

    /// Moves the job to `state`, stamping the timestamps.
    ///
    /// Returns `false` and leaves the record untouched if the job is
    /// already terminal.
    pub fn transition(&mut self, state: JobState) -> bool {
        if self.state.is_terminal() {
            return false;
        }
        let now = Utc::now();
        self.state = state;
        self.updated_at = now;
        match state {
            JobState::Running => self.started_at = Some(now),
            s if s.is_terminal() => {
                self.finished_at = Some(now);
                self.phase = Phase::Done;
            }
            _ => {}
        }
        true
    }

    /// Snapshot for API consumers.
    #[must_use]
    pub fn status(&self) -> JobStatus {
        JobStatus {
            id: self.id,
            state: self.state,
            phase: self.phase,
            progress: self.progress.clone(),
            error: self.error.clone(),
            stats: self.stats.clone(),
            attempts: self.attempts,
            retry_count: self.retry_count,
            updated_at: self.updated_at,
        }
    }
}

/// What [`SyncOrchestrator::status`] reports.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobStatus {
    /// Job identifier.
    pub id: JobId,
    /// Lifecycle state.
    pub state: JobState,
    /// Current phase.
    pub phase: Phase,
    /// Latest progress event.
    pub progress: Option<ProgressEvent>,
    /// Failure reason, for failed jobs.
    pub error: Option<JobFailure>,
    /// Final stats, for succeeded jobs.
    pub stats: Option<SyncStats>,
    /// Attempts started.
    pub attempts: u32,
    /// Retries scheduled.
    pub retry_count: u32,
    /// Last modification.
    pub updated_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_names_roundtrip_through_storage_form() {
        for state in [
            JobState::Queued,
            JobState::Running,
            JobState::Succeeded,
            JobState::Failed,
            JobState::Retrying,
            JobState::Cancelled,
        ] {
            assert_eq!(JobState::parse(state.as_str()).unwrap(), state);
        }
        assert!(JobState::parse("PAUSED").is_err());
    }

    #[test]
    fn test_transition_stamps_times() {
        let mut job = SyncJob::queued("u1".into(), "a1".into(), SyncOptions::default());
        assert!(job.started_at.is_none());

        job.transition(JobState::Running);
        assert!(job.started_at.is_some());
        assert!(job.finished_at.is_none());

        assert!(job.transition(JobState::Succeeded));
        assert!(job.finished_at.is_some());
        assert_eq!(job.phase, Phase::Done);
        assert!(job.state.is_terminal());
    }

    #[test]
    fn test_terminal_state_is_sticky() {
        let mut job = SyncJob::queued("u1".into(), "a1".into(), SyncOptions::default());
        job.transition(JobState::Running);
        assert!(job.transition(JobState::Failed));
        let finished_at = job.finished_at;

        assert!(!job.transition(JobState::Succeeded));
        assert!(!job.transition(JobState::Retrying));
        assert_eq!(job.state, JobState::Failed);
        assert_eq!(job.finished_at, finished_at);
    }

    #[test]
    fn test_record_without_worker_still_loads() {
        let job = SyncJob::queued("u1".into(), "a1".into(), SyncOptions::default());
        let mut json = serde_json::to_value(&job).unwrap();
        json.as_object_mut().unwrap().remove("worker");
        let back: SyncJob = serde_json::from_value(json).unwrap();
        assert_eq!(back.worker, None);
    }

    #[test]
    fn test_options_serialization() {
        let options = SyncOptions::folders(["INBOX"]).with_filter(FetchFilter::unseen());
        let json = serde_json::to_value(&options).unwrap();
        assert_eq!(json["folders"]["mode"], "only");
        assert_eq!(json["filter"]["unseen_only"], true);
        let back: SyncOptions = serde_json::from_value(json).unwrap();
        assert_eq!(back, options);
    }
}
