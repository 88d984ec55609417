//! Persistence seams.
//!
//! The pipeline reads and writes through four traits. Every mirror and
//! message query takes a [`Scope`] (owner + account), so one tenant can never
//! address another tenant's rows.
//!
//! - [`AccountStore`]: ownership lookups
//! - [`MirrorStore`]: per-folder envelope mirror, replaced wholesale
//! - [`MessageStore`]: encrypted messages and where they were fetched from
//! - [`JobStore`]: job records, leases and progress history
//!
//! [`MemoryStore`] and [`SqliteStore`] implement all four.

mod memory;
mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

use crate::error::Result;
use crate::job::SyncJob;
use crate::model::{
    Account, AccountId, DedupKey, FolderStateRecord, JobId, MessageFlags, OwnerId, RawMessage,
    Scope, Uid,
};
use crate::progress::ProgressEvent;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::BTreeSet;

/// Result of inserting a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    /// A new row was written.
    Inserted,
    /// A row with the same dedup key already existed; only the location was recorded.
    Duplicate,
}

/// Read-only access to configured accounts.
#[async_trait]
pub trait AccountStore: Send + Sync {
    /// Returns the account if it exists and belongs to `owner`.
    async fn owned_account(&self, owner: &OwnerId, account: &AccountId) -> Result<Option<Account>>;
}

/// The per-folder envelope mirror.
#[async_trait]
pub trait MirrorStore: Send + Sync {
    /// Replaces every row of `folder` with `rows` in one transaction and
    /// records `uid_validity` as the folder's epoch.
    async fn replace_folder(
        &self,
        scope: &Scope,
        folder: &str,
        uid_validity: u32,
        rows: Vec<FolderStateRecord>,
    ) -> Result<()>;

    /// Current mirror rows of `folder`, ordered by identifier.
    async fn folder_state(&self, scope: &Scope, folder: &str) -> Result<Vec<FolderStateRecord>>;

    /// Epoch recorded by the last replacement, if any.
    async fn folder_validity(&self, scope: &Scope, folder: &str) -> Result<Option<u32>>;
}

/// Encrypted messages and their server locations.
#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Stores `message` unless its dedup key already exists, and records its
    /// location either way. Runs in one transaction.
    async fn insert_message(&self, scope: &Scope, message: RawMessage) -> Result<InsertOutcome>;

    /// Identifiers in `folder` under `uid_validity` that map to a stored message.
    async fn persisted_uids(
        &self,
        scope: &Scope,
        folder: &str,
        uid_validity: u32,
    ) -> Result<BTreeSet<Uid>>;

    /// Drops every recorded location in `folder`. Stored messages stay.
    async fn forget_locations(&self, scope: &Scope, folder: &str) -> Result<u64>;

    /// Sets the flags of messages located at the given identifiers.
    ///
    /// Returns how many stored messages changed.
    async fn update_flags(
        &self,
        scope: &Scope,
        folder: &str,
        uid_validity: u32,
        flags: &[(Uid, MessageFlags)],
    ) -> Result<u64>;

    /// Looks up a stored message.
    async fn message(&self, scope: &Scope, key: &DedupKey) -> Result<Option<RawMessage>>;

    /// Number of stored messages for the account.
    async fn count_messages(&self, scope: &Scope) -> Result<u64>;
}

/// Outcome of [`JobStore::try_claim`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Claim {
    /// The job is now RUNNING under the caller's lease.
    Acquired(SyncJob),
    /// Another job on the same account is running under a live lease.
    AccountBusy,
    /// The job is already running or finished; the stored record is returned.
    Unavailable(SyncJob),
}

/// Job records, shared by every process using the store.
///
/// Every non-terminal record carries a lease timestamp, refreshed by
/// [`heartbeat`](Self::heartbeat). A lease older than the caller's
/// `live_after` cut-off belongs to a process that stopped.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Writes a new record. Its lease starts at `job.updated_at`.
    async fn create_job(&self, job: &SyncJob) -> Result<()>;

    /// Writes a new record unless the same owner already has a job on the
    /// account that is not terminal and whose lease is newer than
    /// `live_after`. Check and insert are one atomic step.
    ///
    /// Returns `false` when the record was not written.
    async fn create_job_if_idle(&self, job: &SyncJob, live_after: DateTime<Utc>) -> Result<bool>;

    /// Overwrites a record that is not yet terminal.
    ///
    /// Returns `false` and leaves the stored record untouched if it is
    /// already terminal.
    async fn save_job(&self, job: &SyncJob) -> Result<bool>;

    /// Loads a record.
    async fn job(&self, id: JobId) -> Result<Option<SyncJob>>;

    /// Atomically moves a queued or retrying job to RUNNING under `worker`'s
    /// lease, counting a new attempt.
    ///
    /// Refused with [`Claim::AccountBusy`] while another job on the same
    /// account is RUNNING under a lease newer than `live_after`.
    async fn try_claim(
        &self,
        id: JobId,
        worker: &str,
        live_after: DateTime<Utc>,
    ) -> Result<Claim>;

    /// Refreshes the lease of every non-terminal job held by `worker`.
    ///
    /// Returns how many leases were refreshed.
    async fn heartbeat(&self, worker: &str, at: DateTime<Utc>) -> Result<u64>;

    /// Non-terminal jobs whose lease was last refreshed at or before `live_after`.
    async fn stale_jobs(&self, live_after: DateTime<Utc>) -> Result<Vec<SyncJob>>;

    /// Appends to the job's progress history.
    async fn append_progress(&self, id: JobId, event: &ProgressEvent) -> Result<()>;

    /// Progress history in emission order.
    async fn progress(&self, id: JobId) -> Result<Vec<ProgressEvent>>;

    /// Deletes terminal jobs that finished before `cutoff`, with their progress.
    async fn purge_finished(&self, cutoff: DateTime<Utc>) -> Result<u64>;
}

/// Everything the orchestrator needs from persistence.
pub trait Store: AccountStore + MirrorStore + MessageStore + JobStore {}

impl<T> Store for T where T: AccountStore + MirrorStore + MessageStore + JobStore {}
