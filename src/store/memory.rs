//! Process-local store.

use super::{AccountStore, Claim, InsertOutcome, JobStore, MessageStore, MirrorStore};
use crate::error::{Error, Result};
use crate::job::{JobState, SyncJob};
use crate::model::{
    Account, AccountId, DedupKey, FolderStateRecord, JobId, MessageFlags, OwnerId, RawMessage,
    Scope, Uid,
};
use crate::progress::{Phase, ProgressEvent};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

type FolderKey = (Scope, String);
type LocationKey = (Scope, String, u32, Uid);

#[derive(Default)]
struct Tables {
    accounts: HashMap<AccountId, Account>,
    mirror: HashMap<FolderKey, BTreeMap<Uid, FolderStateRecord>>,
    epochs: HashMap<FolderKey, u32>,
    messages: HashMap<(Scope, DedupKey), RawMessage>,
    locations: HashMap<LocationKey, DedupKey>,
    jobs: HashMap<JobId, SyncJob>,
    leases: HashMap<JobId, DateTime<Utc>>,
    progress: HashMap<JobId, Vec<ProgressEvent>>,
}

impl Tables {
    fn lease_is_live(&self, id: JobId, live_after: DateTime<Utc>) -> bool {
        self.leases.get(&id).is_some_and(|at| *at > live_after)
    }
}

/// In-memory implementation of every store trait.
///
/// Each operation holds one lock for its whole duration, which gives it the
/// same all-or-nothing behavior as a database transaction.
#[derive(Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
    fail_job_writes: AtomicBool,
}

impl MemoryStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an account.
    pub fn add_account(&self, account: Account) {
        self.lock().accounts.insert(account.id.clone(), account);
    }

    /// Makes progress appends and job claims fail until switched off again.
    pub fn fail_job_writes(&self, fail: bool) {
        self.fail_job_writes.store(fail, Ordering::SeqCst);
    }

    fn job_write_fault(&self) -> Result<()> {
        if self.fail_job_writes.load(Ordering::SeqCst) {
            return Err(Error::Database(sqlx::Error::PoolTimedOut));
        }
        Ok(())
    }

    fn lock(&self) -> MutexGuard<'_, Tables> {
        self.tables.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for MemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let tables = self.lock();
        f.debug_struct("MemoryStore")
            .field("accounts", &tables.accounts.len())
            .field("messages", &tables.messages.len())
            .field("jobs", &tables.jobs.len())
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl AccountStore for MemoryStore {
    async fn owned_account(&self, owner: &OwnerId, account: &AccountId) -> Result<Option<Account>> {
        Ok(self
            .lock()
            .accounts
            .get(account)
            .filter(|a| &a.owner == owner)
            .cloned())
    }
}

#[async_trait]
impl MirrorStore for MemoryStore {
    async fn replace_folder(
        &self,
        scope: &Scope,
        folder: &str,
        uid_validity: u32,
        rows: Vec<FolderStateRecord>,
    ) -> Result<()> {
        let replacement: BTreeMap<Uid, FolderStateRecord> =
            rows.into_iter().map(|row| (row.uid, row)).collect();

        let key = (scope.clone(), folder.to_string());
        let mut tables = self.lock();
        tables.mirror.insert(key.clone(), replacement);
        tables.epochs.insert(key, uid_validity);
        Ok(())
    }

    async fn folder_state(&self, scope: &Scope, folder: &str) -> Result<Vec<FolderStateRecord>> {
        Ok(self
            .lock()
            .mirror
            .get(&(scope.clone(), folder.to_string()))
            .map(|rows| rows.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn folder_validity(&self, scope: &Scope, folder: &str) -> Result<Option<u32>> {
        Ok(self
            .lock()
            .epochs
            .get(&(scope.clone(), folder.to_string()))
            .copied())
    }
}

#[async_trait]
impl MessageStore for MemoryStore {
    async fn insert_message(&self, scope: &Scope, message: RawMessage) -> Result<InsertOutcome> {
        let location = (
            scope.clone(),
            message.location.folder.clone(),
            message.location.uid_validity,
            message.location.uid,
        );
        let key = (scope.clone(), message.dedup_key.clone());

        let mut tables = self.lock();
        tables
            .locations
            .insert(location, message.dedup_key.clone());

        if tables.messages.contains_key(&key) {
            return Ok(InsertOutcome::Duplicate);
        }
        tables.messages.insert(key, message);
        Ok(InsertOutcome::Inserted)
    }

    async fn persisted_uids(
        &self,
        scope: &Scope,
        folder: &str,
        uid_validity: u32,
    ) -> Result<BTreeSet<Uid>> {
        Ok(self
            .lock()
            .locations
            .keys()
            .filter(|(s, f, v, _)| s == scope && f == folder && *v == uid_validity)
            .map(|(_, _, _, uid)| *uid)
            .collect())
    }

    async fn forget_locations(&self, scope: &Scope, folder: &str) -> Result<u64> {
        let mut tables = self.lock();
        let before = tables.locations.len();
        tables
            .locations
            .retain(|(s, f, _, _), _| !(s == scope && f == folder));
        Ok((before - tables.locations.len()) as u64)
    }

    async fn update_flags(
        &self,
        scope: &Scope,
        folder: &str,
        uid_validity: u32,
        flags: &[(Uid, MessageFlags)],
    ) -> Result<u64> {
        let mut tables = self.lock();
        let mut changed = 0;
        for (uid, new_flags) in flags {
            let location = (scope.clone(), folder.to_string(), uid_validity, *uid);
            let Some(dedup_key) = tables.locations.get(&location).cloned() else {
                continue;
            };
            if let Some(message) = tables.messages.get_mut(&(scope.clone(), dedup_key)) {
                if &message.flags != new_flags {
                    message.flags = new_flags.clone();
                    changed += 1;
                }
            }
        }
        Ok(changed)
    }

    async fn message(&self, scope: &Scope, key: &DedupKey) -> Result<Option<RawMessage>> {
        Ok(self
            .lock()
            .messages
            .get(&(scope.clone(), key.clone()))
            .cloned())
    }

    async fn count_messages(&self, scope: &Scope) -> Result<u64> {
        Ok(self
            .lock()
            .messages
            .keys()
            .filter(|(s, _)| s == scope)
            .count() as u64)
    }
}

#[async_trait]
impl JobStore for MemoryStore {
    async fn create_job(&self, job: &SyncJob) -> Result<()> {
        let mut tables = self.lock();
        tables.jobs.insert(job.id, job.clone());
        tables.leases.insert(job.id, job.updated_at);
        Ok(())
    }

    async fn create_job_if_idle(&self, job: &SyncJob, live_after: DateTime<Utc>) -> Result<bool> {
        let mut tables = self.lock();
        let occupied = tables.jobs.values().any(|other| {
            other.owner == job.owner
                && other.account == job.account
                && !other.state.is_terminal()
                && tables.lease_is_live(other.id, live_after)
        });
        if occupied {
            return Ok(false);
        }
        tables.jobs.insert(job.id, job.clone());
        tables.leases.insert(job.id, job.updated_at);
        Ok(true)
    }

    async fn save_job(&self, job: &SyncJob) -> Result<bool> {
        let mut tables = self.lock();
        match tables.jobs.get_mut(&job.id) {
            Some(slot) if slot.state.is_terminal() => Ok(false),
            Some(slot) => {
                *slot = job.clone();
                Ok(true)
            }
            None => Err(Error::JobNotFound { job: job.id }),
        }
    }

    async fn job(&self, id: JobId) -> Result<Option<SyncJob>> {
        Ok(self.lock().jobs.get(&id).cloned())
    }

    async fn try_claim(
        &self,
        id: JobId,
        worker: &str,
        live_after: DateTime<Utc>,
    ) -> Result<Claim> {
        self.job_write_fault()?;
        let mut tables = self.lock();
        let job = tables
            .jobs
            .get(&id)
            .cloned()
            .ok_or(Error::JobNotFound { job: id })?;
        if job.state.is_terminal() || job.state == JobState::Running {
            return Ok(Claim::Unavailable(job));
        }

        let busy = tables.jobs.values().any(|other| {
            other.id != id
                && other.account == job.account
                && other.state == JobState::Running
                && tables.lease_is_live(other.id, live_after)
        });
        if busy {
            return Ok(Claim::AccountBusy);
        }

        let mut job = job;
        job.attempts += 1;
        job.transition(JobState::Running);
        job.phase = Phase::Prepare;
        job.worker = Some(worker.to_string());
        tables.leases.insert(id, job.updated_at);
        tables.jobs.insert(id, job.clone());
        Ok(Claim::Acquired(job))
    }

    async fn heartbeat(&self, worker: &str, at: DateTime<Utc>) -> Result<u64> {
        let mut tables = self.lock();
        let held: Vec<JobId> = tables
            .jobs
            .values()
            .filter(|job| !job.state.is_terminal() && job.worker.as_deref() == Some(worker))
            .map(|job| job.id)
            .collect();
        for id in &held {
            tables.leases.insert(*id, at);
        }
        Ok(held.len() as u64)
    }

    async fn stale_jobs(&self, live_after: DateTime<Utc>) -> Result<Vec<SyncJob>> {
        let tables = self.lock();
        Ok(tables
            .jobs
            .values()
            .filter(|job| !job.state.is_terminal() && !tables.lease_is_live(job.id, live_after))
            .cloned()
            .collect())
    }

    async fn append_progress(&self, id: JobId, event: &ProgressEvent) -> Result<()> {
        self.job_write_fault()?;
        self.lock()
            .progress
            .entry(id)
            .or_default()
            .push(event.clone());
        Ok(())
    }

    async fn progress(&self, id: JobId) -> Result<Vec<ProgressEvent>> {
        Ok(self.lock().progress.get(&id).cloned().unwrap_or_default())
    }

    async fn purge_finished(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let mut tables = self.lock();
        let expired: Vec<JobId> = tables
            .jobs
            .values()
            .filter(|job| job.state.is_terminal())
            .filter(|job| job.finished_at.is_some_and(|at| at < cutoff))
            .map(|job| job.id)
            .collect();

        for id in &expired {
            tables.jobs.remove(id);
            tables.leases.remove(id);
            tables.progress.remove(id);
        }
        Ok(expired.len() as u64)
    }
}
