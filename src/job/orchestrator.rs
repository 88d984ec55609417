//! Worker pool and job lifecycle.

use super::run::Attempt;
use super::{JobFailure, JobState, JobStatus, SyncJob, SyncOptions};
use crate::config::{ConflictPolicy, SyncConfig};
use crate::error::{Error, Result};
use crate::keys::{DirectKeysOnly, KeyRef, KeyResolver, KeyVault};
use crate::model::{AccountId, JobId, OwnerId, Scope, SyncIssue, SyncStats};
use crate::progress::{Phase, ProgressEvent, ProgressSink};
use crate::remote::Connector;
use crate::store::{Claim, Store};
use crate::sync::CancelToken;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

const WAIT_POLL_INTERVAL: Duration = Duration::from_millis(25);

/// Downstream work run after a successful sync (classification, rules, ...).
///
/// A failure is logged and recorded as an issue on the job; it never fails
/// the job.
#[async_trait]
pub trait PostProcessor: Send + Sync {
    /// Handles the outcome of a successful run.
    async fn process(&self, job: JobId, scope: &Scope, stats: &SyncStats) -> Result<()>;
}

enum Dispatch {
    Run(JobId),
    Stop,
}

// ─────────────────────────────────────────────────────────────────────────────
// Builder
// ─────────────────────────────────────────────────────────────────────────────

/// Builder for [`SyncOrchestrator`].
#[must_use]
pub struct SyncOrchestratorBuilder<S: Store> {
    store: Arc<S>,
    connector: Arc<dyn Connector>,
    config: SyncConfig,
    resolver: Arc<dyn KeyResolver>,
    post_processor: Option<Arc<dyn PostProcessor>>,
}

impl<S: Store + 'static> SyncOrchestratorBuilder<S> {
    /// Sets the configuration.
    pub fn config(mut self, config: SyncConfig) -> Self {
        self.config = config;
        self
    }

    /// Sets the resolver for deferred key references.
    pub fn resolver(mut self, resolver: Arc<dyn KeyResolver>) -> Self {
        self.resolver = resolver;
        self
    }

    /// Sets the callback invoked after each successful run.
    pub fn post_processor(mut self, post_processor: Arc<dyn PostProcessor>) -> Self {
        self.post_processor = Some(post_processor);
        self
    }

    /// Spawns the worker pool.
    ///
    /// Must be called from within a Tokio runtime.
    #[must_use]
    pub fn start(self) -> SyncOrchestrator<S> {
        let (sender, receiver) = flume::unbounded();
        let shared = Arc::new(Shared {
            config: self.config,
            store: self.store,
            connector: self.connector,
            resolver: self.resolver,
            post_processor: self.post_processor,
            worker: Uuid::new_v4().to_string(),
            keys: KeyVault::new(),
            cancels: Mutex::new(HashMap::new()),
            busy: Mutex::new(HashSet::new()),
            records: tokio::sync::Mutex::new(()),
            sender,
            closed: AtomicBool::new(false),
        });

        let workers = (0..shared.config.workers)
            .map(|worker| {
                let shared = Arc::clone(&shared);
                let receiver = receiver.clone();
                tokio::spawn(async move { shared.work(worker, receiver).await })
            })
            .collect();
        let heartbeat = tokio::spawn(Arc::clone(&shared).keep_leases());

        info!(
            workers = shared.config.workers,
            worker_id = %shared.worker,
            "Sync worker pool started"
        );
        SyncOrchestrator {
            shared,
            workers: Mutex::new(workers),
            heartbeat,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Orchestrator
// ─────────────────────────────────────────────────────────────────────────────

/// Runs sync jobs on a bounded worker pool.
///
/// Jobs on different accounts run in parallel; jobs on the same account
/// never overlap, even across orchestrators in different processes sharing
/// one store. Job records and progress live in the store, so
/// [`status`](Self::status) and [`progress`](Self::progress) work for any
/// job id the store knows about.
///
/// # Example
///
/// ```no_run
/// use email_mirror::{
///     EncryptionKey, MemoryConnector, MemoryMailServer, MemoryStore, SyncOptions,
///     SyncOrchestrator,
/// };
/// use std::sync::Arc;
///
/// # async fn example() -> email_mirror::Result<()> {
/// let store = Arc::new(MemoryStore::new());
/// let server = MemoryMailServer::new();
/// let orchestrator = SyncOrchestrator::builder(store, Arc::new(MemoryConnector::new(server))).start();
///
/// let job = orchestrator
///     .submit("owner".into(), "acct".into(), EncryptionKey::generate().into(), SyncOptions::default())
///     .await?;
/// let status = orchestrator.wait(job).await?;
/// println!("{}", status.state);
/// orchestrator.shutdown().await;
/// # Ok(())
/// # }
/// ```
pub struct SyncOrchestrator<S: Store> {
    shared: Arc<Shared<S>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    heartbeat: JoinHandle<()>,
}

impl<S: Store + 'static> SyncOrchestrator<S> {
    /// Creates a builder with default configuration and direct keys only.
    pub fn builder(store: Arc<S>, connector: Arc<dyn Connector>) -> SyncOrchestratorBuilder<S> {
        SyncOrchestratorBuilder {
            store,
            connector,
            config: SyncConfig::default(),
            resolver: Arc::new(DirectKeysOnly),
            post_processor: None,
        }
    }

    /// Queues a job and returns its id immediately.
    ///
    /// Ownership and key checks happen when the job runs, before any
    /// connection or write.
    ///
    /// # Errors
    ///
    /// - [`Error::QueueClosed`] after [`shutdown`](Self::shutdown)
    /// - [`Error::AccountBusy`] if the policy is [`ConflictPolicy::Reject`]
    ///   and the same owner already has an active job on the account
    /// - storage errors while writing the record; the key is dropped and
    ///   any record already written is marked failed
    #[instrument(name = "SyncOrchestrator::submit", skip_all, fields(owner = %owner, account_id = %account))]
    pub async fn submit(
        &self,
        owner: OwnerId,
        account: AccountId,
        key: KeyRef,
        options: SyncOptions,
    ) -> Result<JobId> {
        let shared = &self.shared;
        if shared.closed.load(Ordering::SeqCst) {
            return Err(Error::QueueClosed);
        }

        let mut job = SyncJob::queued(owner, account, options);
        job.worker = Some(shared.worker.clone());
        let id = job.id;
        match shared.config.conflict_policy {
            ConflictPolicy::Reject => {
                if !shared.store.create_job_if_idle(&job, shared.live_after()).await? {
                    return Err(Error::AccountBusy {
                        account: job.account,
                    });
                }
            }
            ConflictPolicy::Serialize => shared.store.create_job(&job).await?,
        }

        if let Err(e) = shared
            .store
            .append_progress(id, &ProgressEvent::new(Phase::Queued, "queued"))
            .await
        {
            shared.abandon(id, &e).await;
            return Err(e);
        }

        // Deposited last: every failure above drops the key with `key`
        shared.keys.deposit(id, key);
        if shared.sender.send(Dispatch::Run(id)).is_err() {
            shared.abandon(id, &Error::QueueClosed).await;
            return Err(Error::QueueClosed);
        }

        info!(job_id = %id, "Job queued");
        Ok(id)
    }

    /// Current state, phase, latest progress and outcome of a job.
    ///
    /// # Errors
    ///
    /// Returns [`Error::JobNotFound`] for unknown ids.
    pub async fn status(&self, id: JobId) -> Result<JobStatus> {
        let store = &self.shared.store;
        let job = store.job(id).await?.ok_or(Error::JobNotFound { job: id })?;
        let mut status = job.status();

        if let Some(latest) = store.progress(id).await?.pop() {
            if !job.state.is_terminal() {
                status.phase = latest.phase;
            }
            status.progress = Some(latest);
        }
        Ok(status)
    }

    /// Full progress history of a job, oldest first.
    ///
    /// # Errors
    ///
    /// Returns [`Error::JobNotFound`] for unknown ids.
    pub async fn progress(&self, id: JobId) -> Result<Vec<ProgressEvent>> {
        let store = &self.shared.store;
        if store.job(id).await?.is_none() {
            return Err(Error::JobNotFound { job: id });
        }
        store.progress(id).await
    }

    /// Waits until the job reaches a terminal state.
    ///
    /// # Errors
    ///
    /// Returns [`Error::JobNotFound`] for unknown ids.
    pub async fn wait(&self, id: JobId) -> Result<JobStatus> {
        loop {
            let status = self.status(id).await?;
            if status.state.is_terminal() {
                return Ok(status);
            }
            tokio::time::sleep(WAIT_POLL_INTERVAL).await;
        }
    }

    /// Requests cancellation.
    ///
    /// A queued or retrying job is cancelled at once. A running job stops
    /// before its next folder, batch or message. Cancelling a finished job
    /// does nothing.
    ///
    /// # Errors
    ///
    /// Returns [`Error::JobNotFound`] for unknown ids.
    #[instrument(name = "SyncOrchestrator::cancel", skip_all, fields(job_id = %id))]
    pub async fn cancel(&self, id: JobId) -> Result<JobState> {
        let shared = &self.shared;
        let job = shared
            .update(id, |job| {
                if job.state.is_terminal() {
                    return;
                }
                job.cancel_requested = true;
                if matches!(job.state, JobState::Queued | JobState::Retrying) {
                    job.transition(JobState::Cancelled);
                }
            })
            .await?;

        match job.state {
            JobState::Cancelled => {
                shared.keys.discard(id);
                info!("Job cancelled before running");
            }
            JobState::Running => {
                if let Some(token) = shared.lock_cancels().get(&id) {
                    token.cancel();
                }
                info!("Cancellation requested for running job");
            }
            _ => {}
        }
        Ok(job.state)
    }

    /// Returns `true` while this process still holds key material for `id`.
    #[must_use]
    pub fn holds_key(&self, id: JobId) -> bool {
        self.shared.keys.contains(id)
    }

    /// Fails jobs whose orchestrator stopped before they finished.
    ///
    /// A job is interrupted once its lease has gone without a heartbeat for
    /// longer than [`SyncConfig::lease_ttl`]. Its key lived only in the
    /// stopped process, so it cannot resume. Jobs of live orchestrators,
    /// this one included, are left alone. Safe to call from any process at
    /// any time.
    ///
    /// # Errors
    ///
    /// Returns storage errors.
    #[instrument(name = "SyncOrchestrator::recover_interrupted", skip_all)]
    pub async fn recover_interrupted(&self) -> Result<u64> {
        let shared = &self.shared;
        let mut recovered = 0;

        for job in shared.store.stale_jobs(shared.live_after()).await? {
            if shared.keys.contains(job.id) || job.worker.as_deref() == Some(shared.worker.as_str())
            {
                continue;
            }
            let failure = JobFailure::from(&Error::KeyUnavailable {
                reason: "worker stopped before the job finished".to_string(),
            });
            let mut failed = false;
            let updated = shared
                .update(job.id, |job| {
                    if job.transition(JobState::Failed) {
                        failed = true;
                        job.error = Some(failure);
                    }
                })
                .await?;
            if failed && updated.state == JobState::Failed {
                warn!(job_id = %job.id, state = %job.state, "Marked interrupted job as failed");
                recovered += 1;
            }
        }
        Ok(recovered)
    }

    /// Deletes finished jobs older than the configured retention.
    ///
    /// # Errors
    ///
    /// Returns storage errors.
    pub async fn purge_finished(&self) -> Result<u64> {
        let retention = chrono::Duration::from_std(self.shared.config.job_retention)
            .map_err(|_| Error::InvalidConfig {
                message: "job retention out of range".to_string(),
            })?;
        let Some(cutoff) = Utc::now().checked_sub_signed(retention) else {
            return Ok(0);
        };
        let purged = self.shared.store.purge_finished(cutoff).await?;
        if purged > 0 {
            info!(purged, "Purged finished jobs");
        }
        Ok(purged)
    }

    /// Stops accepting jobs and waits for the workers to finish their current job.
    ///
    /// Leases stay fresh until the last worker returns.
    pub async fn shutdown(&self) {
        self.shared.close();
        let workers = std::mem::take(
            &mut *self.workers.lock().unwrap_or_else(PoisonError::into_inner),
        );
        for result in futures::future::join_all(workers).await {
            if let Err(e) = result {
                error!(error = %e, "Worker task ended abnormally");
            }
        }
        self.heartbeat.abort();
        info!("Sync worker pool stopped");
    }
}

impl<S: Store> Drop for SyncOrchestrator<S> {
    fn drop(&mut self) {
        self.shared.close();
        self.heartbeat.abort();
    }
}

impl<S: Store> std::fmt::Debug for SyncOrchestrator<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncOrchestrator")
            .field("workers", &self.shared.config.workers)
            .field("worker_id", &self.shared.worker)
            .field("keys", &self.shared.keys)
            .finish_non_exhaustive()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Worker side
// ─────────────────────────────────────────────────────────────────────────────

struct Shared<S: Store> {
    config: SyncConfig,
    store: Arc<S>,
    connector: Arc<dyn Connector>,
    resolver: Arc<dyn KeyResolver>,
    post_processor: Option<Arc<dyn PostProcessor>>,
    /// Lease holder name of this orchestrator in the job store.
    worker: String,
    keys: KeyVault,
    cancels: Mutex<HashMap<JobId, CancelToken>>,
    busy: Mutex<HashSet<AccountId>>,
    records: tokio::sync::Mutex<()>,
    sender: flume::Sender<Dispatch>,
    closed: AtomicBool,
}

/// Releases an account when the job holding it is done.
///
/// In-process fast path; [`JobStore::try_claim`](crate::store::JobStore::try_claim)
/// is what excludes other processes.
struct AccountClaim<'a> {
    busy: &'a Mutex<HashSet<AccountId>>,
    account: AccountId,
}

impl Drop for AccountClaim<'_> {
    fn drop(&mut self) {
        self.busy
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.account);
    }
}

impl<S: Store> Shared<S> {
    fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        for _ in 0..self.config.workers {
            let _ = self.sender.send(Dispatch::Stop);
        }
    }

    fn claim(&self, account: &AccountId) -> Option<AccountClaim<'_>> {
        let mut busy = self.busy.lock().unwrap_or_else(PoisonError::into_inner);
        if !busy.insert(account.clone()) {
            return None;
        }
        Some(AccountClaim {
            busy: &self.busy,
            account: account.clone(),
        })
    }

    fn lock_cancels(&self) -> MutexGuard<'_, HashMap<JobId, CancelToken>> {
        self.cancels.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Leases refreshed after this instant are held by a live orchestrator.
    fn live_after(&self) -> DateTime<Utc> {
        let ttl = chrono::Duration::from_std(self.config.lease_ttl)
            .unwrap_or_else(|_| chrono::Duration::seconds(60));
        Utc::now()
            .checked_sub_signed(ttl)
            .unwrap_or(DateTime::<Utc>::MIN_UTC)
    }
}

impl<S: Store + 'static> Shared<S> {
    async fn work(self: Arc<Self>, worker: usize, receiver: flume::Receiver<Dispatch>) {
        debug!(worker, "Worker started");
        while let Ok(message) = receiver.recv_async().await {
            match message {
                Dispatch::Run(id) => {
                    if let Err(e) = Arc::clone(&self).dispatch(id).await {
                        error!(worker, job_id = %id, error = %e, "Job dispatch failed");
                        self.abandon(id, &e).await;
                    }
                }
                Dispatch::Stop => break,
            }
        }
        debug!(worker, "Worker stopped");
    }

    async fn keep_leases(self: Arc<Self>) {
        let interval = self.config.lease_ttl / 4;
        loop {
            tokio::time::sleep(interval).await;
            match self.store.heartbeat(&self.worker, Utc::now()).await {
                Ok(0) => {}
                Ok(refreshed) => debug!(refreshed, "Job leases refreshed"),
                Err(e) => warn!(error = %e, "Failed to refresh job leases"),
            }
        }
    }

    fn requeue(self: &Arc<Self>, id: JobId, delay: Duration) {
        let shared = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if !shared.closed.load(Ordering::SeqCst) {
                let _ = shared.sender.send(Dispatch::Run(id));
            }
        });
    }

    /// Loads, mutates and saves a job record under the record lock.
    ///
    /// Returns the record as stored. A record that another process made
    /// terminal in the meantime is returned unchanged.
    async fn update<F>(&self, id: JobId, mutate: F) -> Result<SyncJob>
    where
        F: FnOnce(&mut SyncJob) + Send,
    {
        let _guard = self.records.lock().await;
        let mut job = self
            .store
            .job(id)
            .await?
            .ok_or(Error::JobNotFound { job: id })?;
        if job.state.is_terminal() {
            return Ok(job);
        }
        mutate(&mut job);
        job.updated_at = Utc::now();
        if self.store.save_job(&job).await? {
            return Ok(job);
        }
        debug!(job_id = %id, "Record finished elsewhere, left unchanged");
        self.store
            .job(id)
            .await?
            .ok_or(Error::JobNotFound { job: id })
    }

    /// Gives up on a job after an orchestration error: drops its key and
    /// records the failure if the store still accepts it.
    async fn abandon(&self, id: JobId, cause: &Error) {
        self.keys.discard(id);
        self.lock_cancels().remove(&id);
        let failure = JobFailure::from(cause);
        let result = self
            .update(id, |job| {
                if job.transition(JobState::Failed) {
                    job.error = Some(failure);
                }
            })
            .await;
        if let Err(e) = result {
            warn!(job_id = %id, error = %e, "Failed to record abandoned job");
        }
    }

    #[instrument(name = "SyncOrchestrator::dispatch", skip_all, fields(job_id = %id))]
    async fn dispatch(self: Arc<Self>, id: JobId) -> Result<()> {
        let Some(job) = self.store.job(id).await? else {
            warn!("Dispatched job no longer exists");
            self.keys.discard(id);
            return Ok(());
        };
        if job.state.is_terminal() {
            debug!(state = %job.state, "Skipping finished job");
            self.keys.discard(id);
            return Ok(());
        }
        if job.cancel_requested {
            self.finish(id, JobState::Cancelled, None, None).await?;
            return Ok(());
        }

        let Some(_claim) = self.claim(&job.account) else {
            debug!(account_id = %job.account, "Account busy, requeueing");
            self.requeue(id, self.config.requeue_delay);
            return Ok(());
        };

        self.attempt(id).await
    }

    async fn attempt(self: &Arc<Self>, id: JobId) -> Result<()> {
        let cancel = CancelToken::new();
        self.lock_cancels().insert(id, cancel.clone());

        let claim = {
            let _guard = self.records.lock().await;
            self.store.try_claim(id, &self.worker, self.live_after()).await
        };
        let job = match claim {
            Ok(Claim::Acquired(job)) => job,
            Ok(Claim::AccountBusy) => {
                self.lock_cancels().remove(&id);
                debug!("Account running in another process, requeueing");
                self.requeue(id, self.config.requeue_delay);
                return Ok(());
            }
            Ok(Claim::Unavailable(job)) => {
                // cancelled or finished between dispatch and start
                self.lock_cancels().remove(&id);
                if job.state.is_terminal() {
                    self.keys.discard(id);
                }
                debug!(state = %job.state, "Job no longer claimable");
                return Ok(());
            }
            Err(e) => {
                self.lock_cancels().remove(&id);
                return Err(e);
            }
        };
        if job.cancel_requested {
            cancel.cancel();
        }
        info!(attempt = job.attempts, account_id = %job.account, "Job running");

        let sink = JobSink::new(Arc::clone(&self.store), id);
        let outcome = {
            let attempt = Attempt {
                job: &job,
                store: self.store.as_ref(),
                connector: self.connector.as_ref(),
                resolver: self.resolver.as_ref(),
                keys: &self.keys,
                config: &self.config,
                cancel: &cancel,
                sink: &sink,
            };
            self.bounded(attempt.execute(), &sink).await
        };
        self.lock_cancels().remove(&id);

        match outcome {
            Ok(stats) if stats.made_no_progress() => {
                let failures = stats.errors.len();
                self.handle_failure(&job, Error::NoProgress { failures }, &cancel)
                    .await
            }
            Ok(mut stats) => {
                self.post_process(&job, &mut stats, &sink).await;
                info!(
                    folders = stats.folders_scanned,
                    new = stats.messages_new,
                    skipped = stats.messages_skipped,
                    issues = stats.errors.len(),
                    "Job succeeded"
                );
                self.finish(id, JobState::Succeeded, Some(stats), None).await
            }
            Err(e) => self.handle_failure(&job, e, &cancel).await,
        }
    }

    /// Applies the soft warning and the hard ceiling to one attempt.
    async fn bounded<F>(&self, run: F, sink: &JobSink<S>) -> Result<SyncStats>
    where
        F: std::future::Future<Output = Result<SyncStats>>,
    {
        let limits = &self.config.job_timeouts;
        tokio::pin!(run);
        let soft = tokio::time::sleep(limits.soft);
        tokio::pin!(soft);
        let hard = tokio::time::sleep(limits.hard);
        tokio::pin!(hard);
        let mut warned = false;

        loop {
            tokio::select! {
                result = &mut run => return result,
                () = &mut soft, if !warned => {
                    warned = true;
                    warn!(elapsed = ?limits.soft, "Job exceeded soft time limit");
                    sink.emit(ProgressEvent::new(sink.phase(), "still running after soft time limit"))
                        .await;
                }
                () = &mut hard => {
                    return Err(Error::JobTimeout { timeout: limits.hard });
                }
            }
        }
    }

    async fn post_process(&self, job: &SyncJob, stats: &mut SyncStats, sink: &JobSink<S>) {
        let Some(post_processor) = &self.post_processor else {
            return;
        };
        sink.emit(ProgressEvent::new(Phase::PostProcess, "post-processing"))
            .await;

        let scope = Scope::new(job.owner.clone(), job.account.clone());
        if let Err(e) = post_processor.process(job.id, &scope, stats).await {
            warn!(error = %e, "Post-processing failed");
            stats.errors.push(SyncIssue::general(&e));
        }
    }

    async fn handle_failure(
        self: &Arc<Self>,
        job: &SyncJob,
        error: Error,
        cancel: &CancelToken,
    ) -> Result<()> {
        if matches!(error, Error::Cancelled) || cancel.is_cancelled() {
            return self.finish(job.id, JobState::Cancelled, None, None).await;
        }

        let failure = JobFailure::from(&error);
        if error.is_retryable() && self.config.retry.allows_retry(job.attempts) {
            // Recorded straight as RETRYING with the failure attached
            let updated = self
                .update(job.id, |job| {
                    if job.transition(JobState::Retrying) {
                        job.retry_count += 1;
                        job.error = Some(failure);
                        job.phase = Phase::Queued;
                    }
                })
                .await?;

            if updated.state == JobState::Retrying {
                let delay = self.config.retry.delay_for(updated.retry_count);
                warn!(
                    attempt = job.attempts,
                    retry = updated.retry_count,
                    delay = ?delay,
                    error = %error,
                    category = %error.category(),
                    "Job failed, retrying"
                );
                self.requeue(job.id, delay);
            }
            return Ok(());
        }

        error!(
            attempt = job.attempts,
            error = %error,
            category = %error.category(),
            "Job failed"
        );
        self.finish(job.id, JobState::Failed, None, Some(failure)).await
    }

    async fn finish(
        &self,
        id: JobId,
        state: JobState,
        stats: Option<SyncStats>,
        failure: Option<JobFailure>,
    ) -> Result<()> {
        self.keys.discard(id);
        let mut finished = false;
        let job = self
            .update(id, |job| {
                if job.transition(state) {
                    finished = true;
                    job.stats = stats;
                    if failure.is_some() {
                        job.error = failure;
                    }
                }
            })
            .await?;
        if !finished || job.state != state {
            warn!(state = %job.state, outcome = %state, "Job already finished elsewhere, outcome dropped");
            return Ok(());
        }

        self.store
            .append_progress(id, &ProgressEvent::new(Phase::Done, job.state.as_str()))
            .await?;
        info!(state = %job.state, "Job finished");
        Ok(())
    }
}

/// Appends a job's progress events to the store.
struct JobSink<S: Store> {
    store: Arc<S>,
    job: JobId,
    phase: Mutex<Phase>,
}

impl<S: Store> JobSink<S> {
    fn new(store: Arc<S>, job: JobId) -> Self {
        Self {
            store,
            job,
            phase: Mutex::new(Phase::Prepare),
        }
    }

    fn phase(&self) -> Phase {
        *self.phase.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl<S: Store> ProgressSink for JobSink<S> {
    async fn emit(&self, event: ProgressEvent) {
        *self.phase.lock().unwrap_or_else(PoisonError::into_inner) = event.phase;
        if let Err(e) = self.store.append_progress(self.job, &event).await {
            warn!(job_id = %self.job, error = %e, "Failed to record progress");
        }
    }
}
