//! One attempt of a sync job.

use crate::config::SyncConfig;
use crate::error::{Error, Result};
use crate::job::{FolderSelection, SyncJob};
use crate::keys::{KeyResolver, KeyVault};
use crate::model::{Scope, SyncIssue, SyncStats};
use crate::progress::{Phase, ProgressEvent, ProgressSink};
use crate::remote::{Connector, MailRemote, TimedRemote};
use crate::store::Store;
use crate::sync::{CancelToken, DeltaFetcher, RawMessagePersister, StateReconciler};
use std::collections::HashSet;
use tracing::{debug, info, warn};

/// Everything one attempt borrows from the orchestrator.
pub(crate) struct Attempt<'a, S: Store> {
    pub(crate) job: &'a SyncJob,
    pub(crate) store: &'a S,
    pub(crate) connector: &'a dyn Connector,
    pub(crate) resolver: &'a dyn KeyResolver,
    pub(crate) keys: &'a KeyVault,
    pub(crate) config: &'a SyncConfig,
    pub(crate) cancel: &'a CancelToken,
    pub(crate) sink: &'a dyn ProgressSink,
}

impl<S: Store> Attempt<'_, S> {
    /// Runs prepare, reconcile, delta and persist in that order.
    ///
    /// Ownership is checked before anything else so that a foreign account
    /// never causes a connection or a write.
    pub(crate) async fn execute(&self) -> Result<SyncStats> {
        let job = self.job;
        self.sink
            .emit(ProgressEvent::new(Phase::Prepare, "checking account access"))
            .await;

        let account = self
            .store
            .owned_account(&job.owner, &job.account)
            .await?
            .ok_or_else(|| Error::AccountNotOwned {
                account: job.account.clone(),
            })?;

        let lease = self.keys.lease(job.id, &job.owner, self.resolver).await?;
        lease.key()?;
        self.cancel.check()?;

        debug!(account_id = %account.id, "Connecting");
        let session = self.connector.connect(&account).await?;
        let mut remote = TimedRemote::new(session, self.config.timeouts.clone());

        let scope = account.scope();
        let result = self.sync(&mut remote, &scope, &lease).await;

        match &result {
            Err(e) if e.is_connection_loss() => {}
            _ => {
                if let Err(e) = remote.logout().await {
                    debug!(error = %e, "Logout failed");
                }
            }
        }
        drop(lease);
        result
    }

    async fn sync(
        &self,
        remote: &mut dyn MailRemote,
        scope: &Scope,
        lease: &crate::keys::KeyLease,
    ) -> Result<SyncStats> {
        let options = &self.job.options;
        let folders = match &options.folders {
            FolderSelection::All => remote.list_folders().await?,
            FolderSelection::Only(folders) => folders.clone(),
        };
        info!(folder_count = folders.len(), "Reconciling folders");

        self.sink
            .emit(
                ProgressEvent::new(Phase::StateSync, "reconciling folders")
                    .counts(0, folders.len()),
            )
            .await;

        let mut stats = StateReconciler::new(self.store, self.store)
            .batch_size(self.config.batch_size)
            .progress_threshold(self.config.progress_threshold)
            .with_cancel(self.cancel.clone())
            .reconcile(remote, scope, &folders, self.sink)
            .await?;

        let failed: HashSet<String> = stats
            .errors
            .iter()
            .filter_map(|issue| issue.folder.clone())
            .collect();
        let cap = options.message_cap.or(self.config.message_cap);
        let fetcher = DeltaFetcher::new(self.store, self.store).message_cap(cap);
        let persister = RawMessagePersister::new(self.store).with_cancel(self.cancel.clone());
        let key = lease.key()?;
        let total = folders.len();

        for (index, folder) in folders.iter().enumerate() {
            if failed.contains(folder) {
                continue;
            }
            self.cancel.check()?;

            let delta = match fetcher
                .compute_delta(remote, scope, folder, &options.filter)
                .await
            {
                Ok(delta) => delta,
                Err(e) if e.is_connection_loss() || matches!(e, Error::Cancelled) => return Err(e),
                Err(e) => {
                    warn!(folder = %folder, error = %e, "Delta computation failed");
                    stats.errors.push(SyncIssue::folder(folder, &e));
                    continue;
                }
            };

            stats.truncated += delta.truncated;
            self.sink
                .emit(
                    ProgressEvent::new(Phase::Fetch, "delta computed")
                        .folder(folder)
                        .folder_position(index, total)
                        .message_count(delta.len()),
                )
                .await;
            if delta.is_empty() {
                continue;
            }

            let report = persister
                .fetch_and_persist(remote, scope, &delta, key, self.sink)
                .await?;
            stats.messages_new += report.saved;
            stats.messages_skipped += report.skipped;
            stats.errors.extend(report.errors);
        }

        Ok(stats)
    }
}
