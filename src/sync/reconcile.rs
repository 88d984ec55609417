//! Mirror reconciliation.

use super::CancelToken;
use crate::error::{Error, Result};
use crate::model::{FolderStateRecord, MessageFlags, Scope, SearchCriteria, SyncIssue, SyncStats, Uid};
use crate::progress::{Phase, ProgressEvent, ProgressSink};
use crate::remote::MailRemote;
use crate::store::{MessageStore, MirrorStore};
use tracing::{debug, info, instrument, warn};

const DEFAULT_BATCH_SIZE: usize = 500;
const DEFAULT_PROGRESS_THRESHOLD: usize = 1000;

/// Replaces the local per-folder mirror with the server's current state.
///
/// One folder's failure is recorded in [`SyncStats::errors`] and the pass
/// moves on; only a lost connection or a cancellation ends the pass early.
///
/// # Example
///
/// ```no_run
/// use email_mirror::{CollectingSink, MemoryStore, Scope, StateReconciler, MailRemote};
///
/// # async fn example(remote: &mut dyn MailRemote) -> email_mirror::Result<()> {
/// let store = MemoryStore::new();
/// let sink = CollectingSink::new();
/// let stats = StateReconciler::new(&store, &store)
///     .batch_size(200)
///     .reconcile(remote, &Scope::new("owner", "acct"), &["INBOX".to_string()], &sink)
///     .await?;
/// println!("{} folders reconciled", stats.folders_scanned);
/// # Ok(())
/// # }
/// ```
pub struct StateReconciler<'a> {
    mirror: &'a dyn MirrorStore,
    messages: &'a dyn MessageStore,
    batch_size: usize,
    progress_threshold: usize,
    cancel: CancelToken,
}

impl<'a> StateReconciler<'a> {
    /// Creates a reconciler writing to `mirror` and propagating flags into `messages`.
    #[must_use]
    pub fn new(mirror: &'a dyn MirrorStore, messages: &'a dyn MessageStore) -> Self {
        Self {
            mirror,
            messages,
            batch_size: DEFAULT_BATCH_SIZE,
            progress_threshold: DEFAULT_PROGRESS_THRESHOLD,
            cancel: CancelToken::new(),
        }
    }

    /// Sets how many envelopes are requested per round trip.
    #[must_use]
    pub fn batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    /// Sets the folder size above which per-batch progress is reported.
    #[must_use]
    pub fn progress_threshold(mut self, threshold: usize) -> Self {
        self.progress_threshold = threshold;
        self
    }

    /// Observes `cancel` between folders and batches.
    #[must_use]
    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Reconciles `folders` in order.
    ///
    /// # Errors
    ///
    /// Returns an error only if the connection is lost or the pass is
    /// cancelled. Every other failure is recorded per folder.
    #[instrument(
        name = "StateReconciler::reconcile",
        skip_all,
        fields(account_id = %scope.account, folder_count = folders.len())
    )]
    pub async fn reconcile(
        &self,
        remote: &mut dyn MailRemote,
        scope: &Scope,
        folders: &[String],
        sink: &dyn ProgressSink,
    ) -> Result<SyncStats> {
        let mut stats = SyncStats::default();
        let total = folders.len();

        for (index, folder) in folders.iter().enumerate() {
            self.cancel.check()?;

            match self
                .reconcile_folder(remote, scope, folder, index, total, sink)
                .await
            {
                Ok(rows) => {
                    stats.folders_scanned += 1;
                    info!(folder = %folder, rows, "Folder reconciled");
                }
                Err(e) if e.is_connection_loss() || matches!(e, Error::Cancelled) => {
                    return Err(e);
                }
                Err(e) => {
                    warn!(
                        folder = %folder,
                        error = %e,
                        category = %e.category(),
                        "Folder reconciliation failed, continuing with next folder"
                    );
                    sink.emit(
                        ProgressEvent::new(Phase::StateSync, format!("folder failed: {e}"))
                            .folder(folder)
                            .folder_position(index, total),
                    )
                    .await;
                    stats.errors.push(SyncIssue::folder(folder, &e));
                }
            }
        }

        Ok(stats)
    }

    async fn reconcile_folder(
        &self,
        remote: &mut dyn MailRemote,
        scope: &Scope,
        folder: &str,
        index: usize,
        total: usize,
        sink: &dyn ProgressSink,
    ) -> Result<usize> {
        let status = remote.select_readonly(folder).await?;
        let uids = remote.search(&SearchCriteria::all()).await?;

        sink.emit(
            ProgressEvent::new(Phase::StateSync, "folder start")
                .folder(folder)
                .folder_position(index, total)
                .message_count(uids.len()),
        )
        .await;

        let previous = self.mirror.folder_validity(scope, folder).await?;
        if previous.is_some_and(|v| v != status.uid_validity) {
            let forgotten = self.messages.forget_locations(scope, folder).await?;
            info!(
                folder = %folder,
                previous = ?previous,
                current = status.uid_validity,
                forgotten,
                "Validity epoch changed, rebuilding folder"
            );
        }

        let rows = self.collect_rows(remote, folder, status.uid_validity, &uids, sink).await?;
        let count = rows.len();
        let flags: Vec<(Uid, MessageFlags)> =
            rows.iter().map(|row| (row.uid, row.flags.clone())).collect();

        self.mirror
            .replace_folder(scope, folder, status.uid_validity, rows)
            .await?;

        let changed = self
            .messages
            .update_flags(scope, folder, status.uid_validity, &flags)
            .await?;
        if changed > 0 {
            debug!(folder = %folder, changed, "Propagated flag changes");
        }

        sink.emit(
            ProgressEvent::new(Phase::StateSync, "folder complete")
                .folder(folder)
                .folder_position(index, total)
                .message_count(count),
        )
        .await;

        Ok(count)
    }

    async fn collect_rows(
        &self,
        remote: &mut dyn MailRemote,
        folder: &str,
        uid_validity: u32,
        uids: &[Uid],
        sink: &dyn ProgressSink,
    ) -> Result<Vec<FolderStateRecord>> {
        let report_batches = uids.len() > self.progress_threshold;
        let mut rows = Vec::with_capacity(uids.len());

        for batch in uids.chunks(self.batch_size) {
            self.cancel.check()?;

            let envelopes = remote.fetch_envelopes(batch).await?;
            debug!(folder = %folder, batch = batch.len(), received = envelopes.len(), "Fetched envelopes");
            rows.extend(
                envelopes
                    .into_iter()
                    .map(|env| FolderStateRecord::from_envelope(folder, uid_validity, env)),
            );

            if report_batches {
                sink.emit(
                    ProgressEvent::new(Phase::StateSync, "envelopes fetched")
                        .folder(folder)
                        .counts(rows.len(), uids.len()),
                )
                .await;
            }
        }

        Ok(rows)
    }
}

impl std::fmt::Debug for StateReconciler<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateReconciler")
            .field("batch_size", &self.batch_size)
            .field("progress_threshold", &self.progress_threshold)
            .finish_non_exhaustive()
    }
}
