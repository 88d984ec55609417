//! Message persistence.

use super::{CancelToken, Delta};
use crate::crypto::{dedup_key, EncryptionKey, MessageCipher};
use crate::error::{Error, Result};
use crate::model::{MessageLocation, RawMessage, Scope, SyncIssue};
use crate::parser;
use crate::progress::{Phase, ProgressEvent, ProgressSink};
use crate::remote::MailRemote;
use crate::store::{InsertOutcome, MessageStore};
use chrono::Utc;
use tracing::{debug, instrument, warn};

const DEFAULT_PROGRESS_EVERY: usize = 50;

/// Outcome of persisting one delta.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PersistReport {
    /// Messages newly stored.
    pub saved: u64,
    /// Messages whose dedup key already existed.
    pub skipped: u64,
    /// Per-message failures.
    pub errors: Vec<SyncIssue>,
}

/// Downloads the messages of a [`Delta`], seals them and stores them.
///
/// Fetches never set `\Seen` on the server.
pub struct RawMessagePersister<'a> {
    messages: &'a dyn MessageStore,
    progress_every: usize,
    cancel: CancelToken,
}

impl<'a> RawMessagePersister<'a> {
    /// Creates a persister writing to `messages`.
    #[must_use]
    pub fn new(messages: &'a dyn MessageStore) -> Self {
        Self {
            messages,
            progress_every: DEFAULT_PROGRESS_EVERY,
            cancel: CancelToken::new(),
        }
    }

    /// Emits a progress event every `count` messages.
    #[must_use]
    pub fn progress_every(mut self, count: usize) -> Self {
        self.progress_every = count.max(1);
        self
    }

    /// Observes `cancel` between messages.
    #[must_use]
    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Fetches and stores every identifier of `delta`.
    ///
    /// Expects the delta's folder to be selected on `remote`, which
    /// [`DeltaFetcher::compute_delta`](super::DeltaFetcher::compute_delta)
    /// guarantees.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection is lost, the job is cancelled or
    /// the key cannot be used. A message that fails to download or store is
    /// recorded in [`PersistReport::errors`] instead.
    #[instrument(
        name = "RawMessagePersister::fetch_and_persist",
        skip_all,
        fields(account_id = %scope.account, folder = %delta.folder, count = delta.len())
    )]
    pub async fn fetch_and_persist(
        &self,
        remote: &mut dyn MailRemote,
        scope: &Scope,
        delta: &Delta,
        key: &EncryptionKey,
        sink: &dyn ProgressSink,
    ) -> Result<PersistReport> {
        let cipher = MessageCipher::new(key)?;
        let mut report = PersistReport::default();
        let total = delta.len();

        for (done, &uid) in delta.uids.iter().enumerate() {
            self.cancel.check()?;

            match self.persist_one(remote, scope, delta, uid, &cipher).await {
                Ok(InsertOutcome::Inserted) => report.saved += 1,
                Ok(InsertOutcome::Duplicate) => {
                    debug!(uid, "Message already stored, recorded location only");
                    report.skipped += 1;
                }
                Err(e) if e.is_connection_loss() => return Err(e),
                Err(e) => {
                    warn!(uid, error = %e, category = %e.category(), "Failed to persist message");
                    report.errors.push(SyncIssue::message(&delta.folder, uid, &e));
                }
            }

            let processed = done + 1;
            if processed % self.progress_every == 0 || processed == total {
                sink.emit(
                    ProgressEvent::new(Phase::Fetch, "messages persisted")
                        .folder(&delta.folder)
                        .counts(processed, total),
                )
                .await;
            }
        }

        debug!(
            saved = report.saved,
            skipped = report.skipped,
            failed = report.errors.len(),
            "Delta persisted"
        );
        Ok(report)
    }

    async fn persist_one(
        &self,
        remote: &mut dyn MailRemote,
        scope: &Scope,
        delta: &Delta,
        uid: u32,
        cipher: &MessageCipher,
    ) -> Result<InsertOutcome> {
        let raw = remote.fetch_full(uid).await?;
        if raw.is_empty() {
            return Err(Error::MessageUnavailable { uid });
        }

        let headers = parser::summarize_headers(&raw);
        let message = RawMessage {
            dedup_key: dedup_key(headers.message_id.as_deref(), &raw),
            location: MessageLocation {
                folder: delta.folder.clone(),
                uid_validity: delta.uid_validity,
                uid,
            },
            sealed_body: cipher.seal(&raw)?,
            sealed_subject: headers
                .subject
                .as_deref()
                .map(|s| cipher.seal(s.as_bytes()))
                .transpose()?,
            sealed_from: headers
                .from
                .as_deref()
                .map(|s| cipher.seal(s.as_bytes()))
                .transpose()?,
            size: raw.len() as u64,
            flags: delta.flags.get(&uid).cloned().unwrap_or_default(),
            stored_at: Utc::now(),
        };

        self.messages.insert_message(scope, message).await
    }
}

impl std::fmt::Debug for RawMessagePersister<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RawMessagePersister")
            .field("progress_every", &self.progress_every)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Account, FetchFilter, MessageFlags};
    use crate::progress::CollectingSink;
    use crate::remote::{Connector, MemoryConnector, MemoryMailServer};
    use crate::store::MemoryStore;
    use crate::sync::DeltaFetcher;

    fn account() -> Account {
        Account::new("acct", "owner", "user@example.com")
    }

    fn raw(n: u32) -> Vec<u8> {
        format!("Message-ID: <{n}@example.com>\r\nSubject: message {n}\r\nFrom: a@example.com\r\n\r\nbody {n}")
            .into_bytes()
    }

    #[tokio::test]
    async fn test_persists_sealed_messages() {
        let server = MemoryMailServer::new();
        let acct = account();
        for uid in 1..=3 {
            server.insert(&acct.id, "INBOX", uid, raw(uid));
        }
        let store = MemoryStore::new();
        let key = EncryptionKey::generate();
        let sink = CollectingSink::new();
        let mut remote = MemoryConnector::new(server.clone()).connect(&acct).await.unwrap();

        let delta = DeltaFetcher::new(&store, &store)
            .compute_delta(remote.as_mut(), &acct.scope(), "INBOX", &FetchFilter::default())
            .await
            .unwrap();
        let report = RawMessagePersister::new(&store)
            .fetch_and_persist(remote.as_mut(), &acct.scope(), &delta, &key, &sink)
            .await
            .unwrap();

        assert_eq!(report.saved, 3);
        assert_eq!(report.skipped, 0);
        assert_eq!(store.count_messages(&acct.scope()).await.unwrap(), 3);

        let stored = store
            .message(&acct.scope(), &dedup_key(Some("2@example.com"), b""))
            .await
            .unwrap()
            .unwrap();
        let cipher = MessageCipher::new(&key).unwrap();
        assert_eq!(cipher.open(&stored.sealed_body).unwrap(), raw(2));
        assert_eq!(
            cipher.open(stored.sealed_subject.as_deref().unwrap()).unwrap(),
            b"message 2"
        );
        assert!(!server.flags(&acct.id, "INBOX", 2).unwrap().is_seen());
        assert_eq!(sink.events().last().unwrap().processed, Some(3));
    }

    #[tokio::test]
    async fn test_duplicates_across_folders_are_skipped() {
        let server = MemoryMailServer::new();
        let acct = account();
        server.insert(&acct.id, "INBOX", 1, raw(1));
        server.insert(&acct.id, "Archive", 8, raw(1));
        let store = MemoryStore::new();
        let key = EncryptionKey::generate();
        let mut remote = MemoryConnector::new(server).connect(&acct).await.unwrap();

        let mut reports = Vec::new();
        for folder in ["INBOX", "Archive"] {
            let delta = DeltaFetcher::new(&store, &store)
                .compute_delta(remote.as_mut(), &acct.scope(), folder, &FetchFilter::default())
                .await
                .unwrap();
            reports.push(
                RawMessagePersister::new(&store)
                    .fetch_and_persist(remote.as_mut(), &acct.scope(), &delta, &key, &CollectingSink::new())
                    .await
                    .unwrap(),
            );
        }

        assert_eq!(reports[0].saved, 1);
        assert_eq!(reports[1].skipped, 1);
        assert_eq!(store.count_messages(&acct.scope()).await.unwrap(), 1);
        assert!(store
            .persisted_uids(&acct.scope(), "Archive", 1)
            .await
            .unwrap()
            .contains(&8));
    }

    #[tokio::test]
    async fn test_failing_message_is_contained() {
        let server = MemoryMailServer::new();
        let acct = account();
        for uid in 1..=3 {
            server.insert(&acct.id, "INBOX", uid, raw(uid));
        }
        server.fail_message(&acct.id, "INBOX", 2);
        let store = MemoryStore::new();
        let mut remote = MemoryConnector::new(server).connect(&acct).await.unwrap();

        let delta = DeltaFetcher::new(&store, &store)
            .compute_delta(remote.as_mut(), &acct.scope(), "INBOX", &FetchFilter::default())
            .await
            .unwrap();
        let report = RawMessagePersister::new(&store)
            .fetch_and_persist(
                remote.as_mut(),
                &acct.scope(),
                &delta,
                &EncryptionKey::generate(),
                &CollectingSink::new(),
            )
            .await
            .unwrap();

        assert_eq!(report.saved, 2);
        assert_eq!(report.errors.len(), 1);
        assert_eq!(report.errors[0].uid, Some(2));
    }

    #[tokio::test]
    async fn test_mirrored_flags_are_stored() {
        let server = MemoryMailServer::new();
        let acct = account();
        let flagged: MessageFlags = [MessageFlags::FLAGGED].into_iter().collect();
        server.insert_with_flags(&acct.id, "INBOX", 4, raw(4), flagged.clone());
        let store = MemoryStore::new();
        let mut remote = MemoryConnector::new(server).connect(&acct).await.unwrap();

        crate::sync::StateReconciler::new(&store, &store)
            .reconcile(remote.as_mut(), &acct.scope(), &["INBOX".to_string()], &crate::progress::NullSink)
            .await
            .unwrap();
        let delta = DeltaFetcher::new(&store, &store)
            .compute_delta(remote.as_mut(), &acct.scope(), "INBOX", &FetchFilter::default())
            .await
            .unwrap();
        RawMessagePersister::new(&store)
            .fetch_and_persist(
                remote.as_mut(),
                &acct.scope(),
                &delta,
                &EncryptionKey::generate(),
                &crate::progress::NullSink,
            )
            .await
            .unwrap();

        let stored = store
            .message(&acct.scope(), &dedup_key(Some("4@example.com"), b""))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.flags, flagged);
    }
}
