//! End-to-end tests of the sync pipeline against the in-process mail server.

use async_trait::async_trait;
use email_mirror::{
    Account, AccountId, CollectingSink, ConflictPolicy, Connector, Delta, DeltaFetcher,
    EncryptionKey, Error, ErrorCategory, FetchFilter, JobId, JobState, JobStatus, JobStore,
    JobTimeouts, KeyRef, KeyResolver, KeyToken, MailRemote, MemoryConnector, MemoryMailServer,
    MemoryStore, MessageCipher, MessageFlags, MessageStore, MirrorStore, NullSink, OwnerId, Phase,
    PostProcessor, RawMessagePersister, Scope, SqliteStore, StateReconciler, Store, SyncConfig,
    SyncOptions, SyncOrchestrator, SyncStats,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

// ─────────────────────────────────────────────────────────────────────────────
// Test Helpers
// ─────────────────────────────────────────────────────────────────────────────

const OWNER: &str = "owner-1";
const ACCOUNT: &str = "acct-1";

fn account() -> Account {
    Account::new(ACCOUNT, OWNER, "user@example.com")
}

fn account_id() -> AccountId {
    AccountId::from(ACCOUNT)
}

fn message(n: u32) -> Vec<u8> {
    format!(
        "Message-ID: <msg-{n}@example.com>\r\n\
         From: Sender {n} <sender{n}@example.com>\r\n\
         Subject: Message {n}\r\n\
         Date: Tue, 1 Jul 2025 10:00:00 +0000\r\n\
         \r\n\
         Body of message {n}\r\n"
    )
    .into_bytes()
}

fn seen() -> MessageFlags {
    [MessageFlags::SEEN].into_iter().collect()
}

fn fast_retries(max_attempts: u32) -> SyncConfig {
    SyncConfig::builder()
        .workers(2)
        .max_attempts(max_attempts)
        .base_delay(Duration::from_millis(10))
        .requeue_delay(Duration::from_millis(5))
        .build()
        .unwrap()
}

struct Harness<S: Store + 'static> {
    store: Arc<S>,
    server: MemoryMailServer,
    orchestrator: SyncOrchestrator<S>,
}

impl<S: Store + 'static> Harness<S> {
    fn start(store: Arc<S>, config: SyncConfig) -> Self {
        let server = MemoryMailServer::new();
        let orchestrator = SyncOrchestrator::builder(
            Arc::clone(&store),
            Arc::new(MemoryConnector::new(server.clone())),
        )
        .config(config)
        .start();
        Self {
            store,
            server,
            orchestrator,
        }
    }

    async fn submit(&self, options: SyncOptions) -> JobId {
        self.orchestrator
            .submit(
                OWNER.into(),
                ACCOUNT.into(),
                EncryptionKey::generate().into(),
                options,
            )
            .await
            .unwrap()
    }

    async fn run(&self, options: SyncOptions) -> JobStatus {
        let id = self.submit(options).await;
        self.orchestrator.wait(id).await.unwrap()
    }
}

fn memory_harness(config: SyncConfig) -> Harness<MemoryStore> {
    let store = Arc::new(MemoryStore::new());
    store.add_account(account());
    Harness::start(store, config)
}

fn scope() -> Scope {
    account().scope()
}

// ─────────────────────────────────────────────────────────────────────────────
// Scenarios
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_scenario_a_first_sync_of_inbox() {
    let h = memory_harness(SyncConfig::default());
    for uid in [10, 11, 12] {
        h.server.insert(&account_id(), "INBOX", uid, message(uid));
    }

    let status = h.run(SyncOptions::folders(["INBOX"])).await;

    assert_eq!(status.state, JobState::Succeeded);
    let stats = status.stats.unwrap();
    assert_eq!(stats.folders_scanned, 1);
    assert_eq!(stats.messages_new, 3);
    assert!(stats.errors.is_empty());

    assert_eq!(h.store.folder_state(&scope(), "INBOX").await.unwrap().len(), 3);
    assert_eq!(h.store.count_messages(&scope()).await.unwrap(), 3);

    let mut remote = MemoryConnector::new(h.server.clone())
        .connect(&account())
        .await
        .unwrap();
    let delta = DeltaFetcher::new(h.store.as_ref(), h.store.as_ref())
        .compute_delta(remote.as_mut(), &scope(), "INBOX", &FetchFilter::default())
        .await
        .unwrap();
    assert!(delta.is_empty());

    h.orchestrator.shutdown().await;
}

#[tokio::test]
async fn test_scenario_b_filtered_delta_below_high_water_mark() {
    let server = MemoryMailServer::new();
    let store = MemoryStore::new();
    for uid in [5, 19, 42] {
        server.insert(&account_id(), "INBOX", uid, message(uid));
    }
    server.insert_with_flags(&account_id(), "INBOX", 30, message(30), seen());

    let mut remote = MemoryConnector::new(server.clone())
        .connect(&account())
        .await
        .unwrap();
    let key = EncryptionKey::generate();

    // Earlier runs stored 19 and 30, so the high-water mark is 30.
    let status = remote.select_readonly("INBOX").await.unwrap();
    let earlier = Delta {
        folder: "INBOX".to_string(),
        uid_validity: status.uid_validity,
        uids: vec![19, 30],
        flags: HashMap::new(),
        truncated: 0,
    };
    RawMessagePersister::new(&store)
        .fetch_and_persist(remote.as_mut(), &scope(), &earlier, &key, &NullSink)
        .await
        .unwrap();
    assert_eq!(
        store
            .persisted_uids(&scope(), "INBOX", 1)
            .await
            .unwrap()
            .last()
            .copied(),
        Some(30)
    );

    let fetcher = DeltaFetcher::new(&store, &store);
    let delta = fetcher
        .compute_delta(remote.as_mut(), &scope(), "INBOX", &FetchFilter::unseen())
        .await
        .unwrap();
    assert_eq!(delta.uids, vec![5, 42]);

    let report = RawMessagePersister::new(&store)
        .fetch_and_persist(remote.as_mut(), &scope(), &delta, &key, &NullSink)
        .await
        .unwrap();
    assert_eq!(report.saved, 2);

    let again = fetcher
        .compute_delta(remote.as_mut(), &scope(), "INBOX", &FetchFilter::unseen())
        .await
        .unwrap();
    assert!(again.is_empty());
}

// ─────────────────────────────────────────────────────────────────────────────
// Idempotence and Dedup
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_reconcile_twice_yields_identical_mirror() {
    let server = MemoryMailServer::new();
    let store = MemoryStore::new();
    for uid in 1..=7 {
        server.insert(&account_id(), "INBOX", uid, message(uid));
    }
    let mut remote = MemoryConnector::new(server).connect(&account()).await.unwrap();
    let reconciler = StateReconciler::new(&store, &store).batch_size(3);
    let folders = vec!["INBOX".to_string()];

    reconciler
        .reconcile(remote.as_mut(), &scope(), &folders, &NullSink)
        .await
        .unwrap();
    let first = store.folder_state(&scope(), "INBOX").await.unwrap();
    reconciler
        .reconcile(remote.as_mut(), &scope(), &folders, &NullSink)
        .await
        .unwrap();
    let second = store.folder_state(&scope(), "INBOX").await.unwrap();

    assert_eq!(first.len(), 7);
    assert_eq!(first, second);
}

#[tokio::test]
async fn test_second_job_downloads_nothing() {
    let h = memory_harness(SyncConfig::default());
    for uid in 1..=4 {
        h.server.insert(&account_id(), "INBOX", uid, message(uid));
    }

    let first = h.run(SyncOptions::default()).await;
    let fetches_after_first = h.server.full_fetches();
    let second = h.run(SyncOptions::default()).await;

    assert_eq!(first.stats.unwrap().messages_new, 4);
    let stats = second.stats.unwrap();
    assert_eq!(stats.messages_new, 0);
    assert_eq!(stats.messages_skipped, 0);
    assert_eq!(h.server.full_fetches(), fetches_after_first);
    assert_eq!(h.store.count_messages(&scope()).await.unwrap(), 4);

    h.orchestrator.shutdown().await;
}

#[tokio::test]
async fn test_new_epoch_never_duplicates_messages() {
    let h = memory_harness(SyncConfig::default());
    for uid in 1..=3 {
        h.server.insert(&account_id(), "INBOX", uid, message(uid));
    }
    h.run(SyncOptions::default()).await;

    h.server.set_uid_validity(&account_id(), "INBOX", 99);
    let status = h.run(SyncOptions::default()).await;

    assert_eq!(status.state, JobState::Succeeded);
    let stats = status.stats.unwrap();
    assert_eq!(stats.messages_new, 0);
    assert_eq!(stats.messages_skipped, 3);
    assert_eq!(h.store.count_messages(&scope()).await.unwrap(), 3);
    assert_eq!(h.store.folder_validity(&scope(), "INBOX").await.unwrap(), Some(99));

    h.orchestrator.shutdown().await;
}

#[tokio::test]
async fn test_new_message_after_first_sync_is_fetched_alone() {
    let h = memory_harness(SyncConfig::default());
    for uid in 1..=3 {
        h.server.insert(&account_id(), "INBOX", uid, message(uid));
    }
    h.run(SyncOptions::default()).await;
    let before = h.server.full_fetches();

    h.server.append(&account_id(), "INBOX", message(4));
    let status = h.run(SyncOptions::default()).await;

    assert_eq!(status.stats.unwrap().messages_new, 1);
    assert_eq!(h.server.full_fetches(), before + 1);

    h.orchestrator.shutdown().await;
}

#[tokio::test]
async fn test_flag_changes_reach_stored_messages() {
    let h = memory_harness(SyncConfig::default());
    h.server.insert(&account_id(), "INBOX", 1, message(1));
    h.run(SyncOptions::default()).await;

    h.server.set_flags(&account_id(), "INBOX", 1, seen());
    h.run(SyncOptions::default()).await;

    let key = email_mirror::dedup_key(Some("msg-1@example.com"), b"");
    let stored = h.store.message(&scope(), &key).await.unwrap().unwrap();
    assert!(stored.flags.is_seen());

    h.orchestrator.shutdown().await;
}

#[tokio::test]
async fn test_fetching_never_marks_messages_read() {
    let h = memory_harness(SyncConfig::default());
    h.server.insert(&account_id(), "INBOX", 1, message(1));

    h.run(SyncOptions::default()).await;

    assert!(!h.server.flags(&account_id(), "INBOX", 1).unwrap().is_seen());
    h.orchestrator.shutdown().await;
}

#[tokio::test]
async fn test_stored_messages_are_sealed() {
    let store = Arc::new(MemoryStore::new());
    store.add_account(account());
    let h = Harness::start(store, SyncConfig::default());
    h.server.insert(&account_id(), "INBOX", 1, message(1));
    let key = EncryptionKey::from_bytes(&[7u8; 32]).unwrap();

    let id = h
        .orchestrator
        .submit(OWNER.into(), ACCOUNT.into(), KeyRef::Direct(key), SyncOptions::default())
        .await
        .unwrap();
    h.orchestrator.wait(id).await.unwrap();

    let dedup = email_mirror::dedup_key(Some("msg-1@example.com"), b"");
    let stored = h.store.message(&scope(), &dedup).await.unwrap().unwrap();
    let plaintext = message(1);
    assert!(!stored
        .sealed_body
        .windows(plaintext.len())
        .any(|w| w == plaintext.as_slice()));

    let cipher = MessageCipher::new(&EncryptionKey::from_bytes(&[7u8; 32]).unwrap()).unwrap();
    assert_eq!(cipher.open(&stored.sealed_body).unwrap(), plaintext);

    h.orchestrator.shutdown().await;
}

#[tokio::test]
async fn test_message_cap_keeps_newest() {
    let h = memory_harness(SyncConfig::default());
    for uid in 1..=10 {
        h.server.insert(&account_id(), "INBOX", uid, message(uid));
    }

    let status = h.run(SyncOptions::default().with_message_cap(4)).await;

    let stats = status.stats.unwrap();
    assert_eq!(stats.messages_new, 4);
    assert_eq!(stats.truncated, 6);
    let persisted = h.store.persisted_uids(&scope(), "INBOX", 1).await.unwrap();
    assert_eq!(persisted.into_iter().collect::<Vec<_>>(), vec![7, 8, 9, 10]);

    h.orchestrator.shutdown().await;
}

// ─────────────────────────────────────────────────────────────────────────────
// Failure Containment
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_one_failing_folder_among_three() {
    let h = memory_harness(SyncConfig::default());
    for folder in ["INBOX", "Archive", "Broken"] {
        h.server.insert(&account_id(), folder, 1, message(folder.len() as u32));
    }
    h.server.fail_folder(&account_id(), "Broken");

    let status = h.run(SyncOptions::default()).await;

    assert_eq!(status.state, JobState::Succeeded);
    let stats = status.stats.unwrap();
    assert_eq!(stats.folders_scanned, 2);
    assert_eq!(stats.errors.len(), 1);
    assert_eq!(stats.errors[0].folder.as_deref(), Some("Broken"));
    assert_eq!(h.store.folder_state(&scope(), "INBOX").await.unwrap().len(), 1);
    assert_eq!(h.store.folder_state(&scope(), "Archive").await.unwrap().len(), 1);
    assert!(h.store.folder_state(&scope(), "Broken").await.unwrap().is_empty());

    h.orchestrator.shutdown().await;
}

#[tokio::test]
async fn test_one_failing_message_is_recorded() {
    let h = memory_harness(SyncConfig::default());
    for uid in 1..=3 {
        h.server.insert(&account_id(), "INBOX", uid, message(uid));
    }
    h.server.fail_message(&account_id(), "INBOX", 2);

    let status = h.run(SyncOptions::default()).await;

    assert_eq!(status.state, JobState::Succeeded);
    let stats = status.stats.unwrap();
    assert_eq!(stats.messages_new, 2);
    assert_eq!(stats.errors.len(), 1);
    assert_eq!(stats.errors[0].uid, Some(2));

    h.orchestrator.shutdown().await;
}

#[tokio::test]
async fn test_zero_progress_fails_the_job() {
    let h = memory_harness(fast_retries(1));
    h.server.insert(&account_id(), "Broken", 1, message(1));
    h.server.fail_folder(&account_id(), "Broken");

    let status = h.run(SyncOptions::default()).await;

    assert_eq!(status.state, JobState::Failed);
    let failure = status.error.unwrap();
    assert!(failure.retryable);
    assert_eq!(failure.category, ErrorCategory::Protocol);

    h.orchestrator.shutdown().await;
}

// ─────────────────────────────────────────────────────────────────────────────
// Authorization and Keys
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_foreign_account_fails_without_side_effects() {
    let h = memory_harness(SyncConfig::default());
    h.server.insert(&account_id(), "INBOX", 1, message(1));

    let id = h
        .orchestrator
        .submit(
            OwnerId::from("intruder"),
            ACCOUNT.into(),
            EncryptionKey::generate().into(),
            SyncOptions::default(),
        )
        .await
        .unwrap();
    let status = h.orchestrator.wait(id).await.unwrap();

    assert_eq!(status.state, JobState::Failed);
    assert_eq!(status.retry_count, 0);
    let failure = status.error.unwrap();
    assert_eq!(failure.category, ErrorCategory::Authorization);
    assert!(!failure.retryable);

    assert_eq!(h.server.connects(), 0);
    assert!(h.store.folder_state(&scope(), "INBOX").await.unwrap().is_empty());
    assert_eq!(h.store.count_messages(&scope()).await.unwrap(), 0);
    assert!(!h.orchestrator.holds_key(id));

    h.orchestrator.shutdown().await;
}

struct CountingResolver {
    key: [u8; 32],
    calls: AtomicUsize,
}

#[async_trait]
impl KeyResolver for CountingResolver {
    async fn resolve(&self, _owner: &OwnerId, token: &KeyToken) -> email_mirror::Result<EncryptionKey> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if token.expose() == "valid-token" {
            EncryptionKey::from_bytes(&self.key)
        } else {
            Err(Error::KeyUnavailable {
                reason: "token expired".to_string(),
            })
        }
    }
}

fn resolver_harness(resolver: Arc<CountingResolver>, config: SyncConfig) -> Harness<MemoryStore> {
    let store = Arc::new(MemoryStore::new());
    store.add_account(account());
    let server = MemoryMailServer::new();
    let orchestrator = SyncOrchestrator::builder(
        Arc::clone(&store),
        Arc::new(MemoryConnector::new(server.clone())),
    )
    .config(config)
    .resolver(resolver)
    .start();
    Harness {
        store,
        server,
        orchestrator,
    }
}

#[tokio::test]
async fn test_deferred_key_is_resolved_once_and_wiped() {
    let resolver = Arc::new(CountingResolver {
        key: [3u8; 32],
        calls: AtomicUsize::new(0),
    });
    let h = resolver_harness(Arc::clone(&resolver), fast_retries(3));
    h.server.insert(&account_id(), "INBOX", 1, message(1));
    h.server.fail_next_connects(1);

    let id = h
        .orchestrator
        .submit(
            OWNER.into(),
            ACCOUNT.into(),
            KeyRef::Deferred(KeyToken::new("valid-token")),
            SyncOptions::default(),
        )
        .await
        .unwrap();
    let status = h.orchestrator.wait(id).await.unwrap();

    assert_eq!(status.state, JobState::Succeeded);
    assert_eq!(status.retry_count, 1);
    assert_eq!(resolver.calls.load(Ordering::SeqCst), 1);
    assert!(!h.orchestrator.holds_key(id));

    h.orchestrator.shutdown().await;
}

#[tokio::test]
async fn test_unavailable_key_fails_before_connecting() {
    let resolver = Arc::new(CountingResolver {
        key: [3u8; 32],
        calls: AtomicUsize::new(0),
    });
    let h = resolver_harness(resolver, SyncConfig::default());
    h.server.insert(&account_id(), "INBOX", 1, message(1));

    let id = h
        .orchestrator
        .submit(
            OWNER.into(),
            ACCOUNT.into(),
            KeyRef::Deferred(KeyToken::new("expired-token")),
            SyncOptions::default(),
        )
        .await
        .unwrap();
    let status = h.orchestrator.wait(id).await.unwrap();

    assert_eq!(status.state, JobState::Failed);
    let failure = status.error.unwrap();
    assert_eq!(failure.category, ErrorCategory::Authorization);
    assert!(!failure.message.contains("expired-token"));
    assert_eq!(h.server.connects(), 0);

    h.orchestrator.shutdown().await;
}

#[tokio::test]
async fn test_key_never_leaks_into_progress_or_errors() {
    let h = memory_harness(fast_retries(1));
    h.server.insert(&account_id(), "INBOX", 1, message(1));
    h.server.fail_message(&account_id(), "INBOX", 1);
    let key = EncryptionKey::from_bytes(&[0xAB; 32]).unwrap();
    let debug = format!("{key:?}");

    let id = h
        .orchestrator
        .submit(OWNER.into(), ACCOUNT.into(), key.into(), SyncOptions::default())
        .await
        .unwrap();
    h.orchestrator.wait(id).await.unwrap();

    let history = serde_json::to_string(&h.orchestrator.progress(id).await.unwrap()).unwrap();
    let record = serde_json::to_string(&h.store.job(id).await.unwrap()).unwrap();
    for text in [&history, &record, &debug] {
        assert!(!text.to_lowercase().contains("abababab"));
    }

    h.orchestrator.shutdown().await;
}

// ─────────────────────────────────────────────────────────────────────────────
// Retry and Timeouts
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn test_retry_bound_then_failed() {
    let config = SyncConfig::builder()
        .workers(1)
        .max_attempts(3)
        .base_delay(Duration::from_secs(1))
        .build()
        .unwrap();
    let h = memory_harness(config);
    h.server.insert(&account_id(), "INBOX", 1, message(1));
    h.server.fail_next_connects(100);

    let status = h.run(SyncOptions::default()).await;

    assert_eq!(status.state, JobState::Failed);
    assert_eq!(status.attempts, 3);
    assert_eq!(status.retry_count, 2);
    assert_eq!(h.server.connects(), 3);
    let failure = status.error.unwrap();
    assert_eq!(failure.category, ErrorCategory::Network);
    assert!(!h.orchestrator.holds_key(status.id));

    h.orchestrator.shutdown().await;
}

#[tokio::test]
async fn test_transient_failure_recovers_on_retry() {
    let h = memory_harness(fast_retries(3));
    h.server.insert(&account_id(), "INBOX", 1, message(1));
    h.server.fail_next_connects(2);

    let status = h.run(SyncOptions::default()).await;

    assert_eq!(status.state, JobState::Succeeded);
    assert_eq!(status.retry_count, 2);
    assert_eq!(status.stats.unwrap().messages_new, 1);

    h.orchestrator.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_hard_ceiling_times_out_job() {
    let config = SyncConfig::builder()
        .workers(1)
        .max_attempts(1)
        .job_timeouts(JobTimeouts {
            soft: Duration::from_secs(5),
            hard: Duration::from_secs(20),
        })
        .build()
        .unwrap();
    let h = memory_harness(config);
    h.server.insert(&account_id(), "INBOX", 1, message(1));
    h.server.set_latency(Duration::from_secs(60));

    let status = h.run(SyncOptions::default()).await;

    assert_eq!(status.state, JobState::Failed);
    let failure = status.error.unwrap();
    assert_eq!(failure.category, ErrorCategory::Timeout);
    assert!(failure.retryable);

    let history = h.orchestrator.progress(status.id).await.unwrap();
    assert!(history
        .iter()
        .any(|event| event.message.contains("soft time limit")));

    h.orchestrator.shutdown().await;
}

// ─────────────────────────────────────────────────────────────────────────────
// Cancellation and Concurrency
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_cancel_queued_job_has_no_side_effects() {
    let store = Arc::new(MemoryStore::new());
    store.add_account(account());
    store.add_account(Account::new("acct-2", OWNER, "other@example.com"));
    let config = SyncConfig::builder().workers(1).build().unwrap();
    let h = Harness::start(store, config);
    h.server.insert(&account_id(), "INBOX", 1, message(1));
    h.server.insert(&AccountId::from("acct-2"), "INBOX", 1, message(2));
    h.server.set_latency(Duration::from_millis(20));

    let busy = h.submit(SyncOptions::default()).await;
    let queued = h
        .orchestrator
        .submit(
            OWNER.into(),
            "acct-2".into(),
            EncryptionKey::generate().into(),
            SyncOptions::default(),
        )
        .await
        .unwrap();

    assert_eq!(h.orchestrator.cancel(queued).await.unwrap(), JobState::Cancelled);
    assert!(!h.orchestrator.holds_key(queued));
    assert_eq!(h.orchestrator.wait(busy).await.unwrap().state, JobState::Succeeded);

    let status = h.orchestrator.wait(queued).await.unwrap();
    assert_eq!(status.state, JobState::Cancelled);
    assert_eq!(status.attempts, 0);
    let other = Scope::new(OWNER, "acct-2");
    assert!(h.store.folder_state(&other, "INBOX").await.unwrap().is_empty());

    h.orchestrator.shutdown().await;
}

#[tokio::test]
async fn test_cancel_running_job_stops_between_messages() {
    let h = memory_harness(SyncConfig::default());
    for uid in 1..=40 {
        h.server.insert(&account_id(), "INBOX", uid, message(uid));
    }
    h.server.set_latency(Duration::from_millis(10));

    let id = h.submit(SyncOptions::default()).await;
    loop {
        let status = h.orchestrator.status(id).await.unwrap();
        if status.state == JobState::Running && status.phase == Phase::Fetch {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    assert_eq!(h.orchestrator.cancel(id).await.unwrap(), JobState::Running);
    let status = h.orchestrator.wait(id).await.unwrap();

    assert_eq!(status.state, JobState::Cancelled);
    assert!(h.store.count_messages(&scope()).await.unwrap() < 40);
    assert!(!h.orchestrator.holds_key(id));

    // Cancelling a finished job changes nothing.
    assert_eq!(h.orchestrator.cancel(id).await.unwrap(), JobState::Cancelled);
    h.orchestrator.shutdown().await;
}

#[tokio::test]
async fn test_same_account_jobs_never_overlap() {
    let config = SyncConfig::builder()
        .workers(2)
        .conflict_policy(ConflictPolicy::Serialize)
        .requeue_delay(Duration::from_millis(5))
        .build()
        .unwrap();
    let h = memory_harness(config);
    for uid in 1..=3 {
        h.server.insert(&account_id(), "INBOX", uid, message(uid));
    }
    h.server.set_latency(Duration::from_millis(5));

    let first = h.submit(SyncOptions::default()).await;
    let second = h.submit(SyncOptions::default()).await;
    assert_eq!(h.orchestrator.wait(first).await.unwrap().state, JobState::Succeeded);
    assert_eq!(h.orchestrator.wait(second).await.unwrap().state, JobState::Succeeded);

    let a = h.store.job(first).await.unwrap().unwrap();
    let b = h.store.job(second).await.unwrap().unwrap();
    let (a_start, a_end) = (a.started_at.unwrap(), a.finished_at.unwrap());
    let (b_start, b_end) = (b.started_at.unwrap(), b.finished_at.unwrap());
    assert!(a_end <= b_start || b_end <= a_start);
    assert_eq!(h.store.count_messages(&scope()).await.unwrap(), 3);

    h.orchestrator.shutdown().await;
}

// ─────────────────────────────────────────────────────────────────────────────
// Post-processing
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Default)]
struct RecordingPostProcessor {
    calls: AtomicUsize,
    fail: bool,
}

#[async_trait]
impl PostProcessor for RecordingPostProcessor {
    async fn process(&self, _job: JobId, scope: &Scope, stats: &SyncStats) -> email_mirror::Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        assert_eq!(scope.account.as_str(), ACCOUNT);
        assert_eq!(stats.messages_new, 1);
        if self.fail {
            return Err(Error::Server {
                message: "classifier unavailable".to_string(),
            });
        }
        Ok(())
    }
}

async fn run_with_post_processor(fail: bool) -> (JobStatus, usize) {
    let store = Arc::new(MemoryStore::new());
    store.add_account(account());
    let server = MemoryMailServer::new();
    server.insert(&account_id(), "INBOX", 1, message(1));
    let post = Arc::new(RecordingPostProcessor {
        fail,
        ..RecordingPostProcessor::default()
    });
    let orchestrator = SyncOrchestrator::builder(store, Arc::new(MemoryConnector::new(server)))
        .post_processor(Arc::clone(&post) as Arc<dyn PostProcessor>)
        .start();

    let id = orchestrator
        .submit(OWNER.into(), ACCOUNT.into(), EncryptionKey::generate().into(), SyncOptions::default())
        .await
        .unwrap();
    let status = orchestrator.wait(id).await.unwrap();
    orchestrator.shutdown().await;
    (status, post.calls.load(Ordering::SeqCst))
}

#[tokio::test]
async fn test_post_processor_runs_after_success() {
    let (status, calls) = run_with_post_processor(false).await;
    assert_eq!(status.state, JobState::Succeeded);
    assert_eq!(calls, 1);
    assert!(status.stats.unwrap().errors.is_empty());
}

#[tokio::test]
async fn test_post_processor_failure_is_not_fatal() {
    let (status, calls) = run_with_post_processor(true).await;
    assert_eq!(status.state, JobState::Succeeded);
    assert_eq!(calls, 1);
    let stats = status.stats.unwrap();
    assert_eq!(stats.errors.len(), 1);
    assert!(stats.errors[0].folder.is_none());
}

// ─────────────────────────────────────────────────────────────────────────────
// SQLite Store
// ─────────────────────────────────────────────────────────────────────────────

async fn sqlite_harness() -> Harness<SqliteStore> {
    let store = SqliteStore::in_memory().await.unwrap();
    store.add_account(&account()).await.unwrap();
    Harness::start(Arc::new(store), SyncConfig::default())
}

#[tokio::test]
async fn test_sqlite_scenario_a_and_rerun() {
    let h = sqlite_harness().await;
    for uid in [10, 11, 12] {
        h.server.insert(&account_id(), "INBOX", uid, message(uid));
    }

    let first = h.run(SyncOptions::folders(["INBOX"])).await;
    let second = h.run(SyncOptions::folders(["INBOX"])).await;

    assert_eq!(first.state, JobState::Succeeded);
    let stats = first.stats.unwrap();
    assert_eq!(stats.folders_scanned, 1);
    assert_eq!(stats.messages_new, 3);
    assert!(stats.errors.is_empty());
    assert_eq!(second.stats.unwrap().messages_new, 0);
    assert_eq!(h.store.folder_state(&scope(), "INBOX").await.unwrap().len(), 3);
    assert_eq!(h.store.count_messages(&scope()).await.unwrap(), 3);

    let history = h.orchestrator.progress(first.id).await.unwrap();
    assert_eq!(history.first().map(|e| e.phase), Some(Phase::Queued));
    assert_eq!(history.last().map(|e| e.phase), Some(Phase::Done));

    h.orchestrator.shutdown().await;
}

#[tokio::test]
async fn test_sqlite_filtered_job() {
    let h = sqlite_harness().await;
    for uid in [5, 19, 42] {
        h.server.insert(&account_id(), "INBOX", uid, message(uid));
    }
    h.server.insert_with_flags(&account_id(), "INBOX", 30, message(30), seen());

    let status = h
        .run(SyncOptions::folders(["INBOX"]).with_filter(FetchFilter::unseen()))
        .await;

    assert_eq!(status.stats.unwrap().messages_new, 3);
    let persisted = h.store.persisted_uids(&scope(), "INBOX", 1).await.unwrap();
    assert_eq!(persisted.into_iter().collect::<Vec<_>>(), vec![5, 19, 42]);

    h.orchestrator.shutdown().await;
}

#[tokio::test]
async fn test_progress_sink_sees_folder_events() {
    let server = MemoryMailServer::new();
    let store = MemoryStore::new();
    server.insert(&account_id(), "INBOX", 1, message(1));
    server.insert(&account_id(), "Sent", 1, message(2));
    let mut remote = MemoryConnector::new(server).connect(&account()).await.unwrap();
    let sink = CollectingSink::new();

    StateReconciler::new(&store, &store)
        .reconcile(
            remote.as_mut(),
            &scope(),
            &["INBOX".to_string(), "Sent".to_string()],
            &sink,
        )
        .await
        .unwrap();

    let completes: Vec<_> = sink
        .events()
        .into_iter()
        .filter(|e| e.message == "folder complete")
        .collect();
    assert_eq!(completes.len(), 2);
    assert_eq!(completes[1].folder.as_deref(), Some("Sent"));
    assert_eq!(completes[1].folder_index, Some(2));
    assert_eq!(completes[1].folder_total, Some(2));
    assert!(completes.iter().all(|e| e.phase == Phase::StateSync));
}
