//! Tests against a real IMAP server.
//!
//! These tests are ignored by default. To run them:
//!
//! ```bash
//! # Set environment variables (or put them in a .env file)
//! export EMAIL_MIRROR_TEST_EMAIL="your@email.com"
//! export EMAIL_MIRROR_TEST_PASSWORD="your-app-password"
//! export EMAIL_MIRROR_TEST_HOST="imap.example.com"
//!
//! # Optional
//! export EMAIL_MIRROR_TEST_PORT="993"
//! export EMAIL_MIRROR_TEST_PROXY_HOST="proxy.example.com"
//! export EMAIL_MIRROR_TEST_PROXY_PORT="1080"
//!
//! cargo test --features integration-tests -- --ignored
//! ```
//!
//! Nothing here modifies the mailbox: folders are examined read-only and
//! bodies are fetched with `BODY.PEEK[]`.

use email_mirror::{
    Account, Connector, EncryptionKey, FetchFilter, ImapConnector, ImapEndpoint, JobState,
    MailRemote, MessageStore, SearchCriteria, Socks5Proxy, SqliteStore, SyncConfig, SyncOptions,
    SyncOrchestrator, TimeoutConfig,
};
use std::env;
use std::sync::Arc;

// ─────────────────────────────────────────────────────────────────────────────
// Test Configuration Helpers
// ─────────────────────────────────────────────────────────────────────────────

const ACCOUNT: &str = "live-account";
const OWNER: &str = "live-owner";

fn get_test_proxy() -> Option<Socks5Proxy> {
    let host = env::var("EMAIL_MIRROR_TEST_PROXY_HOST").ok()?;
    let port: u16 = env::var("EMAIL_MIRROR_TEST_PROXY_PORT").ok()?.parse().ok()?;

    let proxy = match (
        env::var("EMAIL_MIRROR_TEST_PROXY_USER").ok(),
        env::var("EMAIL_MIRROR_TEST_PROXY_PASS").ok(),
    ) {
        (Some(user), Some(pass)) => Socks5Proxy::with_auth(&host, port, user, pass),
        _ => Socks5Proxy::new(host, port),
    };

    Some(proxy)
}

fn get_test_endpoint() -> Option<ImapEndpoint> {
    dotenvy::dotenv().ok();
    let email = env::var("EMAIL_MIRROR_TEST_EMAIL").ok()?;
    let password = env::var("EMAIL_MIRROR_TEST_PASSWORD").ok()?;
    let host = env::var("EMAIL_MIRROR_TEST_HOST").ok()?;

    let mut builder = ImapEndpoint::builder().email(email).password(password).host(host);
    if let Some(port) = env::var("EMAIL_MIRROR_TEST_PORT")
        .ok()
        .and_then(|p| p.parse().ok())
    {
        builder = builder.port(port);
    }
    if let Some(proxy) = get_test_proxy() {
        builder = builder.proxy(proxy);
    }

    builder.build().ok()
}

fn live_account(endpoint: &ImapEndpoint) -> Account {
    Account::new(ACCOUNT, OWNER, endpoint.email())
}

fn connector(endpoint: ImapEndpoint) -> ImapConnector {
    ImapConnector::new(TimeoutConfig::default()).with_endpoint(ACCOUNT.into(), endpoint)
}

// ─────────────────────────────────────────────────────────────────────────────
// Remote Tests
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
#[ignore = "requires real IMAP server"]
async fn test_connect_list_and_logout() {
    let endpoint = get_test_endpoint().expect("Test endpoint from environment variables");
    let account = live_account(&endpoint);

    let mut remote = connector(endpoint)
        .connect(&account)
        .await
        .expect("Failed to connect");

    let folders = remote.list_folders().await.expect("Failed to list folders");
    assert!(folders.iter().any(|f| f.eq_ignore_ascii_case("INBOX")));

    remote.logout().await.expect("Failed to logout");
}

#[tokio::test]
#[ignore = "requires real IMAP server"]
async fn test_examine_search_and_envelopes() {
    let endpoint = get_test_endpoint().expect("Test endpoint from environment variables");
    let account = live_account(&endpoint);
    let mut remote = connector(endpoint)
        .connect(&account)
        .await
        .expect("Failed to connect");

    let status = remote
        .select_readonly("INBOX")
        .await
        .expect("Failed to examine INBOX");
    assert!(status.uid_validity > 0);

    let uids = remote
        .search(&SearchCriteria::all())
        .await
        .expect("Failed to search");
    assert!(uids.windows(2).all(|w| w[0] < w[1]));

    let recent: Vec<u32> = uids.iter().rev().take(5).copied().collect();
    let envelopes = remote
        .fetch_envelopes(&recent)
        .await
        .expect("Failed to fetch envelopes");
    assert_eq!(envelopes.len(), recent.len());

    remote.logout().await.expect("Failed to logout");
}

#[tokio::test]
#[ignore = "requires real IMAP server"]
async fn test_full_fetch_keeps_unread_messages_unread() {
    let endpoint = get_test_endpoint().expect("Test endpoint from environment variables");
    let account = live_account(&endpoint);
    let mut remote = connector(endpoint)
        .connect(&account)
        .await
        .expect("Failed to connect");

    remote
        .select_readonly("INBOX")
        .await
        .expect("Failed to examine INBOX");
    let unread = remote
        .search(&FetchFilter::unseen().criteria())
        .await
        .expect("Failed to search");

    let Some(&uid) = unread.last() else {
        println!("No unread messages, nothing to check");
        return;
    };

    let body = remote.fetch_full(uid).await.expect("Failed to fetch body");
    assert!(!body.is_empty());

    let after = remote
        .fetch_envelopes(&[uid])
        .await
        .expect("Failed to fetch envelope");
    assert!(!after[0].flags.is_seen());

    remote.logout().await.expect("Failed to logout");
}

// ─────────────────────────────────────────────────────────────────────────────
// Pipeline Tests
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
#[ignore = "requires real IMAP server"]
async fn test_mirror_inbox_into_sqlite() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();

    let endpoint = get_test_endpoint().expect("Test endpoint from environment variables");
    let account = live_account(&endpoint);
    let store = Arc::new(SqliteStore::in_memory().await.expect("Failed to open store"));
    store.add_account(&account).await.expect("Failed to add account");

    let config = SyncConfig::builder()
        .workers(1)
        .message_cap(Some(20))
        .build()
        .expect("valid config");
    let orchestrator = SyncOrchestrator::builder(Arc::clone(&store), Arc::new(connector(endpoint)))
        .config(config)
        .start();

    let options = SyncOptions::folders(["INBOX"]);
    let first = orchestrator
        .submit(OWNER.into(), ACCOUNT.into(), EncryptionKey::generate().into(), options.clone())
        .await
        .expect("Failed to submit");
    let status = orchestrator.wait(first).await.expect("Failed to wait");
    assert_eq!(status.state, JobState::Succeeded, "{:?}", status.error);

    let stored = store
        .count_messages(&account.scope())
        .await
        .expect("Failed to count");
    assert!(stored <= 20);

    let second = orchestrator
        .submit(OWNER.into(), ACCOUNT.into(), EncryptionKey::generate().into(), options)
        .await
        .expect("Failed to submit");
    let status = orchestrator.wait(second).await.expect("Failed to wait");
    assert_eq!(status.state, JobState::Succeeded);

    orchestrator.shutdown().await;
}
