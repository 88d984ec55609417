//! Example: mirroring one account with tracing enabled.
//!
//! Connects to an IMAP server, reconciles folder state into a local SQLite
//! database and stores any new messages encrypted with a freshly generated
//! key. Every stage emits tracing spans.
//!
//! # Usage
//!
//! ```bash
//! export EMAIL_ADDRESS="your@email.com"
//! export EMAIL_PASSWORD="your-app-password"
//! export IMAP_HOST="imap.example.com"
//! # Optional: comma-separated folders (default: all folders)
//! export SYNC_FOLDERS="INBOX,Archive"
//! # Optional: database path (default: mirror.db)
//! export MIRROR_DB="mirror.db"
//! # Set log level (trace, debug, info, warn, error)
//! export RUST_LOG=email_mirror=debug
//!
//! cargo run --example sync_account
//! ```

use email_mirror::{
    Account, EncryptionKey, ImapConnector, ImapEndpoint, JobState, SqliteStore, SyncConfig,
    SyncOptions, SyncOrchestrator, TimeoutConfig,
};
use std::env;
use std::sync::Arc;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> email_mirror::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("email_mirror=info")),
        )
        .with_span_events(FmtSpan::CLOSE)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .init();

    let email = env::var("EMAIL_ADDRESS").expect("EMAIL_ADDRESS environment variable required");
    let password =
        env::var("EMAIL_PASSWORD").expect("EMAIL_PASSWORD environment variable required");
    let host = env::var("IMAP_HOST").expect("IMAP_HOST environment variable required");
    let db_path = env::var("MIRROR_DB").unwrap_or_else(|_| "mirror.db".to_string());

    tracing::info!(email = %email, db = %db_path, "Starting email-mirror example");

    let store = Arc::new(SqliteStore::open(&db_path).await?);
    let account = Account::new("demo-account", "demo-owner", email.as_str());
    store.add_account(&account).await?;

    let endpoint = ImapEndpoint::builder()
        .email(&email)
        .password(password)
        .host(host)
        .build()?;
    let connector = ImapConnector::new(TimeoutConfig::default())
        .with_endpoint(account.id.clone(), endpoint);

    let orchestrator = SyncOrchestrator::builder(Arc::clone(&store), Arc::new(connector))
        .config(SyncConfig::builder().workers(2).build()?)
        .start();

    let options = match env::var("SYNC_FOLDERS") {
        Ok(list) => SyncOptions::folders(list.split(',').map(str::trim).filter(|f| !f.is_empty())),
        Err(_) => SyncOptions::default(),
    };

    let job = orchestrator
        .submit(
            account.owner.clone(),
            account.id.clone(),
            EncryptionKey::generate().into(),
            options,
        )
        .await?;
    tracing::info!(job_id = %job, "Job submitted");

    let status = orchestrator.wait(job).await?;
    println!("\nJob {} finished: {}", job, status.state);

    match status.state {
        JobState::Succeeded => {
            if let Some(stats) = &status.stats {
                println!("  folders scanned:  {}", stats.folders_scanned);
                println!("  messages stored:  {}", stats.messages_new);
                println!("  duplicates:       {}", stats.messages_skipped);
                println!("  truncated:        {}", stats.truncated);
                for issue in &stats.errors {
                    println!("  issue: {issue:?}");
                }
            }
        }
        _ => {
            if let Some(failure) = &status.error {
                println!("  {} error: {}", failure.category, failure.message);
            }
        }
    }

    orchestrator.shutdown().await;
    tracing::info!("Example completed");

    Ok(())
}
