//! # email-mirror
//!
//! Multi-account mail mirror: keeps a local copy of each account's folder
//! state in step with an IMAP server, downloads only the messages that are
//! actually new and stores them encrypted, running the whole pipeline as
//! retryable asynchronous jobs on a shared worker pool.
//!
//! The pipeline has three stages, usable on their own or through the
//! [`SyncOrchestrator`]:
//!
//! 1. [`StateReconciler`] replaces each folder's envelope mirror with the
//!    server's current state, one transaction per folder
//! 2. [`DeltaFetcher`] works out which identifiers are not yet stored, by
//!    high-water mark or, when a filter is active, by set difference
//! 3. [`RawMessagePersister`] fetches those messages without marking them
//!    read, seals them with the job's key and stores them deduplicated
//!
//! ## Quick Start
//!
//! ```no_run
//! use email_mirror::{
//!     Account, EncryptionKey, ImapConnector, ImapEndpoint, SqliteStore, SyncConfig,
//!     SyncOptions, SyncOrchestrator, TimeoutConfig,
//! };
//! use std::sync::Arc;
//!
//! # async fn example() -> email_mirror::Result<()> {
//! let store = Arc::new(SqliteStore::open("mirror.db").await?);
//! store.add_account(&Account::new("acct-1", "user-1", "user@example.com")).await?;
//!
//! let endpoint = ImapEndpoint::builder()
//!     .email("user@example.com")
//!     .password("app-password")
//!     .host("imap.example.com")
//!     .build()?;
//! let connector = ImapConnector::new(TimeoutConfig::default()).with_endpoint("acct-1".into(), endpoint);
//!
//! let orchestrator = SyncOrchestrator::builder(store, Arc::new(connector))
//!     .config(SyncConfig::builder().workers(4).build()?)
//!     .start();
//!
//! let job = orchestrator
//!     .submit("user-1".into(), "acct-1".into(), EncryptionKey::generate().into(), SyncOptions::default())
//!     .await?;
//! let status = orchestrator.wait(job).await?;
//! println!("job finished: {}", status.state);
//!
//! orchestrator.shutdown().await;
//! # Ok(())
//! # }
//! ```
//!
//! ## Filtered Fetches
//!
//! ```
//! use email_mirror::{FetchFilter, SyncOptions};
//!
//! // Unread messages in two folders, at most 200 per folder
//! let options = SyncOptions::folders(["INBOX", "Receipts"])
//!     .with_filter(FetchFilter::unseen())
//!     .with_message_cap(200);
//! assert!(options.filter.is_active());
//! ```
//!
//! ## Error Handling
//!
//! Use [`Error::is_retryable`] to tell transient failures from permanent ones
//! and [`Error::category`] for logging:
//!
//! ```
//! use email_mirror::Error;
//!
//! fn handle_error(error: &Error) {
//!     if error.is_retryable() {
//!         println!("Transient error ({}), will retry: {}", error.category(), error);
//!     } else {
//!         println!("Permanent error: {}", error);
//!     }
//! }
//! ```
//!
//! ## Observability
//!
//! The crate uses `tracing` for instrumentation. Spans are named after the
//! method that opens them:
//!
//! - `SyncOrchestrator::submit`, `SyncOrchestrator::dispatch`, `SyncOrchestrator::cancel`
//! - `StateReconciler::reconcile`
//! - `DeltaFetcher::compute_delta`
//! - `RawMessagePersister::fetch_and_persist`
//! - `ImapConnector::connect`
//!
//! Standard fields are `job_id`, `account_id`, `folder`, `uid` and
//! `attempt`. Keys and passwords never appear in spans, events or errors.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

// Public modules
pub mod config;
pub mod crypto;
pub mod error;
pub mod imap;
pub mod job;
pub mod keys;
pub mod model;
pub mod progress;
pub mod proxy;
pub mod remote;
pub mod store;
pub mod sync;

// Internal modules
mod parser;

// Re-exports for ergonomic API
pub use config::{ConflictPolicy, JobTimeouts, RetryPolicy, SyncConfig, SyncConfigBuilder, TimeoutConfig};
pub use crypto::{dedup_key, EncryptionKey, MessageCipher};
pub use email_address::EmailAddress;
pub use error::{Error, ErrorCategory, Result};
pub use imap::{ImapConnector, ImapEndpoint, ImapEndpointBuilder};
pub use job::{
    FolderSelection, JobFailure, JobState, JobStatus, PostProcessor, SyncJob, SyncOptions,
    SyncOrchestrator, SyncOrchestratorBuilder,
};
pub use keys::{DirectKeysOnly, KeyLease, KeyRef, KeyResolver, KeyToken, KeyVault};
pub use model::{
    Account, AccountId, DedupKey, Envelope, FetchFilter, FolderStateRecord, FolderStatus, JobId,
    MessageFlags, MessageLocation, OwnerId, RawMessage, Scope, SearchCriteria, SyncIssue,
    SyncStats, Uid,
};
pub use progress::{CollectingSink, NullSink, Phase, ProgressEvent, ProgressSink};
pub use proxy::{ProxyAuth, Socks5Proxy};
pub use remote::{Connector, MailRemote, MemoryConnector, MemoryMailServer, TimedRemote};
pub use store::{
    AccountStore, Claim, InsertOutcome, JobStore, MemoryStore, MessageStore, MirrorStore,
    SqliteStore, Store,
};
pub use sync::{CancelToken, Delta, DeltaFetcher, PersistReport, RawMessagePersister, StateReconciler};
