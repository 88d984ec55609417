//! Error types for the email-mirror crate.
//!
//! Errors fall into the classes the job pipeline cares about:
//!
//! - **authorization** (wrong owner, unavailable or malformed key, bad credentials):
//!   terminal, never retried
//! - **transient** (network, timeouts, transient server replies): retried per job policy
//! - **permanent** (missing folder, malformed data): terminal
//!
//! See [`Error::is_retryable`] and [`Error::category`].

use crate::model::{AccountId, JobId};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Result type alias using [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while mirroring an account.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    // ─────────────────────────────────────────────────────────────────────────
    // Configuration / validation errors (NOT retryable)
    // ─────────────────────────────────────────────────────────────────────────
    /// Invalid email address format.
    #[error("invalid email format: {email}")]
    InvalidEmailFormat {
        /// The invalid email address.
        email: String,
    },

    /// Invalid configuration provided.
    #[error("invalid configuration: {message}")]
    InvalidConfig {
        /// Description of the configuration error.
        message: String,
    },

    /// Invalid DNS name for TLS.
    #[error("invalid DNS name for host '{host}'")]
    InvalidDnsName {
        /// The invalid hostname.
        host: String,
        /// The underlying DNS name error.
        #[source]
        source: rustls::client::InvalidDnsNameError,
    },

    // ─────────────────────────────────────────────────────────────────────────
    // Authorization errors (NOT retryable, no side effects)
    // ─────────────────────────────────────────────────────────────────────────
    /// The account does not exist or is not owned by the submitter.
    #[error("account {account} is not accessible to this owner")]
    AccountNotOwned {
        /// The requested account.
        account: AccountId,
    },

    /// The decryption key could not be obtained for this run.
    #[error("decryption key unavailable: {reason}")]
    KeyUnavailable {
        /// Why the key is unavailable (never contains key material).
        reason: String,
    },

    /// Key material has the wrong shape.
    #[error("malformed decryption key: expected 32 bytes, got {length}")]
    InvalidKey {
        /// Length of the rejected material.
        length: usize,
    },

    /// The server rejected the account credentials.
    #[error("IMAP login rejected for {email}")]
    Authentication {
        /// The login name.
        email: String,
        /// The underlying IMAP error.
        #[source]
        source: async_imap::error::Error,
    },

    // ─────────────────────────────────────────────────────────────────────────
    // Network / connection errors (RETRYABLE)
    // ─────────────────────────────────────────────────────────────────────────
    /// Failed to establish TCP connection.
    #[error("failed to connect to {target}")]
    TcpConnect {
        /// The target address that failed.
        target: String,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// Failed to establish TLS connection.
    #[error("failed to establish TLS connection to {target}")]
    TlsConnect {
        /// The target address that failed.
        target: String,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// Failed to connect via SOCKS5 proxy.
    #[error("failed to connect via SOCKS5 proxy {proxy_host} to {target}")]
    Socks5Connect {
        /// The SOCKS5 proxy hostname.
        proxy_host: String,
        /// The target address.
        target: String,
        /// The underlying SOCKS5 error.
        #[source]
        source: tokio_socks::Error,
    },

    /// The connection to the server dropped mid-session.
    #[error("connection lost: {message}")]
    ConnectionLost {
        /// What was happening when the connection dropped.
        message: String,
    },

    // ─────────────────────────────────────────────────────────────────────────
    // Timeout errors (mostly RETRYABLE)
    // ─────────────────────────────────────────────────────────────────────────
    /// Connection timeout.
    #[error("connection timeout to {target} after {timeout:?}")]
    ConnectTimeout {
        /// The target address.
        target: String,
        /// The timeout duration that was exceeded.
        timeout: Duration,
    },

    /// Authentication timeout.
    #[error("authentication timeout for {email} after {timeout:?}")]
    AuthTimeout {
        /// The login name.
        email: String,
        /// The timeout duration that was exceeded.
        timeout: Duration,
    },

    /// Folder listing timeout.
    #[error("folder listing timeout after {timeout:?}")]
    ListTimeout {
        /// The timeout duration that was exceeded.
        timeout: Duration,
    },

    /// Folder selection timeout.
    #[error("folder selection timeout for '{folder}' after {timeout:?}")]
    SelectTimeout {
        /// The folder name.
        folder: String,
        /// The timeout duration that was exceeded.
        timeout: Duration,
    },

    /// UID search timeout.
    #[error("search timeout in '{folder}' after {timeout:?}")]
    SearchTimeout {
        /// The folder being searched.
        folder: String,
        /// The timeout duration that was exceeded.
        timeout: Duration,
    },

    /// Envelope fetch timeout.
    #[error("envelope fetch timeout for UID set {uid_set} in '{folder}' after {timeout:?}")]
    EnvelopeFetchTimeout {
        /// The folder being fetched from.
        folder: String,
        /// The UID set being fetched.
        uid_set: String,
        /// The timeout duration that was exceeded.
        timeout: Duration,
    },

    /// Full message fetch timeout.
    #[error("message fetch timeout for UID {uid} in '{folder}' after {timeout:?}")]
    FetchTimeout {
        /// The folder being fetched from.
        folder: String,
        /// The UID being fetched.
        uid: u32,
        /// The timeout duration that was exceeded.
        timeout: Duration,
    },

    /// Logout timeout (not critical).
    #[error("logout timeout after {timeout:?}")]
    LogoutTimeout {
        /// The timeout duration that was exceeded.
        timeout: Duration,
    },

    /// The job exceeded its hard wall-clock ceiling.
    #[error("job exceeded its {timeout:?} ceiling")]
    JobTimeout {
        /// The ceiling that was exceeded.
        timeout: Duration,
    },

    // ─────────────────────────────────────────────────────────────────────────
    // IMAP protocol errors (RETRYABLE - could be transient server issues)
    // ─────────────────────────────────────────────────────────────────────────
    /// IMAP LIST failed.
    #[error("IMAP folder listing failed")]
    ImapList {
        /// The underlying IMAP error.
        #[source]
        source: async_imap::error::Error,
    },

    /// Failed to examine a folder.
    #[error("failed to examine folder '{folder}'")]
    ExamineFolder {
        /// The folder name.
        folder: String,
        /// The underlying IMAP error.
        #[source]
        source: async_imap::error::Error,
    },

    /// IMAP search failed.
    #[error("IMAP search failed")]
    ImapSearch {
        /// The underlying IMAP error.
        #[source]
        source: async_imap::error::Error,
    },

    /// IMAP fetch failed.
    #[error("IMAP fetch failed for UID set {uid_set}")]
    ImapFetch {
        /// The UID set that failed.
        uid_set: String,
        /// The underlying IMAP error.
        #[source]
        source: async_imap::error::Error,
    },

    /// IMAP logout failed.
    #[error("IMAP logout failed")]
    ImapLogout {
        /// The underlying IMAP error.
        #[source]
        source: async_imap::error::Error,
    },

    /// The server answered with a transient failure.
    #[error("server error: {message}")]
    Server {
        /// The server's complaint.
        message: String,
    },

    // ─────────────────────────────────────────────────────────────────────────
    // Permanent remote errors (NOT retryable)
    // ─────────────────────────────────────────────────────────────────────────
    /// The folder does not exist on the server.
    #[error("folder '{folder}' does not exist")]
    FolderNotFound {
        /// The folder name.
        folder: String,
    },

    /// The server did not report a validity epoch for the folder.
    #[error("folder '{folder}' has no UIDVALIDITY")]
    MissingValidity {
        /// The folder name.
        folder: String,
    },

    /// The server returned no content for a message.
    #[error("message UID {uid} returned no content")]
    MessageUnavailable {
        /// The UID requested.
        uid: u32,
    },

    // ─────────────────────────────────────────────────────────────────────────
    // Storage / crypto errors (NOT retryable)
    // ─────────────────────────────────────────────────────────────────────────
    /// Database operation failed.
    #[error("database error")]
    Database(#[from] sqlx::Error),

    /// JSON column could not be encoded or decoded.
    #[error("serialization error")]
    Serialization(#[from] serde_json::Error),

    /// A stored row violates an invariant.
    #[error("corrupt store record: {message}")]
    CorruptRecord {
        /// What was wrong with the row.
        message: String,
    },

    /// Sealing a field failed.
    #[error("encryption failed")]
    Encryption,

    /// Opening a sealed field failed (wrong key or corrupted data).
    #[error("decryption failed: {message}")]
    Decryption {
        /// Description of the failure.
        message: String,
    },

    // ─────────────────────────────────────────────────────────────────────────
    // Job-level errors
    // ─────────────────────────────────────────────────────────────────────────
    /// The job observed a cancellation request.
    #[error("job cancelled")]
    Cancelled,

    /// Every folder failed and nothing was stored (RETRYABLE).
    #[error("no progress: {failures} failures and nothing reconciled")]
    NoProgress {
        /// Number of contained failures in the run.
        failures: usize,
    },

    /// Unknown job id.
    #[error("job {job} not found")]
    JobNotFound {
        /// The requested job.
        job: JobId,
    },

    /// Another job for this account is active and the policy rejects overlap.
    #[error("account {account} already has an active job")]
    AccountBusy {
        /// The busy account.
        account: AccountId,
    },

    /// The worker pool has been shut down.
    #[error("job queue is closed")]
    QueueClosed,
}

impl Error {
    /// Returns `true` if this error represents a transient failure that might succeed on retry.
    ///
    /// Only retryable errors move a failed job to `RETRYING`.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::TcpConnect { .. }
            | Error::TlsConnect { .. }
            | Error::Socks5Connect { .. }
            | Error::ConnectionLost { .. }
            | Error::ConnectTimeout { .. }
            | Error::AuthTimeout { .. }
            | Error::ListTimeout { .. }
            | Error::SelectTimeout { .. }
            | Error::SearchTimeout { .. }
            | Error::EnvelopeFetchTimeout { .. }
            | Error::FetchTimeout { .. }
            | Error::JobTimeout { .. }
            | Error::ImapList { .. }
            | Error::ExamineFolder { .. }
            | Error::ImapSearch { .. }
            | Error::ImapFetch { .. }
            | Error::Server { .. }
            | Error::NoProgress { .. } => true,

            Error::InvalidEmailFormat { .. }
            | Error::InvalidConfig { .. }
            | Error::InvalidDnsName { .. }
            | Error::AccountNotOwned { .. }
            | Error::KeyUnavailable { .. }
            | Error::InvalidKey { .. }
            | Error::Authentication { .. }
            | Error::LogoutTimeout { .. }
            | Error::ImapLogout { .. }
            | Error::FolderNotFound { .. }
            | Error::MissingValidity { .. }
            | Error::MessageUnavailable { .. }
            | Error::Database(_)
            | Error::Serialization(_)
            | Error::CorruptRecord { .. }
            | Error::Encryption
            | Error::Decryption { .. }
            | Error::Cancelled
            | Error::JobNotFound { .. }
            | Error::AccountBusy { .. }
            | Error::QueueClosed => false,
        }
    }

    /// Returns `true` if the session to the server is gone.
    ///
    /// These errors escape per-folder and per-message containment: once the
    /// connection is lost there is nothing left to continue with.
    #[must_use]
    pub fn is_connection_loss(&self) -> bool {
        matches!(
            self,
            Error::TcpConnect { .. }
                | Error::TlsConnect { .. }
                | Error::Socks5Connect { .. }
                | Error::ConnectionLost { .. }
                | Error::ConnectTimeout { .. }
                | Error::AuthTimeout { .. }
        )
    }

    /// Returns the error category for logging and job failure records.
    #[must_use]
    pub fn category(&self) -> ErrorCategory {
        match self {
            Error::InvalidEmailFormat { .. }
            | Error::InvalidConfig { .. }
            | Error::InvalidDnsName { .. } => ErrorCategory::Configuration,

            Error::AccountNotOwned { .. }
            | Error::KeyUnavailable { .. }
            | Error::InvalidKey { .. }
            | Error::Authentication { .. } => ErrorCategory::Authorization,

            Error::TcpConnect { .. }
            | Error::TlsConnect { .. }
            | Error::Socks5Connect { .. }
            | Error::ConnectionLost { .. } => ErrorCategory::Network,

            Error::ConnectTimeout { .. }
            | Error::AuthTimeout { .. }
            | Error::ListTimeout { .. }
            | Error::SelectTimeout { .. }
            | Error::SearchTimeout { .. }
            | Error::EnvelopeFetchTimeout { .. }
            | Error::FetchTimeout { .. }
            | Error::LogoutTimeout { .. }
            | Error::JobTimeout { .. } => ErrorCategory::Timeout,

            Error::ImapList { .. }
            | Error::ExamineFolder { .. }
            | Error::ImapSearch { .. }
            | Error::ImapFetch { .. }
            | Error::ImapLogout { .. }
            | Error::Server { .. }
            | Error::NoProgress { .. } => ErrorCategory::Protocol,

            Error::FolderNotFound { .. }
            | Error::MissingValidity { .. }
            | Error::MessageUnavailable { .. } => ErrorCategory::Permanent,

            Error::Database(_) | Error::Serialization(_) | Error::CorruptRecord { .. } => {
                ErrorCategory::Storage
            }

            Error::Encryption | Error::Decryption { .. } => ErrorCategory::Crypto,

            Error::Cancelled | Error::QueueClosed => ErrorCategory::Cancelled,

            Error::JobNotFound { .. } | Error::AccountBusy { .. } => ErrorCategory::NotFound,
        }
    }
}

/// Error categories for logging and job failure records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Configuration or validation errors.
    Configuration,
    /// Ownership, key or credential errors.
    Authorization,
    /// Network connectivity errors.
    Network,
    /// Timeout errors.
    Timeout,
    /// IMAP protocol errors.
    Protocol,
    /// Remote state that will not change on retry.
    Permanent,
    /// Local persistence errors.
    Storage,
    /// Encryption errors.
    Crypto,
    /// Cancellation or shutdown.
    Cancelled,
    /// Missing or conflicting job/account.
    NotFound,
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorCategory::Configuration => write!(f, "configuration"),
            ErrorCategory::Authorization => write!(f, "authorization"),
            ErrorCategory::Network => write!(f, "network"),
            ErrorCategory::Timeout => write!(f, "timeout"),
            ErrorCategory::Protocol => write!(f, "protocol"),
            ErrorCategory::Permanent => write!(f, "permanent"),
            ErrorCategory::Storage => write!(f, "storage"),
            ErrorCategory::Crypto => write!(f, "crypto"),
            ErrorCategory::Cancelled => write!(f, "cancelled"),
            ErrorCategory::NotFound => write!(f, "not_found"),
        }
    }
}
