//! Capability interface to the remote mail server.
//!
//! The pipeline only talks to a server through [`MailRemote`], obtained from a
//! [`Connector`]. Two implementations ship with the crate:
//!
//! - [`ImapConnector`](crate::imap::ImapConnector) for real IMAP servers
//! - [`MemoryConnector`] for an in-process server, used in tests
//!
//! [`TimedRemote`] wraps any remote so each call is bounded by the matching
//! [`TimeoutConfig`] entry.

mod memory;

pub use memory::{MemoryConnector, MemoryMailServer};

use crate::config::TimeoutConfig;
use crate::error::{Error, Result};
use crate::model::{Account, Envelope, FolderStatus, SearchCriteria, Uid};
use async_trait::async_trait;
use std::future::Future;
use std::time::Duration;

/// Operations the pipeline needs from a server session.
///
/// Implementations must never change message state as a side effect of
/// reading: folders are opened read-only and bodies are fetched without
/// setting `\Seen`.
#[async_trait]
pub trait MailRemote: Send {
    /// Lists selectable folders.
    async fn list_folders(&mut self) -> Result<Vec<String>>;

    /// Opens `folder` read-only and reports its state.
    async fn select_readonly(&mut self, folder: &str) -> Result<FolderStatus>;

    /// Returns identifiers in the selected folder matching `criteria`, ascending.
    async fn search(&mut self, criteria: &SearchCriteria) -> Result<Vec<Uid>>;

    /// Fetches envelope and flag data for `uids` in the selected folder.
    async fn fetch_envelopes(&mut self, uids: &[Uid]) -> Result<Vec<Envelope>>;

    /// Fetches the full bytes of one message without marking it read.
    async fn fetch_full(&mut self, uid: Uid) -> Result<Vec<u8>>;

    /// Ends the session.
    async fn logout(&mut self) -> Result<()>;
}

/// Opens sessions for accounts.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Connects and authenticates a session for `account`.
    async fn connect(&self, account: &Account) -> Result<Box<dyn MailRemote>>;
}

/// A [`MailRemote`] whose every call is bounded by a timeout.
pub struct TimedRemote {
    inner: Box<dyn MailRemote>,
    timeouts: TimeoutConfig,
    selected: Option<String>,
}

impl TimedRemote {
    /// Wraps `inner` with `timeouts`.
    #[must_use]
    pub fn new(inner: Box<dyn MailRemote>, timeouts: TimeoutConfig) -> Self {
        Self {
            inner,
            timeouts,
            selected: None,
        }
    }
}

impl std::fmt::Debug for TimedRemote {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimedRemote")
            .field("timeouts", &self.timeouts)
            .field("selected", &self.selected)
            .finish_non_exhaustive()
    }
}

async fn bounded<T, F>(limit: Duration, call: F, on_elapsed: impl FnOnce() -> Error) -> Result<T>
where
    F: Future<Output = Result<T>> + Send,
{
    tokio::time::timeout(limit, call)
        .await
        .map_err(|_| on_elapsed())?
}

fn describe_uids(uids: &[Uid]) -> String {
    match (uids.first(), uids.last()) {
        (Some(first), Some(last)) if first == last => first.to_string(),
        (Some(first), Some(last)) => format!("{first}..{last} ({} uids)", uids.len()),
        _ => String::new(),
    }
}

#[async_trait]
impl MailRemote for TimedRemote {
    async fn list_folders(&mut self) -> Result<Vec<String>> {
        let timeout = self.timeouts.list;
        bounded(timeout, self.inner.list_folders(), || Error::ListTimeout {
            timeout,
        })
        .await
    }

    async fn select_readonly(&mut self, folder: &str) -> Result<FolderStatus> {
        let timeout = self.timeouts.select;
        let status = bounded(timeout, self.inner.select_readonly(folder), || {
            Error::SelectTimeout {
                folder: folder.to_string(),
                timeout,
            }
        })
        .await?;
        self.selected = Some(folder.to_string());
        Ok(status)
    }

    async fn search(&mut self, criteria: &SearchCriteria) -> Result<Vec<Uid>> {
        let timeout = self.timeouts.search;
        let folder = self.selected.as_deref().unwrap_or_default();
        bounded(timeout, self.inner.search(criteria), || Error::SearchTimeout {
            folder: folder.to_string(),
            timeout,
        })
        .await
    }

    async fn fetch_envelopes(&mut self, uids: &[Uid]) -> Result<Vec<Envelope>> {
        let timeout = self.timeouts.envelope_fetch;
        let folder = self.selected.as_deref().unwrap_or_default();
        bounded(timeout, self.inner.fetch_envelopes(uids), || {
            Error::EnvelopeFetchTimeout {
                folder: folder.to_string(),
                uid_set: describe_uids(uids),
                timeout,
            }
        })
        .await
    }

    async fn fetch_full(&mut self, uid: Uid) -> Result<Vec<u8>> {
        let timeout = self.timeouts.message_fetch;
        let folder = self.selected.as_deref().unwrap_or_default();
        bounded(timeout, self.inner.fetch_full(uid), || Error::FetchTimeout {
            folder: folder.to_string(),
            uid,
            timeout,
        })
        .await
    }

    async fn logout(&mut self) -> Result<()> {
        let timeout = self.timeouts.logout;
        bounded(timeout, self.inner.logout(), || Error::LogoutTimeout { timeout }).await
    }
}

/// Formats identifiers as an IMAP sequence set, collapsing consecutive runs.
///
/// `[1, 2, 3, 7, 9, 10]` becomes `"1:3,7,9:10"`.
#[must_use]
pub fn uid_set(uids: &[Uid]) -> String {
    let mut sorted = uids.to_vec();
    sorted.sort_unstable();
    sorted.dedup();

    let mut parts = Vec::new();
    let mut iter = sorted.into_iter();
    let Some(mut start) = iter.next() else {
        return String::new();
    };
    let mut end = start;

    for uid in iter {
        if uid == end + 1 {
            end = uid;
        } else {
            parts.push(range_part(start, end));
            start = uid;
            end = uid;
        }
    }
    parts.push(range_part(start, end));
    parts.join(",")
}

fn range_part(start: Uid, end: Uid) -> String {
    if start == end {
        start.to_string()
    } else {
        format!("{start}:{end}")
    }
}
