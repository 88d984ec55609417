//! Domain types shared by the reconciler, the delta fetcher, the persister and the job layer.

use crate::error::{Error, ErrorCategory};
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use uuid::Uuid;

/// Per-folder message identifier assigned by the server (IMAP UID).
pub type Uid = u32;

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Wraps an identifier.
            #[must_use]
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            /// Returns the identifier as a string slice.
            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(id: &str) -> Self {
                Self::new(id)
            }
        }
    };
}

string_id!(
    /// Identifies the user who owns accounts and submits jobs.
    OwnerId
);

string_id!(
    /// Identifies a configured mail account.
    AccountId
);

/// Identifies one sync job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(Uuid);

impl JobId {
    /// Generates a fresh random job id.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Parses a job id from its hyphenated form.
    ///
    /// # Errors
    ///
    /// Returns [`Error::CorruptRecord`] if the text is not a UUID.
    pub fn parse(text: &str) -> crate::Result<Self> {
        Uuid::parse_str(text)
            .map(Self)
            .map_err(|_| Error::CorruptRecord {
                message: format!("invalid job id '{text}'"),
            })
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

/// A configured mail connection, owned by exactly one user.
///
/// The mirror only reads accounts; it never mutates them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    /// Account identifier.
    pub id: AccountId,
    /// The owning user.
    pub owner: OwnerId,
    /// Login address, used for logging and connector lookup.
    pub email: String,
}

impl Account {
    /// Creates an account record.
    #[must_use]
    pub fn new(id: impl Into<AccountId>, owner: impl Into<OwnerId>, email: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            owner: owner.into(),
            email: email.into(),
        }
    }

    /// Returns the owner-scoped key used for every store query on this account.
    #[must_use]
    pub fn scope(&self) -> Scope {
        Scope {
            owner: self.owner.clone(),
            account: self.id.clone(),
        }
    }
}

impl From<String> for AccountId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl From<String> for OwnerId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Owner + account pair that every mirror and message query is keyed by.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Scope {
    /// The owning user.
    pub owner: OwnerId,
    /// The account.
    pub account: AccountId,
}

impl Scope {
    /// Creates a scope.
    #[must_use]
    pub fn new(owner: impl Into<OwnerId>, account: impl Into<AccountId>) -> Self {
        Self {
            owner: owner.into(),
            account: account.into(),
        }
    }
}

/// IMAP system flags and keywords of one message.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageFlags(BTreeSet<String>);

impl MessageFlags {
    /// The `\Seen` system flag.
    pub const SEEN: &'static str = "\\Seen";
    /// The `\Flagged` system flag.
    pub const FLAGGED: &'static str = "\\Flagged";

    /// Creates an empty flag set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a flag.
    pub fn insert(&mut self, flag: impl Into<String>) {
        self.0.insert(flag.into());
    }

    /// Returns `true` if the flag is set.
    #[must_use]
    pub fn contains(&self, flag: &str) -> bool {
        self.0.contains(flag)
    }

    /// Returns `true` if the message has been read.
    #[must_use]
    pub fn is_seen(&self) -> bool {
        self.contains(Self::SEEN)
    }

    /// Iterates over flags in sorted order.
    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }
}

impl<S: Into<String>> FromIterator<S> for MessageFlags {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        Self(iter.into_iter().map(Into::into).collect())
    }
}

/// State of a folder as reported by a read-only select.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FolderStatus {
    /// Validity epoch; identifiers are only comparable within one epoch.
    pub uid_validity: u32,
    /// Number of messages in the folder.
    pub exists: u32,
    /// Next identifier the server will assign, if reported.
    pub uid_next: Option<Uid>,
}

/// Header metadata of one message, obtainable without the body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    /// Identifier within the selected folder.
    pub uid: Uid,
    /// `Message-ID` header, without angle brackets.
    pub message_id: Option<String>,
    /// Decoded subject.
    pub subject: Option<String>,
    /// First sender, formatted as `Name <addr>` or `addr`.
    pub from: Option<String>,
    /// Date header or internal date.
    pub date: Option<DateTime<Utc>>,
    /// Size in bytes.
    pub size: Option<u32>,
    /// Current flags.
    pub flags: MessageFlags,
}

/// Mirrored envelope + flags for one (account, folder, identifier).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FolderStateRecord {
    /// Folder name.
    pub folder: String,
    /// Validity epoch the identifier belongs to.
    pub uid_validity: u32,
    /// Identifier within the folder.
    pub uid: Uid,
    /// `Message-ID` header.
    pub message_id: Option<String>,
    /// Decoded subject.
    pub subject: Option<String>,
    /// First sender.
    pub from: Option<String>,
    /// Message date.
    pub date: Option<DateTime<Utc>>,
    /// Size in bytes.
    pub size: Option<u32>,
    /// Flags at the time of reconciliation.
    pub flags: MessageFlags,
}

impl FolderStateRecord {
    /// Builds the mirror row for an envelope.
    #[must_use]
    pub fn from_envelope(folder: &str, uid_validity: u32, envelope: Envelope) -> Self {
        Self {
            folder: folder.to_string(),
            uid_validity,
            uid: envelope.uid,
            message_id: envelope.message_id,
            subject: envelope.subject,
            from: envelope.from,
            date: envelope.date,
            size: envelope.size,
            flags: envelope.flags,
        }
    }
}

/// Stable identity of a stored message, unique per account.
///
/// Built from a hash of the `Message-ID` (`mid:` prefix) or, when the message
/// has none, from a hash of its bytes (`sha256:` prefix).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DedupKey(String);

impl DedupKey {
    /// Wraps an already computed key.
    #[must_use]
    pub fn from_raw(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    /// Returns the key as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DedupKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Where a message lives on the server.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageLocation {
    /// Folder name.
    pub folder: String,
    /// Validity epoch.
    pub uid_validity: u32,
    /// Identifier within the folder.
    pub uid: Uid,
}

/// A persisted, encrypted full message.
///
/// Immutable once written, except for flag updates from later reconciliations.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawMessage {
    /// Account-scoped identity.
    pub dedup_key: DedupKey,
    /// Location the message was first fetched from.
    pub location: MessageLocation,
    /// Sealed RFC 5322 bytes.
    pub sealed_body: Vec<u8>,
    /// Sealed subject, if the message had one.
    pub sealed_subject: Option<Vec<u8>>,
    /// Sealed sender, if the message had one.
    pub sealed_from: Option<Vec<u8>>,
    /// Plaintext size in bytes.
    pub size: u64,
    /// Flags last seen on the server.
    pub flags: MessageFlags,
    /// When the row was written.
    pub stored_at: DateTime<Utc>,
}

impl fmt::Debug for RawMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RawMessage")
            .field("dedup_key", &self.dedup_key)
            .field("location", &self.location)
            .field("sealed_body_len", &self.sealed_body.len())
            .field("size", &self.size)
            .field("flags", &self.flags)
            .field("stored_at", &self.stored_at)
            .finish_non_exhaustive()
    }
}

/// Server-side search criteria.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SearchCriteria {
    /// Only identifiers strictly greater than this.
    pub uid_above: Option<Uid>,
    /// Only messages dated on or after this day.
    pub since: Option<NaiveDate>,
    /// Only messages without `\Seen`.
    pub unseen_only: bool,
}

impl SearchCriteria {
    /// Matches every message in the folder.
    #[must_use]
    pub fn all() -> Self {
        Self::default()
    }

    /// Renders the criteria as an IMAP `UID SEARCH` query.
    #[must_use]
    pub fn to_imap_query(&self) -> String {
        let mut parts = Vec::new();
        if let Some(uid) = self.uid_above {
            parts.push(format!("UID {}:*", uid.saturating_add(1)));
        }
        if let Some(since) = self.since {
            // IMAP SINCE format: "DD-Mon-YYYY" (e.g., "07-Dec-2025")
            parts.push(format!("SINCE {}", since.format("%d-%b-%Y")));
        }
        if self.unseen_only {
            parts.push("UNSEEN".to_string());
        }
        if parts.is_empty() {
            "ALL".to_string()
        } else {
            parts.join(" ")
        }
    }
}

/// Optional filter on the fetch phase.
///
/// When active, the delta is computed by set difference instead of a
/// high-water mark.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchFilter {
    /// Only messages dated on or after this day.
    pub since: Option<NaiveDate>,
    /// Only unread messages.
    pub unseen_only: bool,
}

impl FetchFilter {
    /// Unread messages only.
    #[must_use]
    pub fn unseen() -> Self {
        Self {
            since: None,
            unseen_only: true,
        }
    }

    /// Messages dated on or after `date`.
    #[must_use]
    pub fn since(date: NaiveDate) -> Self {
        Self {
            since: Some(date),
            unseen_only: false,
        }
    }

    /// Returns `true` if any criterion is set.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.since.is_some() || self.unseen_only
    }

    /// Server-side criteria for the filter.
    #[must_use]
    pub fn criteria(&self) -> SearchCriteria {
        SearchCriteria {
            uid_above: None,
            since: self.since,
            unseen_only: self.unseen_only,
        }
    }
}

/// A contained failure recorded during a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncIssue {
    /// Folder the failure happened in.
    pub folder: Option<String>,
    /// Message identifier, for message-level failures.
    pub uid: Option<Uid>,
    /// Error category.
    pub category: ErrorCategory,
    /// Error message (never contains key material).
    pub message: String,
}

impl SyncIssue {
    /// Records a folder-level failure.
    #[must_use]
    pub fn folder(folder: &str, error: &Error) -> Self {
        Self {
            folder: Some(folder.to_string()),
            uid: None,
            category: error.category(),
            message: error.to_string(),
        }
    }

    /// Records a message-level failure.
    #[must_use]
    pub fn message(folder: &str, uid: Uid, error: &Error) -> Self {
        Self {
            folder: Some(folder.to_string()),
            uid: Some(uid),
            category: error.category(),
            message: error.to_string(),
        }
    }

    /// Records a failure not tied to a folder.
    #[must_use]
    pub fn general(error: &Error) -> Self {
        Self {
            folder: None,
            uid: None,
            category: error.category(),
            message: error.to_string(),
        }
    }
}

/// Per-run aggregate folded into the job's final result.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncStats {
    /// Folders reconciled successfully.
    pub folders_scanned: u32,
    /// Messages newly stored.
    pub messages_new: u64,
    /// Messages skipped as duplicates.
    pub messages_skipped: u64,
    /// Delta identifiers dropped by the message cap.
    pub truncated: u64,
    /// Contained folder and message failures.
    pub errors: Vec<SyncIssue>,
}

impl SyncStats {
    /// Returns `true` if the run contained failures but achieved nothing.
    #[must_use]
    pub fn made_no_progress(&self) -> bool {
        !self.errors.is_empty() && self.folders_scanned == 0 && self.messages_new == 0
    }
}
