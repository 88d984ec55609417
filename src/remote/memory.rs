//! In-process mail server.
//!
//! [`MemoryMailServer`] keeps folders and messages per account and serves
//! them through [`MemoryConnector`] with the same semantics the IMAP adapter
//! has: read-only selects, peek fetches, validity epochs. Faults can be
//! injected per folder, per message or per connection attempt.

use super::{Connector, MailRemote};
use crate::error::{Error, Result};
use crate::model::{Account, AccountId, Envelope, FolderStatus, MessageFlags, SearchCriteria, Uid};
use crate::parser;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::debug;

const DEFAULT_VALIDITY: u32 = 1;

struct MemoryMessage {
    raw: Vec<u8>,
    flags: MessageFlags,
    internal_date: DateTime<Utc>,
}

struct MemoryFolder {
    uid_validity: u32,
    messages: BTreeMap<Uid, MemoryMessage>,
}

impl MemoryFolder {
    fn new(uid_validity: u32) -> Self {
        Self {
            uid_validity,
            messages: BTreeMap::new(),
        }
    }
}

#[derive(Default)]
struct Counters {
    connects: u64,
    envelope_fetches: u64,
    full_fetches: u64,
}

#[derive(Default)]
struct ServerState {
    mailboxes: HashMap<AccountId, BTreeMap<String, MemoryFolder>>,
    failing_folders: HashSet<(AccountId, String)>,
    failing_messages: HashSet<(AccountId, String, Uid)>,
    lost_at_folder: Option<String>,
    connect_failures: u32,
    latency: Option<Duration>,
    counters: Counters,
}

impl ServerState {
    fn folder_mut(&mut self, account: &AccountId, folder: &str) -> &mut MemoryFolder {
        self.mailboxes
            .entry(account.clone())
            .or_default()
            .entry(folder.to_string())
            .or_insert_with(|| MemoryFolder::new(DEFAULT_VALIDITY))
    }

    fn folder(&self, account: &AccountId, folder: &str) -> Option<&MemoryFolder> {
        self.mailboxes.get(account).and_then(|f| f.get(folder))
    }
}

/// Shared handle to an in-process mail server.
///
/// Clones share the same state, so a test can keep one handle to mutate the
/// mailbox while the pipeline reads through a [`MemoryConnector`].
#[derive(Clone, Default)]
pub struct MemoryMailServer {
    state: Arc<Mutex<ServerState>>,
}

impl MemoryMailServer {
    /// Creates an empty server.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates `folder` for `account` with the given validity epoch.
    pub fn add_folder(&self, account: &AccountId, folder: &str, uid_validity: u32) {
        let mut state = self.lock();
        let entry = state.folder_mut(account, folder);
        entry.uid_validity = uid_validity;
    }

    /// Stores `raw` under `uid`, creating the folder if needed.
    pub fn insert(&self, account: &AccountId, folder: &str, uid: Uid, raw: Vec<u8>) {
        self.insert_with_flags(account, folder, uid, raw, MessageFlags::new());
    }

    /// Stores `raw` under `uid` with initial flags.
    pub fn insert_with_flags(
        &self,
        account: &AccountId,
        folder: &str,
        uid: Uid,
        raw: Vec<u8>,
        flags: MessageFlags,
    ) {
        let internal_date = parser::summarize_headers(&raw)
            .date
            .unwrap_or_else(Utc::now);
        self.lock().folder_mut(account, folder).messages.insert(
            uid,
            MemoryMessage {
                raw,
                flags,
                internal_date,
            },
        );
    }

    /// Appends `raw` with the next free identifier and returns it.
    pub fn append(&self, account: &AccountId, folder: &str, raw: Vec<u8>) -> Uid {
        let uid = {
            let mut state = self.lock();
            let entry = state.folder_mut(account, folder);
            entry.messages.keys().next_back().map_or(1, |last| last + 1)
        };
        self.insert(account, folder, uid, raw);
        uid
    }

    /// Removes a message (as if expunged).
    pub fn remove(&self, account: &AccountId, folder: &str, uid: Uid) {
        self.lock().folder_mut(account, folder).messages.remove(&uid);
    }

    /// Replaces the flags of a message.
    pub fn set_flags(&self, account: &AccountId, folder: &str, uid: Uid, flags: MessageFlags) {
        if let Some(message) = self.lock().folder_mut(account, folder).messages.get_mut(&uid) {
            message.flags = flags;
        }
    }

    /// Current flags of a message.
    #[must_use]
    pub fn flags(&self, account: &AccountId, folder: &str, uid: Uid) -> Option<MessageFlags> {
        self.lock()
            .folder(account, folder)
            .and_then(|f| f.messages.get(&uid))
            .map(|m| m.flags.clone())
    }

    /// Changes the validity epoch of a folder, invalidating identifiers.
    pub fn set_uid_validity(&self, account: &AccountId, folder: &str, uid_validity: u32) {
        self.lock().folder_mut(account, folder).uid_validity = uid_validity;
    }

    /// Makes every select of `folder` fail with a transient server error.
    pub fn fail_folder(&self, account: &AccountId, folder: &str) {
        self.lock()
            .failing_folders
            .insert((account.clone(), folder.to_string()));
    }

    /// Undoes [`fail_folder`](Self::fail_folder).
    pub fn heal_folder(&self, account: &AccountId, folder: &str) {
        self.lock()
            .failing_folders
            .remove(&(account.clone(), folder.to_string()));
    }

    /// Makes full fetches of one message fail.
    pub fn fail_message(&self, account: &AccountId, folder: &str, uid: Uid) {
        self.lock()
            .failing_messages
            .insert((account.clone(), folder.to_string(), uid));
    }

    /// Drops the connection when `folder` is selected.
    pub fn lose_connection_at(&self, folder: &str) {
        self.lock().lost_at_folder = Some(folder.to_string());
    }

    /// Refuses the next `count` connection attempts.
    pub fn fail_next_connects(&self, count: u32) {
        self.lock().connect_failures = count;
    }

    /// Delays every protocol call by `latency`.
    pub fn set_latency(&self, latency: Duration) {
        self.lock().latency = Some(latency);
    }

    /// Number of connection attempts seen.
    #[must_use]
    pub fn connects(&self) -> u64 {
        self.lock().counters.connects
    }

    /// Number of envelope fetch round trips served.
    #[must_use]
    pub fn envelope_fetches(&self) -> u64 {
        self.lock().counters.envelope_fetches
    }

    /// Number of full-message fetches served.
    #[must_use]
    pub fn full_fetches(&self) -> u64 {
        self.lock().counters.full_fetches
    }

    async fn delay(&self) {
        let latency = self.lock().latency;
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
    }

    fn lock(&self) -> MutexGuard<'_, ServerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for MemoryMailServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.lock();
        f.debug_struct("MemoryMailServer")
            .field("accounts", &state.mailboxes.len())
            .field("connects", &state.counters.connects)
            .finish_non_exhaustive()
    }
}

/// [`Connector`] serving sessions from a [`MemoryMailServer`].
#[derive(Debug, Clone)]
pub struct MemoryConnector {
    server: MemoryMailServer,
}

impl MemoryConnector {
    /// Creates a connector for `server`.
    #[must_use]
    pub fn new(server: MemoryMailServer) -> Self {
        Self { server }
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(&self, account: &Account) -> Result<Box<dyn MailRemote>> {
        self.server.delay().await;
        {
            let mut state = self.server.lock();
            state.counters.connects += 1;
            if state.connect_failures > 0 {
                state.connect_failures -= 1;
                return Err(Error::ConnectionLost {
                    message: "connection refused".to_string(),
                });
            }
        }

        debug!(account_id = %account.id, "Memory session opened");
        Ok(Box::new(MemoryRemote {
            server: self.server.clone(),
            account: account.id.clone(),
            selected: None,
        }))
    }
}

struct MemoryRemote {
    server: MemoryMailServer,
    account: AccountId,
    selected: Option<String>,
}

impl MemoryRemote {
    fn selected(&self) -> Result<&str> {
        self.selected.as_deref().ok_or_else(|| Error::Server {
            message: "no folder selected".to_string(),
        })
    }
}

#[async_trait]
impl MailRemote for MemoryRemote {
    async fn list_folders(&mut self) -> Result<Vec<String>> {
        self.server.delay().await;
        let state = self.server.lock();
        Ok(state
            .mailboxes
            .get(&self.account)
            .map(|folders| folders.keys().cloned().collect())
            .unwrap_or_default())
    }

    async fn select_readonly(&mut self, folder: &str) -> Result<FolderStatus> {
        self.server.delay().await;
        let state = self.server.lock();

        if state.lost_at_folder.as_deref() == Some(folder) {
            return Err(Error::ConnectionLost {
                message: format!("connection reset while selecting '{folder}'"),
            });
        }
        if state
            .failing_folders
            .contains(&(self.account.clone(), folder.to_string()))
        {
            return Err(Error::Server {
                message: format!("folder '{folder}' temporarily unavailable"),
            });
        }

        let entry = state
            .folder(&self.account, folder)
            .ok_or_else(|| Error::FolderNotFound {
                folder: folder.to_string(),
            })?;

        let status = FolderStatus {
            uid_validity: entry.uid_validity,
            exists: u32::try_from(entry.messages.len()).unwrap_or(u32::MAX),
            uid_next: Some(entry.messages.keys().next_back().map_or(1, |last| last + 1)),
        };
        drop(state);

        self.selected = Some(folder.to_string());
        Ok(status)
    }

    async fn search(&mut self, criteria: &SearchCriteria) -> Result<Vec<Uid>> {
        self.server.delay().await;
        let folder = self.selected()?.to_string();
        let state = self.server.lock();
        let Some(entry) = state.folder(&self.account, &folder) else {
            return Ok(Vec::new());
        };

        Ok(entry
            .messages
            .iter()
            .filter(|(uid, _)| criteria.uid_above.map_or(true, |above| **uid > above))
            .filter(|(_, m)| !criteria.unseen_only || !m.flags.is_seen())
            .filter(|(_, m)| {
                criteria
                    .since
                    .map_or(true, |since| m.internal_date.date_naive() >= since)
            })
            .map(|(uid, _)| *uid)
            .collect())
    }

    async fn fetch_envelopes(&mut self, uids: &[Uid]) -> Result<Vec<Envelope>> {
        self.server.delay().await;
        let folder = self.selected()?.to_string();
        let mut state = self.server.lock();
        state.counters.envelope_fetches += 1;
        let Some(entry) = state.folder(&self.account, &folder) else {
            return Ok(Vec::new());
        };

        Ok(uids
            .iter()
            .filter_map(|uid| entry.messages.get(uid).map(|m| (*uid, m)))
            .map(|(uid, message)| {
                let headers = parser::summarize_headers(&message.raw);
                Envelope {
                    uid,
                    message_id: headers.message_id,
                    subject: headers.subject,
                    from: headers.from,
                    date: headers.date.or(Some(message.internal_date)),
                    size: u32::try_from(message.raw.len()).ok(),
                    flags: message.flags.clone(),
                }
            })
            .collect())
    }

    async fn fetch_full(&mut self, uid: Uid) -> Result<Vec<u8>> {
        self.server.delay().await;
        let folder = self.selected()?.to_string();
        let mut state = self.server.lock();
        state.counters.full_fetches += 1;

        if state
            .failing_messages
            .contains(&(self.account.clone(), folder.clone(), uid))
        {
            return Err(Error::Server {
                message: format!("fetch of UID {uid} failed"),
            });
        }

        state
            .folder(&self.account, &folder)
            .and_then(|f| f.messages.get(&uid))
            .map(|m| m.raw.clone())
            .ok_or(Error::MessageUnavailable { uid })
    }

    async fn logout(&mut self) -> Result<()> {
        self.selected = None;
        Ok(())
    }
}
