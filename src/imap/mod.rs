//! [`MailRemote`] over IMAP.
//!
//! [`ImapConnector`] holds one [`ImapEndpoint`] per account and opens
//! authenticated sessions. [`ImapRemote`] maps the capability interface onto
//! IMAP commands without ever changing message state:
//!
//! | Operation | IMAP |
//! |-----------|------|
//! | `select_readonly` | `EXAMINE` |
//! | `search` | `UID SEARCH` |
//! | `fetch_envelopes` | `UID FETCH (UID FLAGS RFC822.SIZE INTERNALDATE ENVELOPE)` |
//! | `fetch_full` | `UID FETCH BODY.PEEK[]` |
//!
//! # Example
//!
//! ```no_run
//! use email_mirror::{AccountId, ImapConnector, ImapEndpoint, TimeoutConfig};
//!
//! # fn example() -> email_mirror::Result<()> {
//! let endpoint = ImapEndpoint::builder()
//!     .email("user@example.com")
//!     .password("app-password")
//!     .host("imap.example.com")
//!     .build()?;
//!
//! let connector = ImapConnector::new(TimeoutConfig::default())
//!     .with_endpoint(AccountId::new("acct-1"), endpoint);
//! # Ok(())
//! # }
//! ```

mod connection;
mod endpoint;

pub use endpoint::{ImapEndpoint, ImapEndpointBuilder};

use crate::config::TimeoutConfig;
use crate::error::{Error, Result};
use crate::model::{Account, AccountId, Envelope, FolderStatus, MessageFlags, SearchCriteria, Uid};
use crate::parser;
use crate::remote::{uid_set, Connector, MailRemote};
use async_imap::imap_proto::{Address, Envelope as WireEnvelope};
use async_imap::types::{Fetch, Flag, NameAttribute};
use async_imap::Session;
use async_trait::async_trait;
use chrono::Utc;
use connection::TlsStream;
use futures::TryStreamExt;
use std::collections::HashMap;
use tokio_rustls::TlsConnector;
use tracing::{debug, instrument};

type ImapSession = Session<TlsStream>;

const ENVELOPE_ITEMS: &str = "(UID FLAGS RFC822.SIZE INTERNALDATE ENVELOPE)";
const BODY_ITEMS: &str = "(UID BODY.PEEK[])";

/// Opens IMAP sessions for registered accounts.
pub struct ImapConnector {
    endpoints: HashMap<AccountId, ImapEndpoint>,
    timeouts: TimeoutConfig,
    tls: TlsConnector,
}

impl ImapConnector {
    /// Creates a connector with no registered accounts.
    ///
    /// Only the `connect` and `auth` entries of `timeouts` are used here;
    /// per-command limits are applied by [`TimedRemote`](crate::TimedRemote).
    #[must_use]
    pub fn new(timeouts: TimeoutConfig) -> Self {
        Self {
            endpoints: HashMap::new(),
            timeouts,
            tls: connection::tls_connector(),
        }
    }

    /// Registers the endpoint of `account`.
    #[must_use]
    pub fn with_endpoint(mut self, account: AccountId, endpoint: ImapEndpoint) -> Self {
        self.register(account, endpoint);
        self
    }

    /// Registers or replaces the endpoint of `account`.
    pub fn register(&mut self, account: AccountId, endpoint: ImapEndpoint) {
        self.endpoints.insert(account, endpoint);
    }

    async fn authenticate(&self, endpoint: &ImapEndpoint, stream: TlsStream) -> Result<ImapSession> {
        let limit = self.timeouts.auth;
        let client = async_imap::Client::new(stream);

        debug!("Authenticating to IMAP server");
        tokio::time::timeout(limit, client.login(endpoint.email(), endpoint.password()))
            .await
            .map_err(|_| Error::AuthTimeout {
                email: endpoint.email().to_string(),
                timeout: limit,
            })?
            .map_err(|(source, _client)| Error::Authentication {
                email: endpoint.email().to_string(),
                source,
            })
    }
}

impl std::fmt::Debug for ImapConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImapConnector")
            .field("endpoints", &self.endpoints)
            .field("timeouts", &self.timeouts)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl Connector for ImapConnector {
    #[instrument(
        name = "ImapConnector::connect",
        skip_all,
        fields(account_id = %account.id, email = %account.email)
    )]
    async fn connect(&self, account: &Account) -> Result<Box<dyn MailRemote>> {
        let endpoint = self
            .endpoints
            .get(&account.id)
            .ok_or_else(|| Error::InvalidConfig {
                message: format!("no IMAP endpoint registered for account {}", account.id),
            })?;

        let stream = connection::open_tls(endpoint, &self.tls, self.timeouts.connect).await?;
        debug!("TLS connection established");

        let session = self.authenticate(endpoint, stream).await?;
        debug!("Authenticated");

        Ok(Box::new(ImapRemote {
            session: Box::new(session),
        }))
    }
}

/// An authenticated IMAP session.
pub struct ImapRemote {
    session: Box<ImapSession>,
}

impl std::fmt::Debug for ImapRemote {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImapRemote").finish_non_exhaustive()
    }
}

/// Maps dropped connections to [`Error::ConnectionLost`], everything else via `other`.
fn classify(
    source: async_imap::error::Error,
    other: impl FnOnce(async_imap::error::Error) -> Error,
) -> Error {
    match source {
        async_imap::error::Error::ConnectionLost => Error::ConnectionLost {
            message: "server closed the connection".to_string(),
        },
        async_imap::error::Error::Io(e) => Error::ConnectionLost {
            message: e.to_string(),
        },
        source => other(source),
    }
}

#[async_trait]
impl MailRemote for ImapRemote {
    #[instrument(name = "ImapRemote::list_folders", skip_all)]
    async fn list_folders(&mut self) -> Result<Vec<String>> {
        let names: Vec<_> = self
            .session
            .list(Some(""), Some("*"))
            .await
            .map_err(|source| classify(source, |source| Error::ImapList { source }))?
            .try_collect()
            .await
            .map_err(|source| classify(source, |source| Error::ImapList { source }))?;

        let folders: Vec<String> = names
            .iter()
            .filter(|name| {
                !name
                    .attributes()
                    .iter()
                    .any(|attr| matches!(attr, NameAttribute::NoSelect))
            })
            .map(|name| name.name().to_string())
            .collect();

        debug!(folder_count = folders.len(), "Listed folders");
        Ok(folders)
    }

    #[instrument(name = "ImapRemote::select_readonly", skip(self), fields(folder = %folder))]
    async fn select_readonly(&mut self, folder: &str) -> Result<FolderStatus> {
        let mailbox = self.session.examine(folder).await.map_err(|source| {
            classify(source, |source| match source {
                async_imap::error::Error::No(_) => Error::FolderNotFound {
                    folder: folder.to_string(),
                },
                source => Error::ExamineFolder {
                    folder: folder.to_string(),
                    source,
                },
            })
        })?;

        let uid_validity = mailbox.uid_validity.ok_or_else(|| Error::MissingValidity {
            folder: folder.to_string(),
        })?;

        debug!(uid_validity, exists = mailbox.exists, "Examined folder");
        Ok(FolderStatus {
            uid_validity,
            exists: mailbox.exists,
            uid_next: mailbox.uid_next,
        })
    }

    #[instrument(name = "ImapRemote::search", skip_all)]
    async fn search(&mut self, criteria: &SearchCriteria) -> Result<Vec<Uid>> {
        let query = criteria.to_imap_query();
        let found = self
            .session
            .uid_search(&query)
            .await
            .map_err(|source| classify(source, |source| Error::ImapSearch { source }))?;

        let mut uids: Vec<Uid> = found.into_iter().collect();
        uids.sort_unstable();
        // "UID n:*" always matches the last message, even below n
        if let Some(above) = criteria.uid_above {
            uids.retain(|uid| *uid > above);
        }

        debug!(query = %query, uid_count = uids.len(), "Searched folder");
        Ok(uids)
    }

    #[instrument(name = "ImapRemote::fetch_envelopes", skip_all, fields(uid_count = uids.len()))]
    async fn fetch_envelopes(&mut self, uids: &[Uid]) -> Result<Vec<Envelope>> {
        if uids.is_empty() {
            return Ok(Vec::new());
        }
        let set = uid_set(uids);
        let fetches: Vec<Fetch> = self
            .session
            .uid_fetch(&set, ENVELOPE_ITEMS)
            .await
            .map_err(|source| {
                classify(source, |source| Error::ImapFetch {
                    uid_set: set.clone(),
                    source,
                })
            })?
            .try_collect()
            .await
            .map_err(|source| {
                classify(source, |source| Error::ImapFetch {
                    uid_set: set.clone(),
                    source,
                })
            })?;

        Ok(fetches.iter().filter_map(envelope_from_fetch).collect())
    }

    #[instrument(name = "ImapRemote::fetch_full", skip(self), fields(uid = uid))]
    async fn fetch_full(&mut self, uid: Uid) -> Result<Vec<u8>> {
        let set = uid.to_string();
        let fetches: Vec<Fetch> = self
            .session
            .uid_fetch(&set, BODY_ITEMS)
            .await
            .map_err(|source| {
                classify(source, |source| Error::ImapFetch {
                    uid_set: set.clone(),
                    source,
                })
            })?
            .try_collect()
            .await
            .map_err(|source| {
                classify(source, |source| Error::ImapFetch {
                    uid_set: set.clone(),
                    source,
                })
            })?;

        fetches
            .iter()
            .find(|fetch| fetch.uid == Some(uid))
            .and_then(|fetch| fetch.body())
            .map(<[u8]>::to_vec)
            .ok_or(Error::MessageUnavailable { uid })
    }

    #[instrument(name = "ImapRemote::logout", skip_all)]
    async fn logout(&mut self) -> Result<()> {
        debug!("Logging out");
        self.session
            .logout()
            .await
            .map_err(|source| Error::ImapLogout { source })
    }
}

fn flag_name(flag: &Flag<'_>) -> String {
    match flag {
        Flag::Seen => MessageFlags::SEEN.to_string(),
        Flag::Flagged => MessageFlags::FLAGGED.to_string(),
        Flag::Answered => "\\Answered".to_string(),
        Flag::Deleted => "\\Deleted".to_string(),
        Flag::Draft => "\\Draft".to_string(),
        Flag::Recent => "\\Recent".to_string(),
        Flag::MayCreate => "\\*".to_string(),
        Flag::Custom(name) => name.to_string(),
    }
}

fn envelope_from_fetch(fetch: &Fetch) -> Option<Envelope> {
    let uid = fetch.uid?;
    let flags: MessageFlags = fetch.flags().map(|flag| flag_name(&flag)).collect();
    let wire = fetch.envelope();

    let date = wire
        .and_then(|env| env.date.as_deref())
        .and_then(|raw| parser::parse_date(&String::from_utf8_lossy(raw)))
        .or_else(|| fetch.internal_date().map(|d| d.with_timezone(&Utc)));

    Some(Envelope {
        uid,
        message_id: wire
            .and_then(|env| env.message_id.as_deref())
            .and_then(|raw| parser::normalize_message_id(&String::from_utf8_lossy(raw))),
        subject: wire
            .and_then(|env| env.subject.as_deref())
            .map(parser::decode_header_value)
            .filter(|s| !s.is_empty()),
        from: wire.and_then(first_sender),
        date,
        size: fetch.size,
        flags,
    })
}

fn first_sender(envelope: &WireEnvelope<'_>) -> Option<String> {
    let address: &Address<'_> = envelope.from.as_ref()?.first()?;
    let mailbox = address.mailbox.as_deref().map(String::from_utf8_lossy);
    let host = address.host.as_deref().map(String::from_utf8_lossy);
    let addr = match (mailbox, host) {
        (Some(m), Some(h)) => format!("{m}@{h}"),
        (Some(m), None) => m.into_owned(),
        _ => return None,
    };

    match address.name.as_deref().map(parser::decode_header_value) {
        Some(name) if !name.is_empty() => Some(format!("{name} <{addr}>")),
        _ => Some(addr),
    }
}
