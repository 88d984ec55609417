//! Delta computation.

use crate::error::Result;
use crate::model::{FetchFilter, MessageFlags, Scope, SearchCriteria, Uid};
use crate::remote::MailRemote;
use crate::store::{MessageStore, MirrorStore};
use std::collections::{BTreeSet, HashMap};
use tracing::{debug, instrument, warn};

/// Identifiers of one folder that still need downloading.
///
/// Computing a delta leaves the folder selected on the remote, so the
/// persister can fetch from it straight away.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delta {
    /// Folder the identifiers belong to.
    pub folder: String,
    /// Epoch the identifiers belong to.
    pub uid_validity: u32,
    /// Identifiers to fetch, ascending.
    pub uids: Vec<Uid>,
    /// Mirrored flags of the identifiers, where known.
    pub flags: HashMap<Uid, MessageFlags>,
    /// Identifiers dropped by the message cap.
    pub truncated: u64,
}

impl Delta {
    /// Returns `true` if nothing needs fetching.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.uids.is_empty()
    }

    /// Number of identifiers to fetch.
    #[must_use]
    pub fn len(&self) -> usize {
        self.uids.len()
    }
}

/// Works out which identifiers of a folder are not yet persisted.
///
/// Without a filter the delta is everything above the persisted high-water
/// mark plus any mirrored identifier at or below it that was never stored.
/// With a filter it is the server's filtered matches minus what is already
/// persisted, so a message stored by an earlier unfiltered run is never
/// fetched again.
pub struct DeltaFetcher<'a> {
    mirror: &'a dyn MirrorStore,
    messages: &'a dyn MessageStore,
    message_cap: Option<usize>,
}

impl<'a> DeltaFetcher<'a> {
    /// Creates a fetcher reading the mirror and the message store.
    #[must_use]
    pub fn new(mirror: &'a dyn MirrorStore, messages: &'a dyn MessageStore) -> Self {
        Self {
            mirror,
            messages,
            message_cap: None,
        }
    }

    /// Keeps at most `cap` identifiers per folder, preferring the newest.
    #[must_use]
    pub fn message_cap(mut self, cap: Option<usize>) -> Self {
        self.message_cap = cap;
        self
    }

    /// Computes the delta of `folder`.
    ///
    /// # Errors
    ///
    /// Returns an error if the folder cannot be selected or searched, or if
    /// the stores cannot be read.
    #[instrument(
        name = "DeltaFetcher::compute_delta",
        skip_all,
        fields(account_id = %scope.account, folder = %folder, filtered = filter.is_active())
    )]
    pub async fn compute_delta(
        &self,
        remote: &mut dyn MailRemote,
        scope: &Scope,
        folder: &str,
        filter: &FetchFilter,
    ) -> Result<Delta> {
        let status = remote.select_readonly(folder).await?;
        let uid_validity = status.uid_validity;

        let mirrored = self.mirror.folder_state(scope, folder).await?;
        let current_epoch = self.mirror.folder_validity(scope, folder).await? == Some(uid_validity);
        if !current_epoch && !mirrored.is_empty() {
            warn!(
                folder = %folder,
                uid_validity,
                "Mirror belongs to a different epoch, ignoring mirrored flags"
            );
        }
        let flags: HashMap<Uid, MessageFlags> = if current_epoch {
            mirrored
                .iter()
                .map(|row| (row.uid, row.flags.clone()))
                .collect()
        } else {
            HashMap::new()
        };

        let persisted = self
            .messages
            .persisted_uids(scope, folder, uid_validity)
            .await?;

        let candidates: BTreeSet<Uid> = if filter.is_active() {
            let matches = remote.search(&filter.criteria()).await?;
            matches
                .into_iter()
                .filter(|uid| !persisted.contains(uid))
                .collect()
        } else {
            let high_water = persisted.last().copied();
            let above = remote
                .search(&SearchCriteria {
                    uid_above: high_water,
                    ..SearchCriteria::all()
                })
                .await?;
            let gaps = flags
                .keys()
                .copied()
                .filter(|uid| high_water.is_some_and(|hw| *uid <= hw))
                .filter(|uid| !persisted.contains(uid));

            above.into_iter().chain(gaps).collect()
        };

        let mut uids: Vec<Uid> = candidates.into_iter().collect();
        let mut truncated = 0;
        if let Some(cap) = self.message_cap {
            if uids.len() > cap {
                let dropped = uids.len() - cap;
                uids.drain(..dropped);
                truncated = dropped as u64;
                debug!(folder = %folder, cap, dropped, "Delta truncated to the newest messages");
            }
        }

        let flags = uids
            .iter()
            .filter_map(|uid| flags.get(uid).map(|f| (*uid, f.clone())))
            .collect();

        debug!(
            folder = %folder,
            uid_validity,
            persisted = persisted.len(),
            delta = uids.len(),
            "Delta computed"
        );

        Ok(Delta {
            folder: folder.to_string(),
            uid_validity,
            uids,
            flags,
            truncated,
        })
    }
}

impl std::fmt::Debug for DeltaFetcher<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeltaFetcher")
            .field("message_cap", &self.message_cap)
            .finish_non_exhaustive()
    }
}
