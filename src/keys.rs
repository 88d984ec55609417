//! Decryption key lifecycle for job runs.
//!
//! A key is handed over once at submission, either directly or as a
//! short-lived [`KeyToken`] that a [`KeyResolver`] turns into key material
//! inside the worker. The [`KeyVault`] holds it in worker memory for the
//! life of the job (including retries) and nowhere else; nothing here is
//! ever written to a store, log, error or progress event.
//!
//! When the job reaches a terminal state the vault entry is discarded. The
//! key bytes are zeroized as the last reference is dropped.

use crate::crypto::EncryptionKey;
use crate::error::{Error, Result};
use crate::model::{JobId, OwnerId};
use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::debug;

/// Opaque short-lived reference to a key held by the caller's auth context.
pub struct KeyToken(SecretString);

impl KeyToken {
    /// Wraps a token.
    #[must_use]
    pub fn new(token: impl Into<String>) -> Self {
        Self(SecretString::from(token.into()))
    }

    /// Returns the token text for resolution.
    #[must_use]
    pub fn expose(&self) -> &str {
        self.0.expose_secret()
    }
}

impl std::fmt::Debug for KeyToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("KeyToken([REDACTED])")
    }
}

/// How the caller supplies the key for a job.
#[derive(Debug)]
pub enum KeyRef {
    /// Key material supplied directly.
    Direct(EncryptionKey),
    /// Reference resolved inside the worker right before use.
    Deferred(KeyToken),
}

impl From<EncryptionKey> for KeyRef {
    fn from(key: EncryptionKey) -> Self {
        KeyRef::Direct(key)
    }
}

/// Resolves deferred key references.
#[async_trait]
pub trait KeyResolver: Send + Sync {
    /// Turns `token` into key material for `owner`.
    ///
    /// # Errors
    ///
    /// Implementations return [`Error::KeyUnavailable`] when the reference
    /// is unknown or expired.
    async fn resolve(&self, owner: &OwnerId, token: &KeyToken) -> Result<EncryptionKey>;
}

/// Resolver for deployments that only accept direct keys.
#[derive(Debug, Clone, Copy, Default)]
pub struct DirectKeysOnly;

#[async_trait]
impl KeyResolver for DirectKeysOnly {
    async fn resolve(&self, _owner: &OwnerId, _token: &KeyToken) -> Result<EncryptionKey> {
        Err(Error::KeyUnavailable {
            reason: "deferred key references are not supported".to_string(),
        })
    }
}

enum VaultEntry {
    Ready(Arc<EncryptionKey>),
    Pending(KeyToken),
}

/// Per-process holder of the keys of live jobs.
#[derive(Default)]
pub struct KeyVault {
    entries: Mutex<HashMap<JobId, VaultEntry>>,
}

impl KeyVault {
    /// Creates an empty vault.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores the key reference for `job`.
    pub fn deposit(&self, job: JobId, key: KeyRef) {
        let entry = match key {
            KeyRef::Direct(key) => VaultEntry::Ready(Arc::new(key)),
            KeyRef::Deferred(token) => VaultEntry::Pending(token),
        };
        self.lock().insert(job, entry);
    }

    /// Returns `true` if the vault still holds a key for `job`.
    #[must_use]
    pub fn contains(&self, job: JobId) -> bool {
        self.lock().contains_key(&job)
    }

    /// Lends the key for one run of `job`, resolving a deferred reference first.
    ///
    /// A resolved key replaces the token so retries of the same job reuse it.
    ///
    /// # Errors
    ///
    /// Returns [`Error::KeyUnavailable`] if the vault has no entry (for
    /// example after a process restart) or resolution fails.
    pub async fn lease(
        &self,
        job: JobId,
        owner: &OwnerId,
        resolver: &dyn KeyResolver,
    ) -> Result<KeyLease> {
        let pending = {
            let mut entries = self.lock();
            if let Some(VaultEntry::Ready(key)) = entries.get(&job) {
                return Ok(KeyLease {
                    key: Some(Arc::clone(key)),
                });
            }
            match entries.remove(&job) {
                Some(VaultEntry::Pending(token)) => token,
                _ => {
                    return Err(Error::KeyUnavailable {
                        reason: "no key held for this job in this worker".to_string(),
                    })
                }
            }
        };

        debug!(job_id = %job, "Resolving deferred key reference");
        let key = Arc::new(resolver.resolve(owner, &pending).await?);
        drop(pending);

        self.lock().insert(job, VaultEntry::Ready(Arc::clone(&key)));
        Ok(KeyLease { key: Some(key) })
    }

    /// Drops the vault's reference to the key of `job`.
    pub fn discard(&self, job: JobId) {
        if self.lock().remove(&job).is_some() {
            debug!(job_id = %job, "Key discarded");
        }
    }

    /// Number of jobs currently holding a key.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Returns `true` if no job holds a key.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<JobId, VaultEntry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for KeyVault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyVault")
            .field("jobs", &self.len())
            .finish_non_exhaustive()
    }
}

/// Access to a job's key for the duration of one run.
///
/// Wiped on drop; after [`wipe`](Self::wipe) the key can no longer be retrieved.
pub struct KeyLease {
    key: Option<Arc<EncryptionKey>>,
}

impl KeyLease {
    /// Returns the key.
    ///
    /// # Errors
    ///
    /// Returns [`Error::KeyUnavailable`] once the lease has been wiped.
    pub fn key(&self) -> Result<&EncryptionKey> {
        self.key.as_deref().ok_or_else(|| Error::KeyUnavailable {
            reason: "key already wiped".to_string(),
        })
    }

    /// Releases this lease's reference to the key.
    pub fn wipe(&mut self) {
        self.key = None;
    }

    /// Returns `true` until the lease is wiped.
    #[must_use]
    pub fn is_live(&self) -> bool {
        self.key.is_some()
    }
}

impl Drop for KeyLease {
    fn drop(&mut self) {
        self.wipe();
    }
}

impl std::fmt::Debug for KeyLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyLease")
            .field("live", &self.is_live())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::KEY_LEN;

    struct StaticResolver;

    #[async_trait]
    impl KeyResolver for StaticResolver {
        async fn resolve(&self, _owner: &OwnerId, token: &KeyToken) -> Result<EncryptionKey> {
            if token.expose() == "valid" {
                EncryptionKey::from_bytes(&[1u8; KEY_LEN])
            } else {
                Err(Error::KeyUnavailable {
                    reason: "expired".into(),
                })
            }
        }
    }

    #[tokio::test]
    async fn test_direct_key_lease_and_discard() {
        let vault = KeyVault::new();
        let job = JobId::new();
        vault.deposit(job, KeyRef::Direct(EncryptionKey::generate()));

        let lease = vault
            .lease(job, &OwnerId::new("u1"), &DirectKeysOnly)
            .await
            .unwrap();
        assert!(lease.key().is_ok());
        assert!(vault.contains(job));

        vault.discard(job);
        assert!(!vault.contains(job));
        assert!(vault
            .lease(job, &OwnerId::new("u1"), &DirectKeysOnly)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_wiped_lease_is_unretrievable() {
        let vault = KeyVault::new();
        let job = JobId::new();
        vault.deposit(job, EncryptionKey::generate().into());

        let mut lease = vault
            .lease(job, &OwnerId::new("u1"), &DirectKeysOnly)
            .await
            .unwrap();
        lease.wipe();
        assert!(!lease.is_live());
        assert!(matches!(lease.key(), Err(Error::KeyUnavailable { .. })));
    }

    #[tokio::test]
    async fn test_deferred_key_resolved_once() {
        let vault = KeyVault::new();
        let job = JobId::new();
        vault.deposit(job, KeyRef::Deferred(KeyToken::new("valid")));

        let owner = OwnerId::new("u1");
        let first = vault.lease(job, &owner, &StaticResolver).await.unwrap();
        assert!(first.key().is_ok());
        drop(first);

        // Retries reuse the resolved key even without a resolver
        let second = vault.lease(job, &owner, &DirectKeysOnly).await.unwrap();
        assert!(second.key().is_ok());
    }

    #[tokio::test]
    async fn test_failed_resolution_is_authorization_error() {
        let vault = KeyVault::new();
        let job = JobId::new();
        vault.deposit(job, KeyRef::Deferred(KeyToken::new("stale")));

        let err = vault
            .lease(job, &OwnerId::new("u1"), &StaticResolver)
            .await
            .unwrap_err();
        assert!(!err.is_retryable());
        assert!(!vault.contains(job));
    }

    #[test]
    fn test_token_debug_is_redacted() {
        let token = KeyToken::new("very-secret-token");
        assert!(!format!("{token:?}").contains("very-secret-token"));
    }
}
