//! Field encryption and dedup-key hashing for stored messages.
//!
//! Fields are sealed with AES-256-GCM under the job's key. The sealed form is
//! `nonce || ciphertext` with a fresh random 96-bit nonce per field.

use crate::error::{Error, Result};
use crate::model::DedupKey;
use aes_gcm::aead::rand_core::RngCore;
use aes_gcm::aead::{Aead, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Nonce};
use secrecy::{ExposeSecret, SecretBox};
use sha2::{Digest, Sha256};
use std::fmt::Write as _;

/// Length of an [`EncryptionKey`] in bytes.
pub const KEY_LEN: usize = 32;

/// Nonce size for AES-GCM (96 bits / 12 bytes)
const NONCE_SIZE: usize = 12;

/// A 256-bit message encryption key.
///
/// The bytes live in a [`SecretBox`] and are zeroized when the key is dropped.
/// `Debug` never prints key material.
pub struct EncryptionKey(SecretBox<[u8; KEY_LEN]>);

impl EncryptionKey {
    /// Copies key material into a new key.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidKey`] unless `bytes` is exactly [`KEY_LEN`] long.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != KEY_LEN {
            return Err(Error::InvalidKey {
                length: bytes.len(),
            });
        }
        let mut material = Box::new([0u8; KEY_LEN]);
        material.copy_from_slice(bytes);
        Ok(Self(SecretBox::new(material)))
    }

    /// Generates a random key.
    #[must_use]
    pub fn generate() -> Self {
        let mut material = Box::new([0u8; KEY_LEN]);
        OsRng.fill_bytes(material.as_mut_slice());
        Self(SecretBox::new(material))
    }

    pub(crate) fn expose(&self) -> &[u8; KEY_LEN] {
        self.0.expose_secret()
    }
}

impl From<SecretBox<[u8; KEY_LEN]>> for EncryptionKey {
    fn from(secret: SecretBox<[u8; KEY_LEN]>) -> Self {
        Self(secret)
    }
}

impl std::fmt::Debug for EncryptionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("EncryptionKey([REDACTED])")
    }
}

/// Seals and opens message fields under one key.
///
/// The expanded AES key schedule is zeroized when the cipher is dropped.
pub struct MessageCipher {
    cipher: Aes256Gcm,
}

impl MessageCipher {
    /// Creates a cipher for `key`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidKey`] if the key schedule cannot be built.
    pub fn new(key: &EncryptionKey) -> Result<Self> {
        let cipher =
            Aes256Gcm::new_from_slice(key.expose()).map_err(|_| Error::InvalidKey { length: KEY_LEN })?;
        Ok(Self { cipher })
    }

    /// Encrypts `plaintext`, returning `nonce || ciphertext`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Encryption`] if the AEAD rejects the input.
    pub fn seal(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let mut nonce_bytes = [0u8; NONCE_SIZE];
        OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = self
            .cipher
            .encrypt(nonce, plaintext)
            .map_err(|_| Error::Encryption)?;

        let mut sealed = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
        sealed.extend_from_slice(&nonce_bytes);
        sealed.extend_from_slice(&ciphertext);
        Ok(sealed)
    }

    /// Decrypts the output of [`seal`](Self::seal).
    ///
    /// # Errors
    ///
    /// Returns [`Error::Decryption`] on truncated input, a wrong key or tampering.
    pub fn open(&self, sealed: &[u8]) -> Result<Vec<u8>> {
        if sealed.len() < NONCE_SIZE {
            return Err(Error::Decryption {
                message: format!("sealed data too short: {} bytes", sealed.len()),
            });
        }

        let (nonce_bytes, ciphertext) = sealed.split_at(NONCE_SIZE);
        self.cipher
            .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
            .map_err(|_| Error::Decryption {
                message: "authentication failed (wrong key or corrupted data)".to_string(),
            })
    }
}

impl std::fmt::Debug for MessageCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageCipher").finish_non_exhaustive()
    }
}

/// Computes the account-scoped identity of a message.
///
/// Uses the `Message-ID` when present (angle brackets and surrounding
/// whitespace ignored), otherwise the raw bytes. Both are hashed so the key
/// reveals nothing about the message.
#[must_use]
pub fn dedup_key(message_id: Option<&str>, raw: &[u8]) -> DedupKey {
    let normalized = message_id
        .map(|id| id.trim().trim_start_matches('<').trim_end_matches('>').trim())
        .filter(|id| !id.is_empty());

    match normalized {
        Some(id) => DedupKey::from_raw(format!("mid:{}", sha256_hex(id.as_bytes()))),
        None => DedupKey::from_raw(format!("sha256:{}", sha256_hex(raw))),
    }
}

fn sha256_hex(data: &[u8]) -> String {
    let digest = Sha256::digest(data);
    let mut out = String::with_capacity(digest.len() * 2);
    for byte in digest {
        let _ = write!(out, "{byte:02x}");
    }
    out
}
