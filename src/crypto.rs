//! Per-leg message cipher.
//!
//! Every framed message is sealed independently with AES-256-GCM under a
//! fresh random nonce. The nonce travels in front of the ciphertext, so a
//! sealed message is self-contained:
//!
//! ```text
//! [nonce: 12 bytes][ciphertext][tag: 16 bytes]
//! ```

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Key size in bytes.
pub const KEY_SIZE: usize = 32;

/// Nonce size in bytes.
pub const NONCE_SIZE: usize = 12;

/// Authentication tag size in bytes.
pub const TAG_SIZE: usize = 16;

/// Bytes a sealed message carries on top of its plaintext.
pub const SEAL_OVERHEAD: usize = NONCE_SIZE + TAG_SIZE;

/// Largest plaintext accepted for a single message.
pub const MAX_MESSAGE_SIZE: usize = 64 * 1024;

/// Cipher error types.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CryptoError {
    #[error("message of {0} bytes exceeds the size limit")]
    MessageTooLarge(usize),

    #[error("failed to generate nonce")]
    NonceGeneration,

    #[error("encryption failed")]
    Encrypt,

    #[error("sealed message too short: {0} bytes")]
    Truncated(usize),

    #[error("decryption failed")]
    Decrypt,
}

/// Result type for cipher operations.
pub type CryptoResult<T> = std::result::Result<T, CryptoError>;

/// A symmetric key derived from a configured secret.
#[derive(Clone, PartialEq, Eq)]
pub struct CipherKey([u8; KEY_SIZE]);

impl CipherKey {
    /// Derives a key from a secret string.
    ///
    /// Returns `None` for an empty secret, which leaves the leg unkeyed.
    pub fn derive(secret: &str) -> Option<Self> {
        if secret.is_empty() {
            return None;
        }

        let digest = Sha256::digest(secret.as_bytes());
        let mut key = [0u8; KEY_SIZE];
        key.copy_from_slice(&digest);
        Some(Self(key))
    }

    /// Get the raw key bytes.
    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.0
    }
}

impl std::fmt::Debug for CipherKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("CipherKey(..)")
    }
}

/// Seals and opens whole messages under one [`CipherKey`].
#[derive(Clone)]
pub struct MessageCipher {
    aead: Aes256Gcm,
}

impl MessageCipher {
    pub fn new(key: &CipherKey) -> Self {
        Self {
            aead: Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key.as_bytes())),
        }
    }

    /// Encrypts `plaintext` as one message.
    pub fn seal(&self, plaintext: &[u8]) -> CryptoResult<Vec<u8>> {
        if plaintext.len() > MAX_MESSAGE_SIZE {
            return Err(CryptoError::MessageTooLarge(plaintext.len()));
        }

        let mut nonce = [0u8; NONCE_SIZE];
        getrandom::getrandom(&mut nonce).map_err(|_| CryptoError::NonceGeneration)?;

        let ciphertext = self
            .aead
            .encrypt(Nonce::from_slice(&nonce), plaintext)
            .map_err(|_| CryptoError::Encrypt)?;

        let mut sealed = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
        sealed.extend_from_slice(&nonce);
        sealed.extend_from_slice(&ciphertext);
        Ok(sealed)
    }

    /// Decrypts one sealed message.
    pub fn open(&self, sealed: &[u8]) -> CryptoResult<Vec<u8>> {
        if sealed.len() < SEAL_OVERHEAD {
            return Err(CryptoError::Truncated(sealed.len()));
        }

        let (nonce, ciphertext) = sealed.split_at(NONCE_SIZE);
        self.aead
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| CryptoError::Decrypt)
    }
}

impl std::fmt::Debug for MessageCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("MessageCipher(..)")
    }
}
