//! Error types for the key ring.

use crate::types::KeyId;
use thiserror::Error;

// ---------------------------------------------------------------------------
// Top-level key ring error
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum KeyRingError {
    /// Policy asked for a new key, none is usable, and generation is turned off.
    #[error(
        "The key ring does not contain a valid default key, and the key manager is \
         configured with auto-generation of keys disabled."
    )]
    NoDefaultKeyAutoGenerateDisabled,

    /// A key was generated but neither it nor any existing key can serve as default.
    #[error("the key ring has no usable default key, even after generating key {0}")]
    NoViableKey(KeyId),

    #[error("repository error: {0}")]
    Repository(#[from] RepositoryError),

    #[error("cannot create encryptor for key {key_id}: {source}")]
    Encryptor {
        key_id: KeyId,
        #[source]
        source: EncryptorError,
    },

    #[error("invalid key management options: {0}")]
    InvalidOptions(String),
}

// ---------------------------------------------------------------------------
// Collaborator errors
// ---------------------------------------------------------------------------

/// Failures raised while building or using an encryptor.
///
/// `Encrypt` and `Decrypt` carry no detail on purpose: callers get the same
/// error for a bad tag, a truncated payload, or the wrong key.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum EncryptorError {
    #[error("invalid key material")]
    InvalidKeyMaterial,
    #[error("encryption failed")]
    Encrypt,
    #[error("decryption failed")]
    Decrypt,
    #[error("unsupported descriptor: {0}")]
    Unsupported(String),
}

/// Failures raised by a [`KeyRepository`](crate::repository::KeyRepository).
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum RepositoryError {
    #[error("repository unavailable: {0}")]
    Unavailable(String),
    #[error("key not found: {0}")]
    KeyNotFound(KeyId),
    #[error("{0}")]
    Other(String),
}
