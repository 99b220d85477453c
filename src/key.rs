//! A single key: identity, validity window, revocation, and its encryptor descriptor.

use chrono::{DateTime, Utc};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::encryptor::{AuthenticatedEncryptor, EncryptorDescriptor};
use crate::error::EncryptorError;
use crate::types::KeyId;

/// One key as seen by the key ring.
///
/// Everything except the revocation flag is fixed at construction. Revocation
/// only ever moves `false → true`.
pub struct Key {
    id: KeyId,
    creation_date: DateTime<Utc>,
    activation_date: DateTime<Utc>,
    expiration_date: DateTime<Utc>,
    revoked: AtomicBool,
    descriptor: Arc<dyn EncryptorDescriptor>,
}

impl Key {
    pub fn new(
        id: KeyId,
        creation_date: DateTime<Utc>,
        activation_date: DateTime<Utc>,
        expiration_date: DateTime<Utc>,
        descriptor: Arc<dyn EncryptorDescriptor>,
    ) -> Self {
        Self {
            id,
            creation_date,
            activation_date,
            expiration_date,
            revoked: AtomicBool::new(false),
            descriptor,
        }
    }

    pub fn id(&self) -> KeyId {
        self.id
    }

    pub fn creation_date(&self) -> DateTime<Utc> {
        self.creation_date
    }

    pub fn activation_date(&self) -> DateTime<Utc> {
        self.activation_date
    }

    pub fn expiration_date(&self) -> DateTime<Utc> {
        self.expiration_date
    }

    pub fn is_revoked(&self) -> bool {
        self.revoked.load(Ordering::Acquire)
    }

    /// Mark the key revoked. Returns `true` if this call flipped the flag.
    pub fn revoke(&self) -> bool {
        !self.revoked.swap(true, Ordering::AcqRel)
    }

    /// Expired at `now` (expiration is exclusive).
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expiration_date <= now
    }

    /// Build a fresh encryptor from the descriptor. Not memoized here; the
    /// key ring caches the result per ring.
    pub fn create_encryptor(&self) -> Result<Arc<dyn AuthenticatedEncryptor>, EncryptorError> {
        self.descriptor.create_encryptor(&self.id)
    }
}

impl fmt::Debug for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Key")
            .field("id", &self.id)
            .field("creation_date", &self.creation_date)
            .field("activation_date", &self.activation_date)
            .field("expiration_date", &self.expiration_date)
            .field("revoked", &self.is_revoked())
            .finish_non_exhaustive()
    }
}
