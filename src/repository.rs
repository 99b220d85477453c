//! Key repositories: where keys come from and where new ones go.

use chrono::{DateTime, Utc};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use tokio_util::sync::CancellationToken;

use crate::cacheable::ExpirationToken;
use crate::encryptor::{Aes256GcmDescriptor, EncryptorDescriptor};
use crate::error::RepositoryError;
use crate::key::Key;
use crate::types::KeyId;

// ---------------------------------------------------------------------------
// Repository trait
// ---------------------------------------------------------------------------

/// Persistence seam for keys.
///
/// Implement this for your infrastructure. The key ring provider only needs
/// three things from it: every known key, a way to add one, and a token that
/// fires whenever the key set changes.
pub trait KeyRepository: Send + Sync {
    fn get_all_keys(&self) -> Result<Vec<Arc<Key>>, RepositoryError>;

    fn create_new_key(
        &self,
        activation_date: DateTime<Utc>,
        expiration_date: DateTime<Utc>,
    ) -> Result<Arc<Key>, RepositoryError>;

    /// Token for the current generation of the key set. Fetch it *before*
    /// reading keys so a concurrent change is never missed.
    fn cache_expiration_token(&self) -> ExpirationToken;
}

// ---------------------------------------------------------------------------
// In-memory repository
// ---------------------------------------------------------------------------

type Clock = Box<dyn Fn() -> DateTime<Utc> + Send + Sync>;

/// In-memory repository (for testing and ephemeral use). Keys vanish with the process.
pub struct InMemoryKeyRepository {
    keys: RwLock<Vec<Arc<Key>>>,
    token: Mutex<CancellationToken>,
    clock: Clock,
}

impl InMemoryKeyRepository {
    pub fn new() -> Self {
        Self::with_clock(Utc::now)
    }

    /// Use a custom clock for key creation timestamps.
    pub fn with_clock(clock: impl Fn() -> DateTime<Utc> + Send + Sync + 'static) -> Self {
        tracing::warn!("using an in-memory repository; keys will not be persisted to storage");
        Self {
            keys: RwLock::new(Vec::new()),
            token: Mutex::new(CancellationToken::new()),
            clock: Box::new(clock),
        }
    }

    /// Add an externally built key.
    pub fn insert_key(&self, key: Arc<Key>) {
        tracing::debug!(key_id = %key.id(), "found key");
        self.keys
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(key);
        self.trigger_cache_expiration("InsertKey");
    }

    /// Revoke a single key.
    pub fn revoke_key(&self, key_id: &KeyId, reason: &str) -> Result<(), RepositoryError> {
        let key = self
            .keys
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .find(|k| k.id() == *key_id)
            .cloned()
            .ok_or(RepositoryError::KeyNotFound(*key_id))?;

        tracing::info!(key_id = %key_id, revocation_date = %(self.clock)(), reason, "revoking key");
        key.revoke();
        self.trigger_cache_expiration("RevokeKey");
        Ok(())
    }

    /// Revoke every key created at or before `revocation_date`.
    /// Returns how many keys changed state.
    pub fn revoke_all_keys(&self, revocation_date: DateTime<Utc>, reason: &str) -> usize {
        tracing::info!(revocation_date = %revocation_date, reason, "revoking all keys");
        let revoked = self
            .keys
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|k| k.creation_date() <= revocation_date)
            .filter(|k| k.revoke())
            .count();
        self.trigger_cache_expiration("RevokeAllKeys");
        revoked
    }

    fn trigger_cache_expiration(&self, operation: &str) {
        let old = {
            let mut token = self.token.lock().unwrap_or_else(PoisonError::into_inner);
            std::mem::replace(&mut *token, CancellationToken::new())
        };
        tracing::debug!(operation, "key cache expiration token triggered");
        old.cancel();
    }
}

impl Default for InMemoryKeyRepository {
    fn default() -> Self {
        Self::new()
    }
}

impl KeyRepository for InMemoryKeyRepository {
    fn get_all_keys(&self) -> Result<Vec<Arc<Key>>, RepositoryError> {
        Ok(self.keys.read().unwrap_or_else(PoisonError::into_inner).clone())
    }

    fn create_new_key(
        &self,
        activation_date: DateTime<Utc>,
        expiration_date: DateTime<Utc>,
    ) -> Result<Arc<Key>, RepositoryError> {
        let descriptor: Arc<dyn EncryptorDescriptor> = Arc::new(
            Aes256GcmDescriptor::generate().map_err(|e| RepositoryError::Other(e.to_string()))?,
        );
        let id = KeyId::generate();
        let creation_date = (self.clock)();

        tracing::info!(
            key_id = %id,
            creation = %creation_date,
            activation = %activation_date,
            expiration = %expiration_date,
            "creating key"
        );

        let key = Arc::new(Key::new(id, creation_date, activation_date, expiration_date, descriptor));
        self.keys
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Arc::clone(&key));
        self.trigger_cache_expiration("CreateNewKey");
        Ok(key)
    }

    fn cache_expiration_token(&self) -> ExpirationToken {
        self.token.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}
