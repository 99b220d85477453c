//! Immutable key ring snapshot with lazily built, memoized encryptors.

use once_cell::sync::OnceCell;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::encryptor::AuthenticatedEncryptor;
use crate::error::KeyRingError;
use crate::key::Key;
use crate::types::KeyId;

/// One entry in the ring. The encryptor is built on first use and kept for
/// the life of the ring; a failed build is not cached.
struct KeyHolder {
    key: Arc<Key>,
    encryptor: OnceCell<Arc<dyn AuthenticatedEncryptor>>,
}

impl KeyHolder {
    fn new(key: Arc<Key>) -> Arc<Self> {
        Arc::new(Self {
            key,
            encryptor: OnceCell::new(),
        })
    }

    fn encryptor(&self) -> Result<Arc<dyn AuthenticatedEncryptor>, KeyRingError> {
        self.encryptor
            .get_or_try_init(|| self.key.create_encryptor())
            .map(Arc::clone)
            .map_err(|source| KeyRingError::Encryptor {
                key_id: self.key.id(),
                source,
            })
    }
}

/// Snapshot of every known key plus the one designated as default.
///
/// Built once per refresh by the provider and never mutated afterwards.
pub struct KeyRing {
    default_key_id: KeyId,
    default_key: Arc<KeyHolder>,
    keys: HashMap<KeyId, Arc<KeyHolder>>,
}

impl KeyRing {
    /// The default key does not have to appear in `all_keys`; when it does,
    /// both lookups share one entry and one encryptor.
    pub fn new(default_key: Arc<Key>, all_keys: &[Arc<Key>]) -> Self {
        let mut keys: HashMap<KeyId, Arc<KeyHolder>> = HashMap::with_capacity(all_keys.len() + 1);
        for key in all_keys {
            keys.entry(key.id()).or_insert_with(|| KeyHolder::new(Arc::clone(key)));
        }

        let default_key_id = default_key.id();
        let default_key = Arc::clone(
            keys.entry(default_key_id)
                .or_insert_with(|| KeyHolder::new(default_key)),
        );

        Self {
            default_key_id,
            default_key,
            keys,
        }
    }

    pub fn default_key_id(&self) -> KeyId {
        self.default_key_id
    }

    pub fn default_key(&self) -> &Arc<Key> {
        &self.default_key.key
    }

    /// Encryptor for the default key, built on first access.
    pub fn default_authenticated_encryptor(&self) -> Result<Arc<dyn AuthenticatedEncryptor>, KeyRingError> {
        self.default_key.encryptor()
    }

    /// Look up a key's encryptor and current revocation state.
    ///
    /// Returns `Ok(None)` for ids this ring does not know; deciding what that
    /// means (refresh, fail the operation) is up to the caller.
    pub fn get_encryptor_by_key_id(
        &self,
        key_id: &KeyId,
    ) -> Result<Option<(Arc<dyn AuthenticatedEncryptor>, bool)>, KeyRingError> {
        match self.keys.get(key_id) {
            Some(holder) => Ok(Some((holder.encryptor()?, holder.key.is_revoked()))),
            None => Ok(None),
        }
    }

    pub fn contains(&self, key_id: &KeyId) -> bool {
        self.keys.contains_key(key_id)
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

impl fmt::Debug for KeyRing {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyRing")
            .field("default_key_id", &self.default_key_id)
            .field("keys", &self.keys.len())
            .finish()
    }
}
