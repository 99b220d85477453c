//! Key ring provider: builds key rings from the repository and keeps the
//! current one cached.
//!
//! Reads go through an atomically swapped snapshot and never take a lock
//! while the snapshot is valid. A refresh is serialized by a separate mutex.
//! Once any ring exists, callers that find a refresh in progress get the stale
//! ring instead of waiting; only the very first population blocks.

use arc_swap::ArcSwapOption;
use chrono::{DateTime, Utc};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::{Arc, Mutex, PoisonError, TryLockError};
use std::time::Duration;

use crate::cacheable::{CacheableKeyRing, ExpirationToken};
use crate::error::KeyRingError;
use crate::key::Key;
use crate::key_ring::KeyRing;
use crate::options::{add_saturating, KeyManagementOptions};
use crate::repository::KeyRepository;
use crate::resolver::{DefaultKeyResolver, PolicyResolver};

/// Lower bound of the refresh jitter factor; the upper bound is 1.0 (exclusive).
const JITTER_MIN: f64 = 0.8;

// ---------------------------------------------------------------------------
// Ring source
// ---------------------------------------------------------------------------

/// Produces a fresh cacheable key ring. The provider calls this under its
/// refresh lock, so implementations never see concurrent calls from one provider.
pub trait CacheableKeyRingSource: Send + Sync {
    fn get_cacheable_key_ring(&self, now: DateTime<Utc>) -> Result<CacheableKeyRing, KeyRingError>;
}

/// Builds key rings from a repository and a resolver, generating keys when
/// policy asks for one.
pub struct KeyRingFactory {
    repository: Arc<dyn KeyRepository>,
    resolver: Arc<dyn DefaultKeyResolver>,
    auto_generate_keys: bool,
    new_key_lifetime: chrono::Duration,
    refresh_period: Duration,
    jitter: Mutex<StdRng>,
}

impl KeyRingFactory {
    pub fn new(
        repository: Arc<dyn KeyRepository>,
        resolver: Arc<dyn DefaultKeyResolver>,
        options: &KeyManagementOptions,
    ) -> Self {
        let rng = match options.jitter_seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self {
            repository,
            resolver,
            auto_generate_keys: options.auto_generate_keys,
            new_key_lifetime: KeyManagementOptions::chrono(options.new_key_lifetime),
            refresh_period: options.key_ring_refresh_period,
            jitter: Mutex::new(rng),
        }
    }

    /// Builds a ring. `key_just_added` is set on the second pass, after this
    /// build already generated a key; there is never a third pass.
    fn create_cacheable_key_ring(
        &self,
        now: DateTime<Utc>,
        key_just_added: Option<Arc<Key>>,
    ) -> Result<CacheableKeyRing, KeyRingError> {
        // Token first, so a change racing with the read invalidates the result.
        let token = self.repository.cache_expiration_token();
        let all_keys = self.repository.get_all_keys()?;
        let policy = self.resolver.resolve_default_key_policy(now, &all_keys);

        if !policy.should_generate_new_key {
            if let Some(default_key) = &policy.default_key {
                return Ok(self.build(now, token, Arc::clone(default_key), &all_keys));
            }
        }

        if let Some(new_key) = key_just_added {
            let key_to_use = policy
                .default_key
                .or(policy.fallback_key)
                .or_else(|| (!new_key.is_revoked()).then(|| Arc::clone(&new_key)));
            return match key_to_use {
                Some(key) => Ok(self.build(now, token, key, &all_keys)),
                None => {
                    tracing::error!(key_id = %new_key.id(), "newly generated key is not usable as default key");
                    Err(KeyRingError::NoViableKey(new_key.id()))
                }
            };
        }

        if !self.auto_generate_keys {
            return match (policy.default_key, policy.fallback_key) {
                (Some(key), _) => {
                    tracing::warn!(
                        key_id = %key.id(),
                        expiration = %key.expiration_date(),
                        "policy resolution states that a new key should be added to the key ring, \
                         but automatic generation of keys is disabled; using default key"
                    );
                    Ok(self.build(now, token, key, &all_keys))
                }
                (None, Some(key)) => {
                    tracing::warn!(
                        key_id = %key.id(),
                        expiration = %key.expiration_date(),
                        "policy resolution states that a new key should be added to the key ring, \
                         but automatic generation of keys is disabled; using fallback key as default key"
                    );
                    Ok(self.build(now, token, key, &all_keys))
                }
                (None, None) => {
                    tracing::error!("the key ring does not contain a valid default key, and automatic generation of keys is disabled");
                    Err(KeyRingError::NoDefaultKeyAutoGenerateDisabled)
                }
            };
        }

        let activation_date = match &policy.default_key {
            Some(key) => now.max(key.expiration_date()),
            None => now,
        };
        let expiration_date = add_saturating(activation_date, self.new_key_lifetime);
        tracing::info!(
            activation = %activation_date,
            expiration = %expiration_date,
            "policy resolution states that a new key should be added to the key ring"
        );
        let new_key = self.repository.create_new_key(activation_date, expiration_date)?;
        self.create_cacheable_key_ring(now, Some(new_key))
    }

    fn build(
        &self,
        now: DateTime<Utc>,
        token: ExpirationToken,
        default_key: Arc<Key>,
        all_keys: &[Arc<Key>],
    ) -> CacheableKeyRing {
        let next_refresh = add_saturating(now, KeyManagementOptions::chrono(self.refresh_period_with_jitter()));
        // An already expired default (a fallback) must not pin the expiry in the past.
        let expiration_time = if default_key.expiration_date() <= now {
            next_refresh
        } else {
            next_refresh.min(default_key.expiration_date())
        };

        tracing::debug!(
            key_id = %default_key.id(),
            cache_expiration = %expiration_time,
            "using key as default key"
        );
        CacheableKeyRing::new(token, expiration_time, Arc::new(KeyRing::new(default_key, all_keys)))
    }

    fn refresh_period_with_jitter(&self) -> Duration {
        let factor: f64 = self
            .jitter
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .gen_range(JITTER_MIN..1.0);
        Duration::try_from_secs_f64(self.refresh_period.as_secs_f64() * factor).unwrap_or(self.refresh_period)
    }
}

impl CacheableKeyRingSource for KeyRingFactory {
    fn get_cacheable_key_ring(&self, now: DateTime<Utc>) -> Result<CacheableKeyRing, KeyRingError> {
        self.create_cacheable_key_ring(now, None)
    }
}

// ---------------------------------------------------------------------------
// Provider
// ---------------------------------------------------------------------------

/// Process-wide owner of the current key ring.
pub struct KeyRingProvider {
    source: Arc<dyn CacheableKeyRingSource>,
    current: ArcSwapOption<CacheableKeyRing>,
    refresh_lock: Mutex<()>,
    failed_refresh_retry_period: chrono::Duration,
}

impl KeyRingProvider {
    /// Provider over a repository with the standard policy resolver.
    pub fn with_repository(
        repository: Arc<dyn KeyRepository>,
        options: KeyManagementOptions,
    ) -> Result<Self, KeyRingError> {
        let resolver = Arc::new(PolicyResolver::new(&options));
        Self::new(repository, resolver, options)
    }

    pub fn new(
        repository: Arc<dyn KeyRepository>,
        resolver: Arc<dyn DefaultKeyResolver>,
        options: KeyManagementOptions,
    ) -> Result<Self, KeyRingError> {
        options.validate()?;
        let factory = KeyRingFactory::new(repository, resolver, &options);
        Ok(Self::with_source(Arc::new(factory), &options))
    }

    /// Provider over an arbitrary ring source.
    pub fn with_source(source: Arc<dyn CacheableKeyRingSource>, options: &KeyManagementOptions) -> Self {
        Self {
            source,
            current: ArcSwapOption::empty(),
            refresh_lock: Mutex::new(()),
            failed_refresh_retry_period: KeyManagementOptions::chrono(options.failed_refresh_retry_period),
        }
    }

    /// The current key ring, refreshed if the cached one is no longer valid.
    pub fn current_key_ring(&self) -> Result<Arc<KeyRing>, KeyRingError> {
        self.current_key_ring_at(Utc::now(), false)
    }

    /// Rebuild the key ring now, unless another thread is already doing so.
    pub fn refresh_current_key_ring(&self) -> Result<Arc<KeyRing>, KeyRingError> {
        self.current_key_ring_at(Utc::now(), true)
    }

    /// Same as [`current_key_ring`](Self::current_key_ring) with an explicit clock.
    pub fn current_key_ring_at(&self, now: DateTime<Utc>, force_refresh: bool) -> Result<Arc<KeyRing>, KeyRingError> {
        if !force_refresh {
            let cached = self.current.load();
            if let Some(cached) = cached.as_deref() {
                if CacheableKeyRing::is_valid(Some(cached), now) {
                    return Ok(Arc::clone(cached.key_ring()));
                }
            }
        }

        let existing = self.current.load_full();
        let _guard = match &existing {
            Some(stale) => match self.refresh_lock.try_lock() {
                Ok(guard) => guard,
                Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
                Err(TryLockError::WouldBlock) => return Ok(Arc::clone(stale.key_ring())),
            },
            None => self.refresh_lock.lock().unwrap_or_else(PoisonError::into_inner),
        };

        // Another thread may have refreshed while we waited for the lock.
        let existing = self.current.load_full();
        if !force_refresh {
            if let Some(cached) = existing.as_deref() {
                if CacheableKeyRing::is_valid(Some(cached), now) {
                    return Ok(Arc::clone(cached.key_ring()));
                }
            }
        }

        if existing.is_some() && !force_refresh {
            tracing::debug!("existing cached key ring is expired; refreshing");
        }

        match self.source.get_cacheable_key_ring(now) {
            Ok(fresh) => {
                let key_ring = Arc::clone(fresh.key_ring());
                self.current.store(Some(Arc::new(fresh)));
                Ok(key_ring)
            }
            Err(err) => {
                match existing {
                    Some(stale) => {
                        tracing::error!(
                            error = %err,
                            retry_in = %self.failed_refresh_retry_period,
                            "an error occurred while refreshing the key ring; serving the previous key ring until retry"
                        );
                        let grace = stale.with_temporary_extended_lifetime(now, self.failed_refresh_retry_period);
                        self.current.store(Some(Arc::new(grace)));
                    }
                    None => tracing::error!(error = %err, "an error occurred while reading the key ring"),
                }
                Err(err)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::InMemoryKeyRepository;
    use chrono::TimeZone;

    fn seeded(seed: u64) -> KeyManagementOptions {
        KeyManagementOptions {
            jitter_seed: Some(seed),
            ..Default::default()
        }
    }

    #[test]
    fn jitter_stays_within_bounds() {
        let repo = Arc::new(InMemoryKeyRepository::new());
        let factory = KeyRingFactory::new(repo, Arc::new(PolicyResolver::default()), &seeded(1));
        let period = Duration::from_secs(24 * 3600);
        for _ in 0..1000 {
            let p = factory.refresh_period_with_jitter();
            assert!(p >= period.mul_f64(JITTER_MIN));
            assert!(p < period);
        }
    }

    #[test]
    fn same_seed_same_jitter() {
        let a = KeyRingFactory::new(
            Arc::new(InMemoryKeyRepository::new()),
            Arc::new(PolicyResolver::default()),
            &seeded(99),
        );
        let b = KeyRingFactory::new(
            Arc::new(InMemoryKeyRepository::new()),
            Arc::new(PolicyResolver::default()),
            &seeded(99),
        );
        for _ in 0..10 {
            assert_eq!(a.refresh_period_with_jitter(), b.refresh_period_with_jitter());
        }
    }

    #[test]
    fn provider_rejects_invalid_options() {
        let opts = KeyManagementOptions {
            key_ring_refresh_period: Duration::ZERO,
            ..Default::default()
        };
        let res = KeyRingProvider::with_repository(Arc::new(InMemoryKeyRepository::new()), opts);
        assert!(matches!(res, Err(KeyRingError::InvalidOptions(_))));
    }

    #[test]
    fn in_memory_bootstrap_generates_one_key() {
        let now = Utc.with_ymd_and_hms(2015, 3, 1, 0, 0, 0).unwrap();
        let repo = Arc::new(InMemoryKeyRepository::with_clock(move || now));
        let provider = KeyRingProvider::with_repository(repo.clone(), seeded(3)).unwrap();

        let ring = provider.current_key_ring_at(now, false).unwrap();
        let keys = repo.get_all_keys().unwrap();
        assert_eq!(keys.len(), 1);
        assert_eq!(ring.default_key_id(), keys[0].id());
        assert_eq!(keys[0].activation_date(), now);
        assert_eq!(keys[0].expiration_date(), now + chrono::Duration::days(90));

        let again = provider.current_key_ring_at(now + chrono::Duration::hours(1), false).unwrap();
        assert!(Arc::ptr_eq(&ring, &again));
    }

    #[test]
    fn expired_fallback_does_not_pin_expiry_in_the_past() {
        let now = Utc.with_ymd_and_hms(2016, 3, 1, 0, 0, 0).unwrap();
        let repo = Arc::new(InMemoryKeyRepository::with_clock(move || now));
        let desc = Arc::new(crate::encryptor::Aes256GcmDescriptor::from_bytes(&[1u8; 32]).unwrap());
        let old = Arc::new(Key::new(
            crate::types::KeyId::generate(),
            now - chrono::Duration::days(200),
            now - chrono::Duration::days(200),
            now - chrono::Duration::days(1),
            desc,
        ));
        repo.insert_key(old.clone());

        let factory = KeyRingFactory::new(repo, Arc::new(PolicyResolver::default()), &seeded(5));
        let ring = factory.build(now, ExpirationToken::new(), old, &[]);
        assert!(ring.expiration_time() > now);
    }

    fn never_expiring(activation: DateTime<Utc>) -> Arc<Key> {
        let desc = Arc::new(crate::encryptor::Aes256GcmDescriptor::from_bytes(&[4u8; 32]).unwrap());
        Arc::new(Key::new(crate::types::KeyId::generate(), activation, activation, DateTime::<Utc>::MAX_UTC, desc))
    }

    #[test]
    fn key_expiring_at_end_of_time_is_served() {
        let now = Utc.with_ymd_and_hms(2015, 3, 1, 0, 0, 0).unwrap();
        let repo = Arc::new(InMemoryKeyRepository::with_clock(move || now));
        let forever = never_expiring(now - chrono::Duration::days(1));
        repo.insert_key(forever.clone());
        let provider = KeyRingProvider::with_repository(repo.clone(), seeded(6)).unwrap();

        let ring = provider.current_key_ring_at(now, false).unwrap();
        assert_eq!(ring.default_key_id(), forever.id());
        assert_eq!(repo.get_all_keys().unwrap().len(), 1);
    }

    #[test]
    fn successor_near_end_of_time_saturates() {
        let now = DateTime::<Utc>::MAX_UTC - chrono::Duration::days(1);
        let repo = Arc::new(InMemoryKeyRepository::with_clock(move || now));
        let forever = never_expiring(now - chrono::Duration::days(30));
        repo.insert_key(forever.clone());
        let provider = KeyRingProvider::with_repository(repo.clone(), seeded(7)).unwrap();

        let ring = provider.current_key_ring_at(now, false).unwrap();
        assert_eq!(ring.default_key_id(), forever.id());

        let keys = repo.get_all_keys().unwrap();
        assert_eq!(keys.len(), 2);
        let successor = keys.iter().find(|k| k.id() != forever.id()).unwrap();
        assert_eq!(successor.activation_date(), DateTime::<Utc>::MAX_UTC);
        assert_eq!(successor.expiration_date(), DateTime::<Utc>::MAX_UTC);
    }
}
