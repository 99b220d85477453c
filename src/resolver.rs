//! Default key policy: which key encrypts new payloads, and whether a new key is due.
//!
//! Resolution is a pure function of `now` and the key set. Per-key problems
//! (revoked, expired, broken descriptor, not yet active) only disqualify that
//! key; they never fail the resolution.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;

use crate::key::Key;
use crate::options::{add_saturating, sub_saturating, KeyManagementOptions};
use crate::types::KeyId;

// ---------------------------------------------------------------------------
// Resolution result
// ---------------------------------------------------------------------------

/// Outcome of one policy evaluation.
#[derive(Clone, Debug, Default)]
pub struct DefaultKeyResolution {
    /// Key new payloads should be protected with.
    pub default_key: Option<Arc<Key>>,
    /// Usable older key, populated only when there is no default.
    pub fallback_key: Option<Arc<Key>>,
    /// The caller should generate a key (immediately, or as a successor).
    pub should_generate_new_key: bool,
}

/// Policy seam used by the key ring provider.
pub trait DefaultKeyResolver: Send + Sync {
    fn resolve_default_key_policy(&self, now: DateTime<Utc>, all_keys: &[Arc<Key>]) -> DefaultKeyResolution;
}

// ---------------------------------------------------------------------------
// Policy resolver
// ---------------------------------------------------------------------------

/// The standard resolver.
#[derive(Clone, Debug)]
pub struct PolicyResolver {
    max_clock_skew: chrono::Duration,
    key_propagation_window: chrono::Duration,
}

impl PolicyResolver {
    pub fn new(options: &KeyManagementOptions) -> Self {
        Self {
            max_clock_skew: KeyManagementOptions::chrono(options.max_clock_skew),
            key_propagation_window: KeyManagementOptions::chrono(options.key_propagation_window),
        }
    }
}

impl Default for PolicyResolver {
    fn default() -> Self {
        Self::new(&KeyManagementOptions::default())
    }
}

impl DefaultKeyResolver for PolicyResolver {
    fn resolve_default_key_policy(&self, now: DateTime<Utc>, all_keys: &[Arc<Key>]) -> DefaultKeyResolution {
        let mut viability = Viability::default();

        if let Some(default_key) = self.find_default_key(now, all_keys, &mut viability) {
            let should_generate_new_key = !self.has_successor(now, &default_key, all_keys, &mut viability);
            if should_generate_new_key {
                tracing::debug!(
                    key_id = %default_key.id(),
                    expiration = %default_key.expiration_date(),
                    "default key expiration imminent and repository contains no viable successor; caller should generate a successor"
                );
            }
            return DefaultKeyResolution {
                default_key: Some(default_key),
                fallback_key: None,
                should_generate_new_key,
            };
        }

        let fallback_key = self.find_fallback_key(now, all_keys, &mut viability);
        tracing::debug!(
            fallback_key_id = ?fallback_key.as_ref().map(|k| k.id()),
            "repository contains no viable default key; caller should generate a key with immediate activation"
        );
        DefaultKeyResolution {
            default_key: None,
            fallback_key,
            should_generate_new_key: true,
        }
    }
}

impl PolicyResolver {
    /// Newest-activated viable key whose activation falls within `now + skew`.
    fn find_default_key(
        &self,
        now: DateTime<Utc>,
        all_keys: &[Arc<Key>],
        viability: &mut Viability,
    ) -> Option<Arc<Key>> {
        let activation_limit = add_saturating(now, self.max_clock_skew);
        let mut candidates: Vec<&Arc<Key>> = all_keys
            .iter()
            .filter(|k| k.activation_date() <= activation_limit)
            .collect();
        candidates.sort_by(|a, b| {
            b.activation_date()
                .cmp(&a.activation_date())
                .then_with(|| a.id().cmp(&b.id()))
        });

        for key in candidates {
            tracing::debug!(
                key_id = %key.id(),
                expiration = %key.expiration_date(),
                "considering key as default key"
            );

            let reason = if key.is_revoked() {
                Some("revoked")
            } else if key.expiration_date() <= key.activation_date() {
                Some("expires before activation")
            } else if key.is_expired(now) {
                Some("expired")
            } else if !viability.check(key) {
                Some("cannot be deciphered")
            } else {
                None
            };

            match reason {
                Some(reason) => {
                    tracing::debug!(key_id = %key.id(), reason, "key is no longer under consideration as default key");
                }
                None => return Some(Arc::clone(key)),
            }
        }
        None
    }

    /// A successor is any viable key that is active by the time `default_key`
    /// expires and still valid once a freshly generated key would have propagated.
    /// The default key itself counts while it is far from expiry.
    fn has_successor(
        &self,
        now: DateTime<Utc>,
        default_key: &Arc<Key>,
        all_keys: &[Arc<Key>],
        viability: &mut Viability,
    ) -> bool {
        let activation_limit = add_saturating(default_key.expiration_date(), self.max_clock_skew);
        let propagated_at = add_saturating(now, self.key_propagation_window);
        all_keys.iter().any(|k| {
            k.activation_date() <= activation_limit
                && k.activation_date() < k.expiration_date()
                && !k.is_expired(propagated_at)
                && !k.is_revoked()
                && viability.check(k)
        })
    }

    /// Most recently created usable key activated at least one propagation
    /// window ago, otherwise the oldest usable key of all.
    fn find_fallback_key(
        &self,
        now: DateTime<Utc>,
        all_keys: &[Arc<Key>],
        viability: &mut Viability,
    ) -> Option<Arc<Key>> {
        let propagated_cutoff = sub_saturating(now, self.key_propagation_window);

        let mut propagated: Vec<&Arc<Key>> = all_keys
            .iter()
            .filter(|k| k.activation_date() <= propagated_cutoff)
            .collect();
        propagated.sort_by(|a, b| b.creation_date().cmp(&a.creation_date()));

        let mut oldest_first: Vec<&Arc<Key>> = all_keys.iter().collect();
        oldest_first.sort_by_key(|k| k.creation_date());

        propagated
            .into_iter()
            .chain(oldest_first)
            .find(|k| k.activation_date() < k.expiration_date() && !k.is_revoked() && viability.check(k))
            .cloned()
    }
}

// ---------------------------------------------------------------------------
// Encryptor viability (memoized per resolution)
// ---------------------------------------------------------------------------

#[derive(Default)]
struct Viability {
    seen: HashMap<KeyId, bool>,
}

impl Viability {
    fn check(&mut self, key: &Key) -> bool {
        *self.seen.entry(key.id()).or_insert_with(|| match key.create_encryptor() {
            Ok(_) => true,
            Err(e) => {
                tracing::warn!(
                    key_id = %key.id(),
                    error = %e,
                    "key is ineligible to be the default key because its create_encryptor method failed"
                );
                false
            }
        })
    }
}
