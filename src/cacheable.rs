//! The cache cell: a key ring plus the conditions under which it stays valid.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::key_ring::KeyRing;
use crate::options::add_saturating;

/// External invalidation signal handed out by the repository.
///
/// Once cancelled it stays cancelled; repositories hand out a fresh token
/// after each change.
pub type ExpirationToken = CancellationToken;

/// A key ring that is trusted until `expiration_time` or until its token fires,
/// whichever comes first.
#[derive(Clone, Debug)]
pub struct CacheableKeyRing {
    expiration_token: ExpirationToken,
    expiration_time: DateTime<Utc>,
    key_ring: Arc<KeyRing>,
}

impl CacheableKeyRing {
    pub fn new(expiration_token: ExpirationToken, expiration_time: DateTime<Utc>, key_ring: Arc<KeyRing>) -> Self {
        Self {
            expiration_token,
            expiration_time,
            key_ring,
        }
    }

    /// Valid iff present, not past its expiration, and not signalled.
    pub fn is_valid(instance: Option<&Self>, now: DateTime<Utc>) -> bool {
        match instance {
            Some(ring) => now < ring.expiration_time && !ring.expiration_token.is_cancelled(),
            None => false,
        }
    }

    pub fn expiration_time(&self) -> DateTime<Utc> {
        self.expiration_time
    }

    pub fn expiration_token(&self) -> &ExpirationToken {
        &self.expiration_token
    }

    pub fn key_ring(&self) -> &Arc<KeyRing> {
        &self.key_ring
    }

    /// Same ring, valid for `period` from `now` and detached from the old token.
    /// Used to keep serving a stale ring for a short while after a refresh fails.
    pub fn with_temporary_extended_lifetime(&self, now: DateTime<Utc>, period: chrono::Duration) -> Self {
        Self {
            expiration_token: CancellationToken::new(),
            expiration_time: add_saturating(now, period),
            key_ring: Arc::clone(&self.key_ring),
        }
    }
}
