//! Key management options: rotation cadence, cache lifetime, clock tolerance.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::KeyRingError;

const DAY: u64 = 86400;

/// Shortest lifetime accepted for newly generated keys.
pub const MIN_NEW_KEY_LIFETIME: Duration = Duration::from_secs(7 * DAY);

/// Longest value accepted for any duration option.
pub const MAX_OPTION_DURATION: Duration = Duration::from_secs(100 * 365 * DAY);

/// Options governing key generation and key ring caching.
///
/// Every field has a default, so a partial JSON document is enough:
///
/// ```
/// use citadel_keyring::KeyManagementOptions;
///
/// let opts = KeyManagementOptions::from_json(r#"{ "auto_generate_keys": false }"#).unwrap();
/// assert!(!opts.auto_generate_keys);
/// assert_eq!(opts.new_key_lifetime.as_secs(), 90 * 86400);
/// ```
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct KeyManagementOptions {
    /// Generate keys automatically when policy asks for one.
    pub auto_generate_keys: bool,
    /// Validity window given to newly generated keys.
    pub new_key_lifetime: Duration,
    /// Upper bound on how long a cached key ring is trusted.
    pub key_ring_refresh_period: Duration,
    /// Time a new key needs to reach every instance before it may become active.
    pub key_propagation_window: Duration,
    /// Tolerated clock drift between instances sharing a repository.
    pub max_clock_skew: Duration,
    /// How long a stale ring keeps being served after a refresh fails.
    pub failed_refresh_retry_period: Duration,
    /// Seed for refresh jitter. `None` seeds from the OS.
    pub jitter_seed: Option<u64>,
}

impl Default for KeyManagementOptions {
    fn default() -> Self {
        Self {
            auto_generate_keys: true,
            new_key_lifetime: Duration::from_secs(90 * DAY),
            key_ring_refresh_period: Duration::from_secs(DAY),
            key_propagation_window: Duration::from_secs(2 * DAY),
            max_clock_skew: Duration::from_secs(5 * 60),
            failed_refresh_retry_period: Duration::from_secs(2 * 60),
            jitter_seed: None,
        }
    }
}

impl KeyManagementOptions {
    /// Parse from JSON and validate.
    pub fn from_json(json: &str) -> Result<Self, KeyRingError> {
        let opts: Self = serde_json::from_str(json)
            .map_err(|e| KeyRingError::InvalidOptions(format!("parse: {}", e)))?;
        opts.validate()?;
        Ok(opts)
    }

    pub fn validate(&self) -> Result<(), KeyRingError> {
        if self.new_key_lifetime < MIN_NEW_KEY_LIFETIME {
            return Err(KeyRingError::InvalidOptions(format!(
                "new_key_lifetime must be at least {} days",
                MIN_NEW_KEY_LIFETIME.as_secs() / DAY
            )));
        }
        for (name, value) in [
            ("key_ring_refresh_period", self.key_ring_refresh_period),
            ("failed_refresh_retry_period", self.failed_refresh_retry_period),
        ] {
            if value.is_zero() {
                return Err(KeyRingError::InvalidOptions(format!("{} must be non-zero", name)));
            }
        }
        for (name, value) in [
            ("new_key_lifetime", self.new_key_lifetime),
            ("key_ring_refresh_period", self.key_ring_refresh_period),
            ("key_propagation_window", self.key_propagation_window),
            ("max_clock_skew", self.max_clock_skew),
            ("failed_refresh_retry_period", self.failed_refresh_retry_period),
        ] {
            if value > MAX_OPTION_DURATION {
                return Err(KeyRingError::InvalidOptions(format!(
                    "{} must not exceed {} days",
                    name,
                    MAX_OPTION_DURATION.as_secs() / DAY
                )));
            }
        }
        Ok(())
    }

    /// Options that skipped `validate` are clamped to `MAX_OPTION_DURATION`.
    pub(crate) fn chrono(d: Duration) -> chrono::Duration {
        let d = d.min(MAX_OPTION_DURATION);
        chrono::Duration::seconds(d.as_secs() as i64) + chrono::Duration::nanoseconds(i64::from(d.subsec_nanos()))
    }
}

/// `t + d`, pinned to the representable range instead of overflowing.
pub(crate) fn add_saturating(t: DateTime<Utc>, d: chrono::Duration) -> DateTime<Utc> {
    t.checked_add_signed(d).unwrap_or(if d < chrono::Duration::zero() {
        DateTime::<Utc>::MIN_UTC
    } else {
        DateTime::<Utc>::MAX_UTC
    })
}

/// `t - d`, pinned to the representable range instead of overflowing.
pub(crate) fn sub_saturating(t: DateTime<Utc>, d: chrono::Duration) -> DateTime<Utc> {
    t.checked_sub_signed(d).unwrap_or(if d < chrono::Duration::zero() {
        DateTime::<Utc>::MAX_UTC
    } else {
        DateTime::<Utc>::MIN_UTC
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn defaults_match_documented_values() {
        let o = KeyManagementOptions::default();
        assert!(o.auto_generate_keys);
        assert_eq!(o.new_key_lifetime, Duration::from_secs(90 * DAY));
        assert_eq!(o.key_ring_refresh_period, Duration::from_secs(24 * 3600));
        assert_eq!(o.key_propagation_window, Duration::from_secs(2 * DAY));
        assert_eq!(o.max_clock_skew, Duration::from_secs(300));
        assert!(o.validate().is_ok());
    }

    #[test]
    fn rejects_short_key_lifetime() {
        let o = KeyManagementOptions {
            new_key_lifetime: Duration::from_secs(DAY),
            ..Default::default()
        };
        assert!(matches!(o.validate(), Err(KeyRingError::InvalidOptions(_))));
    }

    #[test]
    fn rejects_zero_refresh_period() {
        let o = KeyManagementOptions {
            key_ring_refresh_period: Duration::ZERO,
            ..Default::default()
        };
        assert!(o.validate().is_err());
    }

    #[test]
    fn json_roundtrip_and_partial_documents() {
        let o = KeyManagementOptions {
            jitter_seed: Some(42),
            ..Default::default()
        };
        let json = serde_json::to_string(&o).unwrap();
        assert_eq!(KeyManagementOptions::from_json(&json).unwrap(), o);

        let partial = KeyManagementOptions::from_json(r#"{ "jitter_seed": 7 }"#).unwrap();
        assert_eq!(partial.jitter_seed, Some(7));
        assert!(partial.auto_generate_keys);
    }

    #[test]
    fn rejects_unrepresentable_durations() {
        let err = KeyManagementOptions::from_json(r#"{ "max_clock_skew": { "secs": 18446744073709551615, "nanos": 0 } }"#);
        assert!(matches!(err, Err(KeyRingError::InvalidOptions(_))));

        let o = KeyManagementOptions {
            key_propagation_window: MAX_OPTION_DURATION + Duration::from_secs(1),
            ..Default::default()
        };
        assert!(o.validate().is_err());

        let o = KeyManagementOptions {
            new_key_lifetime: MAX_OPTION_DURATION,
            ..Default::default()
        };
        assert!(o.validate().is_ok());
    }

    #[test]
    fn unvalidated_durations_are_clamped() {
        let d = KeyManagementOptions::chrono(Duration::from_secs(u64::MAX));
        assert_eq!(d, KeyManagementOptions::chrono(MAX_OPTION_DURATION));
        assert_eq!(KeyManagementOptions::chrono(Duration::from_millis(1500)), chrono::Duration::milliseconds(1500));
    }

    #[test]
    fn date_arithmetic_saturates() {
        let far = chrono::Duration::days(365);
        assert_eq!(add_saturating(DateTime::<Utc>::MAX_UTC, far), DateTime::<Utc>::MAX_UTC);
        assert_eq!(sub_saturating(DateTime::<Utc>::MIN_UTC, far), DateTime::<Utc>::MIN_UTC);
        let t = Utc.with_ymd_and_hms(2015, 6, 1, 0, 0, 0).unwrap();
        assert_eq!(add_saturating(t, far), t + far);
        assert_eq!(sub_saturating(t, far), t - far);
    }

    #[test]
    fn malformed_json_is_invalid_options() {
        assert!(matches!(
            KeyManagementOptions::from_json("{ nope"),
            Err(KeyRingError::InvalidOptions(_))
        ));
    }
}
