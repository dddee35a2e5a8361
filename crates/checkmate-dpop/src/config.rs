//! DPoP configuration
//!
//! Freshness tolerances, replay retention and key rotation windows. Every value
//! has a default; `from_env` overrides them from `CHECKMATE_DPOP_*` variables.

use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::DpopError;
use crate::{
    DEFAULT_MAX_FUTURE_SKEW_SECONDS, DEFAULT_MAX_PROOF_AGE_SECONDS,
    DEFAULT_REPLAY_RETENTION_SECONDS, DEFAULT_REPLAY_SWEEP_INTERVAL_SECONDS, Result,
};

/// Environment variable prefix
pub const ENV_PREFIX: &str = "CHECKMATE_DPOP_";

const DEFAULT_KEY_MAX_AGE_SECONDS: u64 = 24 * 3600;
const DEFAULT_ROTATION_CHECK_INTERVAL_SECONDS: u64 = 3600;

/// Tunable DPoP parameters
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DpopConfig {
    /// Maximum accepted proof age
    pub max_proof_age_secs: u64,
    /// Tolerance for proofs issued by a clock running ahead of ours
    pub max_future_skew_secs: u64,
    /// How long a seen `jti` is remembered
    pub replay_retention_secs: u64,
    /// Interval between replay cache sweeps
    pub replay_sweep_interval_secs: u64,
    /// Whether the validator consults the replay cache
    pub replay_check: bool,
    /// Age after which the signing key is rotated
    pub key_max_age_secs: u64,
    /// Whether the rotation service rotates on its own
    pub auto_rotate: bool,
    /// Interval between rotation checks
    pub rotation_check_interval_secs: u64,
}

impl Default for DpopConfig {
    fn default() -> Self {
        Self {
            max_proof_age_secs: DEFAULT_MAX_PROOF_AGE_SECONDS,
            max_future_skew_secs: DEFAULT_MAX_FUTURE_SKEW_SECONDS,
            replay_retention_secs: DEFAULT_REPLAY_RETENTION_SECONDS,
            replay_sweep_interval_secs: DEFAULT_REPLAY_SWEEP_INTERVAL_SECONDS,
            replay_check: true,
            key_max_age_secs: DEFAULT_KEY_MAX_AGE_SECONDS,
            auto_rotate: false,
            rotation_check_interval_secs: DEFAULT_ROTATION_CHECK_INTERVAL_SECONDS,
        }
    }
}

impl DpopConfig {
    /// Set the maximum proof age
    #[must_use]
    pub fn with_max_proof_age(mut self, max_age: Duration) -> Self {
        self.max_proof_age_secs = max_age.as_secs();
        self
    }

    /// Set the future clock skew tolerance
    #[must_use]
    pub fn with_max_future_skew(mut self, skew: Duration) -> Self {
        self.max_future_skew_secs = skew.as_secs();
        self
    }

    /// Set the replay retention window
    #[must_use]
    pub fn with_replay_retention(mut self, retention: Duration) -> Self {
        self.replay_retention_secs = retention.as_secs();
        self
    }

    /// Set the replay sweep interval
    #[must_use]
    pub fn with_replay_sweep_interval(mut self, interval: Duration) -> Self {
        self.replay_sweep_interval_secs = interval.as_secs();
        self
    }

    /// Enable or disable replay checking
    #[must_use]
    pub fn with_replay_check(mut self, enabled: bool) -> Self {
        self.replay_check = enabled;
        self
    }

    /// Set the key age that triggers rotation
    #[must_use]
    pub fn with_key_max_age(mut self, max_age: Duration) -> Self {
        self.key_max_age_secs = max_age.as_secs();
        self
    }

    /// Enable or disable automatic rotation
    #[must_use]
    pub fn with_auto_rotate(mut self, enabled: bool) -> Self {
        self.auto_rotate = enabled;
        self
    }

    /// Set the rotation check interval
    #[must_use]
    pub fn with_rotation_check_interval(mut self, interval: Duration) -> Self {
        self.rotation_check_interval_secs = interval.as_secs();
        self
    }

    #[must_use]
    pub fn max_proof_age(&self) -> Duration {
        Duration::from_secs(self.max_proof_age_secs)
    }

    #[must_use]
    pub fn max_future_skew(&self) -> Duration {
        Duration::from_secs(self.max_future_skew_secs)
    }

    #[must_use]
    pub fn replay_retention(&self) -> Duration {
        Duration::from_secs(self.replay_retention_secs)
    }

    #[must_use]
    pub fn replay_sweep_interval(&self) -> Duration {
        Duration::from_secs(self.replay_sweep_interval_secs)
    }

    /// Rotation policy for the key manager
    #[must_use]
    pub fn rotation_policy(&self) -> KeyRotationPolicy {
        KeyRotationPolicy {
            key_lifetime: Duration::from_secs(self.key_max_age_secs),
            auto_rotate: self.auto_rotate,
            rotation_check_interval: Duration::from_secs(self.rotation_check_interval_secs),
        }
    }

    /// Span during which a single proof can be accepted: `max_proof_age +
    /// max_future_skew`
    pub fn acceptance_window(&self) -> Duration {
        Duration::from_secs(
            self.max_proof_age_secs
                .saturating_add(self.max_future_skew_secs),
        )
    }

    /// Check internal consistency
    ///
    /// A `jti` must be remembered for longer than any proof carrying it can be
    /// accepted, otherwise a replay slips in after the sweep.
    ///
    /// # Errors
    /// Returns `Configuration` describing the first violated constraint.
    pub fn validate(&self) -> Result<()> {
        let acceptance_window = self.acceptance_window().as_secs();
        if self.replay_retention_secs <= acceptance_window {
            return Err(DpopError::configuration(format!(
                "replay_retention_secs ({}) must exceed max_proof_age_secs + max_future_skew_secs ({acceptance_window})",
                self.replay_retention_secs
            )));
        }
        if self.replay_sweep_interval_secs == 0 {
            return Err(DpopError::configuration(
                "replay_sweep_interval_secs must be non-zero",
            ));
        }
        if self.rotation_check_interval_secs == 0 {
            return Err(DpopError::configuration(
                "rotation_check_interval_secs must be non-zero",
            ));
        }
        if self.key_max_age_secs == 0 {
            return Err(DpopError::configuration("key_max_age_secs must be non-zero"));
        }
        Ok(())
    }

    /// Load from `CHECKMATE_DPOP_*` environment variables
    ///
    /// # Errors
    /// Returns `Configuration` if a variable is present but unparsable, or if
    /// the result fails [`validate`](Self::validate).
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load from an arbitrary key lookup
    ///
    /// Keys are the full variable names, e.g. `CHECKMATE_DPOP_MAX_PROOF_AGE_SECS`.
    ///
    /// # Errors
    /// Same as [`from_env`](Self::from_env).
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let config = Self {
            max_proof_age_secs: parse_var(&lookup, "MAX_PROOF_AGE_SECS", defaults.max_proof_age_secs)?,
            max_future_skew_secs: parse_var(
                &lookup,
                "MAX_FUTURE_SKEW_SECS",
                defaults.max_future_skew_secs,
            )?,
            replay_retention_secs: parse_var(
                &lookup,
                "REPLAY_RETENTION_SECS",
                defaults.replay_retention_secs,
            )?,
            replay_sweep_interval_secs: parse_var(
                &lookup,
                "REPLAY_SWEEP_INTERVAL_SECS",
                defaults.replay_sweep_interval_secs,
            )?,
            replay_check: parse_flag(&lookup, "REPLAY_CHECK", defaults.replay_check)?,
            key_max_age_secs: parse_var(&lookup, "KEY_MAX_AGE_SECS", defaults.key_max_age_secs)?,
            auto_rotate: parse_flag(&lookup, "AUTO_ROTATE", defaults.auto_rotate)?,
            rotation_check_interval_secs: parse_var(
                &lookup,
                "ROTATION_CHECK_INTERVAL_SECS",
                defaults.rotation_check_interval_secs,
            )?,
        };
        config.validate()?;
        Ok(config)
    }
}

fn parse_var<F, T>(lookup: &F, name: &str, default: T) -> Result<T>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    let key = format!("{ENV_PREFIX}{name}");
    match lookup(&key) {
        None => Ok(default),
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|_| DpopError::configuration(format!("invalid value for {key}: {raw:?}"))),
    }
}

fn parse_flag<F>(lookup: &F, name: &str, default: bool) -> Result<bool>
where
    F: Fn(&str) -> Option<String>,
{
    let key = format!("{ENV_PREFIX}{name}");
    let Some(raw) = lookup(&key) else {
        return Ok(default);
    };
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(DpopError::configuration(format!(
            "invalid value for {key}: {raw:?}"
        ))),
    }
}

/// Key rotation policy for automatic key management
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyRotationPolicy {
    /// How long a key stays active before it is replaced
    pub key_lifetime: Duration,
    /// Whether automatic rotation is enabled
    pub auto_rotate: bool,
    /// How often to check whether the active key needs rotation
    pub rotation_check_interval: Duration,
}

impl KeyRotationPolicy {
    /// Create a policy suitable for development environments
    #[must_use]
    pub fn development() -> Self {
        Self {
            key_lifetime: Duration::from_secs(24 * 3600), // 24 hours
            auto_rotate: false,
            rotation_check_interval: Duration::from_secs(3600), // 1 hour
        }
    }

    /// Create a policy suitable for production environments
    #[must_use]
    pub fn production() -> Self {
        Self {
            key_lifetime: Duration::from_secs(7 * 24 * 3600), // 7 days
            auto_rotate: true,
            rotation_check_interval: Duration::from_secs(3600), // 1 hour
        }
    }
}

impl Default for KeyRotationPolicy {
    fn default() -> Self {
        Self::development()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults_are_valid() {
        let config = DpopConfig::default();
        config.validate().unwrap();
        assert_eq!(config.max_proof_age(), Duration::from_secs(300));
        assert_eq!(config.max_future_skew(), Duration::from_secs(30));
        assert_eq!(config.replay_retention(), Duration::from_secs(600));
        assert!(config.replay_check);
    }

    #[test]
    fn test_retention_must_cover_acceptance_window() {
        let config = DpopConfig::default().with_replay_retention(Duration::from_secs(330));
        assert!(matches!(
            config.validate(),
            Err(DpopError::Configuration { .. })
        ));

        let config = DpopConfig::default().with_replay_retention(Duration::from_secs(331));
        config.validate().unwrap();
    }

    #[test]
    fn test_zero_intervals_rejected() {
        assert!(DpopConfig::default()
            .with_replay_sweep_interval(Duration::ZERO)
            .validate()
            .is_err());
        assert!(DpopConfig::default()
            .with_rotation_check_interval(Duration::ZERO)
            .validate()
            .is_err());
    }

    #[test]
    fn test_from_lookup_overrides() {
        let config = DpopConfig::from_lookup(lookup_from(&[
            ("CHECKMATE_DPOP_MAX_PROOF_AGE_SECS", "120"),
            ("CHECKMATE_DPOP_REPLAY_CHECK", "false"),
            ("CHECKMATE_DPOP_AUTO_ROTATE", "1"),
        ]))
        .unwrap();

        assert_eq!(config.max_proof_age_secs, 120);
        assert!(!config.replay_check);
        assert!(config.auto_rotate);
        assert_eq!(config.max_future_skew_secs, 30);
    }

    #[test]
    fn test_from_lookup_empty_is_default() {
        let config = DpopConfig::from_lookup(|_| None).unwrap();
        assert_eq!(config, DpopConfig::default());
    }

    #[test]
    fn test_from_lookup_rejects_garbage() {
        let err = DpopConfig::from_lookup(lookup_from(&[(
            "CHECKMATE_DPOP_MAX_PROOF_AGE_SECS",
            "five minutes",
        )]))
        .unwrap_err();
        assert!(err.to_string().contains("CHECKMATE_DPOP_MAX_PROOF_AGE_SECS"));

        assert!(DpopConfig::from_lookup(lookup_from(&[("CHECKMATE_DPOP_AUTO_ROTATE", "maybe")])).is_err());
    }

    #[test]
    fn test_from_lookup_validates() {
        let err = DpopConfig::from_lookup(lookup_from(&[(
            "CHECKMATE_DPOP_REPLAY_RETENTION_SECS",
            "60",
        )]))
        .unwrap_err();
        assert!(matches!(err, DpopError::Configuration { .. }));
    }

    #[test]
    fn test_serde_defaults_fill_missing_fields() {
        let config: DpopConfig = serde_json::from_str(r#"{"max_proof_age_secs": 60}"#).unwrap();
        assert_eq!(config.max_proof_age_secs, 60);
        assert_eq!(config.replay_retention_secs, 600);
    }

    #[test]
    fn test_rotation_policy_conversion() {
        let policy = DpopConfig::default()
            .with_key_max_age(Duration::from_secs(60))
            .with_auto_rotate(true)
            .rotation_policy();
        assert_eq!(policy.key_lifetime, Duration::from_secs(60));
        assert!(policy.auto_rotate);
        assert_eq!(policy.rotation_check_interval, Duration::from_secs(3600));
    }

    #[test]
    fn test_policy_presets() {
        assert!(!KeyRotationPolicy::development().auto_rotate);
        assert!(KeyRotationPolicy::production().auto_rotate);
        assert_eq!(KeyRotationPolicy::default(), KeyRotationPolicy::development());
    }
}
