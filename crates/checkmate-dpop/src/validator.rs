//! DPoP proof validation
//!
//! Checks run in a fixed order and stop at the first failure: signature, type,
//! required claims, method, URI, access token binding, freshness, replay. Only
//! proofs that pass every earlier check are recorded in the replay cache.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, warn};

use crate::config::DpopConfig;
use crate::errors::{DpopError, ValidationErrorKind};
use crate::proof::{constant_time_eq, hash_access_token, normalize_htu};
use crate::replay::ReplayCache;
use crate::types::DpopClaims;
use crate::{DPOP_JWT_TYPE, Result, codec, unix_now};

/// Claims of a proof that passed validation
#[derive(Debug, Clone, PartialEq)]
pub struct ValidatedDpopClaims {
    /// Proof identifier
    pub jti: String,
    /// HTTP method, as carried in the proof
    pub htm: String,
    /// Normalized HTTP URI
    pub htu: String,
    /// Issued at (unix seconds)
    pub iat: i64,
    /// Access token hash, if present
    pub ath: Option<String>,
    /// Server nonce, if present
    pub nonce: Option<String>,
    /// RFC 7638 thumbprint of the signing key, for `cnf.jkt` binding
    pub thumbprint: String,
    /// Unregistered claims
    pub extensions: BTreeMap<String, Value>,
}

/// Validates presented DPoP proofs
#[derive(Debug, Clone)]
pub struct DpopValidator {
    config: DpopConfig,
    replay_cache: Option<Arc<ReplayCache>>,
}

impl DpopValidator {
    /// Validator without replay tracking
    ///
    /// # Errors
    /// Returns `Configuration` if `config` fails [`DpopConfig::validate`].
    pub fn new(config: DpopConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            replay_cache: None,
        })
    }

    /// Attach a replay cache; consulted while `config.replay_check` is on
    ///
    /// # Errors
    /// Returns `Configuration` if the cache forgets a `jti` before a proof
    /// carrying it stops being accepted.
    pub fn with_replay_cache(mut self, cache: Arc<ReplayCache>) -> Result<Self> {
        let window = self.config.acceptance_window();
        if cache.retention() <= window {
            return Err(DpopError::configuration(format!(
                "replay cache retention ({}s) must exceed the proof acceptance window ({}s)",
                cache.retention().as_secs(),
                window.as_secs()
            )));
        }
        self.replay_cache = Some(cache);
        Ok(self)
    }

    pub fn config(&self) -> &DpopConfig {
        &self.config
    }

    /// Validate `token` for a request with `method` and `uri`
    ///
    /// When `access_token` is supplied the proof must carry a matching `ath`.
    ///
    /// # Errors
    /// `Validation` with the failing [`ValidationErrorKind`], or `Signature`
    /// when the signature does not verify.
    pub fn validate_proof(
        &self,
        token: &str,
        method: &str,
        uri: &str,
        access_token: Option<&str>,
    ) -> Result<ValidatedDpopClaims> {
        self.validate_proof_at(token, method, uri, access_token, unix_now()?)
    }

    /// [`validate_proof`](Self::validate_proof) against an explicit clock
    ///
    /// # Errors
    /// Same as [`validate_proof`](Self::validate_proof).
    pub fn validate_proof_at(
        &self,
        token: &str,
        method: &str,
        uri: &str,
        access_token: Option<&str>,
        now: i64,
    ) -> Result<ValidatedDpopClaims> {
        match self.run_checks(token, method, uri, access_token, now) {
            Ok(claims) => {
                debug!(
                    jti = %claims.jti,
                    method = %claims.htm,
                    htu = %claims.htu,
                    thumbprint = %claims.thumbprint,
                    "DPoP proof validated"
                );
                Ok(claims)
            }
            Err(e) => {
                warn!(
                    kind = e.category(),
                    category = if e.is_attack_signal() { "attack" } else { "client" },
                    method = %method,
                    uri = %uri,
                    error = %e,
                    "DPoP proof rejected"
                );
                Err(e)
            }
        }
    }

    fn run_checks(
        &self,
        token: &str,
        method: &str,
        uri: &str,
        access_token: Option<&str>,
        now: i64,
    ) -> Result<ValidatedDpopClaims> {
        let proof = codec::decode_and_verify(token)?;

        if proof.header.typ != DPOP_JWT_TYPE {
            return Err(DpopError::validation(ValidationErrorKind::InvalidType));
        }

        let DpopClaims {
            jti,
            htm,
            htu,
            iat,
            ath,
            nonce,
            extensions,
        } = proof.claims;
        let iat = require_claims(&jti, &htm, &htu, iat)?;

        if !htm.eq_ignore_ascii_case(method.trim()) {
            return Err(DpopError::validation(ValidationErrorKind::MethodMismatch));
        }

        let expected_htu = normalize_htu(uri)
            .map_err(|e| DpopError::validation_with(ValidationErrorKind::UriMismatch, e))?;
        let presented_htu = normalize_htu(&htu)
            .map_err(|e| DpopError::validation_with(ValidationErrorKind::UriMismatch, e))?;
        if presented_htu != expected_htu {
            return Err(DpopError::validation(ValidationErrorKind::UriMismatch));
        }

        if let Some(access_token) = access_token {
            let expected = hash_access_token(access_token);
            match ath.as_deref() {
                Some(presented) if constant_time_eq(presented, &expected) => {}
                _ => return Err(DpopError::validation(ValidationErrorKind::TokenHashMismatch)),
            }
        }

        let max_age = i64::try_from(self.config.max_proof_age_secs).unwrap_or(i64::MAX);
        let max_skew = i64::try_from(self.config.max_future_skew_secs).unwrap_or(i64::MAX);
        if now.saturating_sub(iat) > max_age {
            return Err(DpopError::validation(ValidationErrorKind::Expired));
        }
        if iat.saturating_sub(now) > max_skew {
            return Err(DpopError::validation(ValidationErrorKind::FromFuture));
        }

        if self.config.replay_check
            && let Some(cache) = &self.replay_cache
            && !cache.check_and_record_at(&jti, now)
        {
            return Err(DpopError::validation(ValidationErrorKind::ReplayDetected));
        }

        Ok(ValidatedDpopClaims {
            jti,
            htm,
            htu: presented_htu,
            iat,
            ath,
            nonce,
            thumbprint: proof.header.jwk.thumbprint(),
            extensions,
        })
    }
}

fn require_claims(jti: &str, htm: &str, htu: &str, iat: Option<i64>) -> Result<i64> {
    for (name, value) in [("jti", jti), ("htm", htm), ("htu", htu)] {
        if value.is_empty() {
            return Err(DpopError::validation(ValidationErrorKind::MissingClaim(name)));
        }
    }
    iat.ok_or_else(|| DpopError::validation(ValidationErrorKind::MissingClaim("iat")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::DpopKeyManager;
    use crate::proof::DpopProofGenerator;
    use crate::types::{DpopHeader, DpopKeyPair};
    use pretty_assertions::assert_eq;
    use std::time::Duration;

    const URI: &str = "https://pds.example/xrpc/create";
    const NOW: i64 = 1_700_000_000;

    fn generator() -> DpopProofGenerator {
        DpopProofGenerator::new(Arc::new(DpopKeyManager::initialize().unwrap()))
    }

    fn signed_with(claims: &DpopClaims, typ: &str) -> String {
        let key = DpopKeyPair::generate().unwrap();
        let mut header = DpopHeader::new(key.public_jwk().clone());
        header.typ = typ.to_string();
        codec::encode(&header, claims, &key).unwrap()
    }

    fn claims_at(iat: i64) -> DpopClaims {
        DpopClaims {
            jti: "jti-1".to_string(),
            htm: "POST".to_string(),
            htu: URI.to_string(),
            iat: Some(iat),
            ..Default::default()
        }
    }

    fn kind(result: Result<ValidatedDpopClaims>) -> Option<ValidationErrorKind> {
        result.unwrap_err().validation_kind()
    }

    #[test]
    fn test_valid_proof() {
        let generator = generator();
        let proof = generator.create_proof("POST", URI, Some("tok123")).unwrap();
        let claims = DpopValidator::new(DpopConfig::default())
            .unwrap()
            .validate_proof(proof.as_str(), "post", URI, Some("tok123"))
            .unwrap();

        assert_eq!(claims.htm, "POST");
        assert_eq!(claims.htu, URI);
        assert_eq!(claims.jti, proof.claims.jti);
        assert_eq!(claims.thumbprint, generator.key_manager().current_thumbprint());
    }

    #[test]
    fn test_invalid_type() {
        let token = signed_with(&claims_at(NOW), "jwt");
        let validator = DpopValidator::new(DpopConfig::default()).unwrap();
        assert_eq!(
            kind(validator.validate_proof_at(&token, "POST", URI, None, NOW)),
            Some(ValidationErrorKind::InvalidType)
        );
    }

    #[test]
    fn test_missing_claims_are_named() {
        let validator = DpopValidator::new(DpopConfig::default()).unwrap();
        let cases: [(&str, fn(&mut DpopClaims)); 4] = [
            ("jti", |c| c.jti.clear()),
            ("htm", |c| c.htm.clear()),
            ("htu", |c| c.htu.clear()),
            ("iat", |c| c.iat = None),
        ];
        for (name, strip) in cases {
            let mut claims = claims_at(NOW);
            strip(&mut claims);
            let token = signed_with(&claims, DPOP_JWT_TYPE);
            assert_eq!(
                kind(validator.validate_proof_at(&token, "POST", URI, None, NOW)),
                Some(ValidationErrorKind::MissingClaim(name))
            );
        }
    }

    #[test]
    fn test_mismatches() {
        let generator = generator();
        let validator = DpopValidator::new(DpopConfig::default()).unwrap();
        let proof = generator.create_proof("POST", URI, Some("tok123")).unwrap();

        assert_eq!(
            kind(validator.validate_proof(proof.as_str(), "GET", URI, Some("tok123"))),
            Some(ValidationErrorKind::MethodMismatch)
        );
        assert_eq!(
            kind(validator.validate_proof(
                proof.as_str(),
                "POST",
                "https://pds.example/xrpc/other",
                Some("tok123")
            )),
            Some(ValidationErrorKind::UriMismatch)
        );
        assert_eq!(
            kind(validator.validate_proof(proof.as_str(), "POST", "::not a uri::", Some("tok123"))),
            Some(ValidationErrorKind::UriMismatch)
        );
        assert_eq!(
            kind(validator.validate_proof(proof.as_str(), "POST", URI, Some("tok124"))),
            Some(ValidationErrorKind::TokenHashMismatch)
        );
    }

    #[test]
    fn test_uri_compared_after_normalization() {
        let proof = generator()
            .create_proof("GET", "https://pds.example:443/xrpc/get/", None)
            .unwrap();
        DpopValidator::new(DpopConfig::default())
            .unwrap()
            .validate_proof(proof.as_str(), "GET", "https://PDS.example/xrpc/get?cursor=2", None)
            .unwrap();
    }

    #[test]
    fn test_token_required_but_ath_absent() {
        let proof = generator().create_proof("POST", URI, None).unwrap();
        assert_eq!(
            kind(DpopValidator::new(DpopConfig::default()).unwrap().validate_proof(
                proof.as_str(),
                "POST",
                URI,
                Some("tok123")
            )),
            Some(ValidationErrorKind::TokenHashMismatch)
        );
    }

    #[test]
    fn test_ath_ignored_without_expected_token() {
        let proof = generator().create_proof("POST", URI, Some("tok123")).unwrap();
        let claims = DpopValidator::new(DpopConfig::default())
            .unwrap()
            .validate_proof(proof.as_str(), "POST", URI, None)
            .unwrap();
        assert!(claims.ath.is_some());
    }

    #[test]
    fn test_freshness_window() {
        let validator = DpopValidator::new(DpopConfig::default()).unwrap();
        let check = |iat: i64| {
            let token = signed_with(&claims_at(iat), DPOP_JWT_TYPE);
            validator.validate_proof_at(&token, "POST", URI, None, NOW)
        };

        assert_eq!(kind(check(NOW - 301)), Some(ValidationErrorKind::Expired));
        assert_eq!(kind(check(NOW + 31)), Some(ValidationErrorKind::FromFuture));
        check(NOW - 299).unwrap();
        check(NOW - 300).unwrap();
        check(NOW + 29).unwrap();
        check(NOW + 30).unwrap();
    }

    #[test]
    fn test_freshness_is_configurable() {
        let validator = DpopValidator::new(
            DpopConfig::default()
                .with_max_proof_age(Duration::from_secs(10))
                .with_max_future_skew(Duration::from_secs(0)),
        )
        .unwrap();
        let token = signed_with(&claims_at(NOW - 11), DPOP_JWT_TYPE);
        assert_eq!(
            kind(validator.validate_proof_at(&token, "POST", URI, None, NOW)),
            Some(ValidationErrorKind::Expired)
        );
        let token = signed_with(&claims_at(NOW + 1), DPOP_JWT_TYPE);
        assert_eq!(
            kind(validator.validate_proof_at(&token, "POST", URI, None, NOW)),
            Some(ValidationErrorKind::FromFuture)
        );
    }

    #[test]
    fn test_replay_detected() {
        let cache = Arc::new(ReplayCache::new(Duration::from_secs(600)));
        let validator = DpopValidator::new(DpopConfig::default())
            .unwrap()
            .with_replay_cache(Arc::clone(&cache))
            .unwrap();
        let proof = generator().create_proof("POST", URI, None).unwrap();

        validator.validate_proof(proof.as_str(), "POST", URI, None).unwrap();
        assert!(cache.contains(proof.jti()));
        assert_eq!(
            kind(validator.validate_proof(proof.as_str(), "POST", URI, None)),
            Some(ValidationErrorKind::ReplayDetected)
        );
    }

    #[test]
    fn test_rejected_proof_not_recorded() {
        let cache = Arc::new(ReplayCache::new(Duration::from_secs(600)));
        let validator = DpopValidator::new(DpopConfig::default())
            .unwrap()
            .with_replay_cache(Arc::clone(&cache))
            .unwrap();
        let proof = generator().create_proof("POST", URI, None).unwrap();

        assert!(validator.validate_proof(proof.as_str(), "GET", URI, None).is_err());
        assert!(cache.is_empty());
        validator.validate_proof(proof.as_str(), "POST", URI, None).unwrap();
    }

    #[test]
    fn test_replay_check_disabled() {
        let cache = Arc::new(ReplayCache::new(Duration::from_secs(600)));
        let validator = DpopValidator::new(DpopConfig::default().with_replay_check(false))
            .unwrap()
            .with_replay_cache(Arc::clone(&cache))
            .unwrap();
        let proof = generator().create_proof("POST", URI, None).unwrap();

        validator.validate_proof(proof.as_str(), "POST", URI, None).unwrap();
        validator.validate_proof(proof.as_str(), "POST", URI, None).unwrap();
        assert!(cache.is_empty());
    }

    #[test]
    fn test_inconsistent_config_rejected() {
        let config = DpopConfig::default().with_max_proof_age(Duration::from_secs(900));
        let err = DpopValidator::new(config).unwrap_err();
        assert!(matches!(err, DpopError::Configuration { .. }));
    }

    #[test]
    fn test_short_lived_replay_cache_rejected() {
        let config = DpopConfig::default();
        let window = config.acceptance_window();
        let validator = DpopValidator::new(config).unwrap();

        for retention in [Duration::from_secs(60), window] {
            let err = validator
                .clone()
                .with_replay_cache(Arc::new(ReplayCache::new(retention)))
                .unwrap_err();
            assert!(matches!(err, DpopError::Configuration { .. }));
        }
        validator
            .with_replay_cache(Arc::new(ReplayCache::new(window + Duration::from_secs(1))))
            .unwrap();
    }

    /// A proof stays replay-protected for its whole acceptance window, even
    /// across a sweep
    #[test]
    fn test_replay_rejected_after_sweep_within_window() {
        let config = DpopConfig::default();
        let cache = Arc::new(ReplayCache::from_config(&config));
        let validator = DpopValidator::new(config.clone())
            .unwrap()
            .with_replay_cache(Arc::clone(&cache))
            .unwrap();
        let token = signed_with(&claims_at(NOW), DPOP_JWT_TYPE);

        validator.validate_proof_at(&token, "POST", URI, None, NOW).unwrap();
        let last_accepted = NOW + i64::try_from(config.max_proof_age_secs).unwrap();
        assert_eq!(cache.sweep_at(last_accepted), 0);
        assert_eq!(
            kind(validator.validate_proof_at(&token, "POST", URI, None, last_accepted)),
            Some(ValidationErrorKind::ReplayDetected)
        );
    }

    #[test]
    fn test_extensions_and_nonce_surface() {
        let mut claims = claims_at(NOW);
        claims.nonce = Some("n-1".to_string());
        claims
            .insert_extension("game_id", serde_json::json!("g-7"))
            .unwrap();
        let token = signed_with(&claims, DPOP_JWT_TYPE);

        let validated = DpopValidator::new(DpopConfig::default())
            .unwrap()
            .validate_proof_at(&token, "POST", URI, None, NOW)
            .unwrap();
        assert_eq!(validated.nonce.as_deref(), Some("n-1"));
        assert_eq!(validated.extensions.get("game_id"), Some(&serde_json::json!("g-7")));
    }
}
