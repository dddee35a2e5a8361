//! Property-based tests for DPoP issuance and validation
//!
//! Uses proptest to check, over generated requests, that:
//! - every issued proof validates for the request it was issued for
//! - changing the method, URI or access token yields the matching rejection

use std::sync::Arc;

use checkmate_dpop::{
    DpopConfig, DpopKeyManager, DpopProofGenerator, DpopValidator, ValidationErrorKind,
    normalize_htu,
};
use proptest::prelude::*;

const METHODS: [&str; 7] = ["GET", "POST", "PUT", "PATCH", "DELETE", "HEAD", "OPTIONS"];

fn generator() -> DpopProofGenerator {
    DpopProofGenerator::new(Arc::new(DpopKeyManager::initialize().unwrap()))
}

fn validator() -> DpopValidator {
    DpopValidator::new(DpopConfig::default()).unwrap()
}

// =============================================================================
// STRATEGIES
// =============================================================================

/// Standard method in upper or lower case
fn method_strategy() -> impl Strategy<Value = String> {
    (prop::sample::select(METHODS.to_vec()), any::<bool>()).prop_map(|(method, lower)| {
        if lower {
            method.to_ascii_lowercase()
        } else {
            method.to_string()
        }
    })
}

/// Two methods that differ once uppercased
fn distinct_methods_strategy() -> impl Strategy<Value = (String, String)> {
    (method_strategy(), method_strategy())
        .prop_filter("methods must differ", |(a, b)| !a.eq_ignore_ascii_case(b))
}

/// Absolute http(s) URI with optional port, path, query and fragment
fn uri_strategy() -> impl Strategy<Value = String> {
    (
        prop::sample::select(vec!["http", "https"]),
        "[a-z][a-z0-9]{0,10}\\.(example|test|org)",
        prop::option::of(1024u16..65535),
        prop::collection::vec("[A-Za-z0-9_~-]{1,10}", 0..4),
        prop::option::of("[a-z]{1,8}=[a-z0-9]{1,8}"),
    )
        .prop_map(|(scheme, host, port, segments, query)| {
            let port = port.map(|p| format!(":{p}")).unwrap_or_default();
            let path: String = segments.iter().map(|s| format!("/{s}")).collect();
            let query = query.map(|q| format!("?{q}")).unwrap_or_default();
            format!("{scheme}://{host}{port}{path}{query}")
        })
}

fn token_strategy() -> impl Strategy<Value = String> {
    "[A-Za-z0-9._~+/-]{1,64}"
}

// =============================================================================
// ROUND TRIP
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// Property: a proof validates for the request it was issued for
    #[test]
    fn prop_issued_proof_validates(
        method in method_strategy(),
        uri in uri_strategy(),
        token in prop::option::of(token_strategy()),
    ) {
        let proof = generator().create_proof(&method, &uri, token.as_deref()).unwrap();
        let claims = validator()
            .validate_proof(proof.as_str(), &method, &uri, token.as_deref())
            .unwrap();

        prop_assert_eq!(claims.htm, method.to_ascii_uppercase());
        prop_assert_eq!(claims.htu, normalize_htu(&uri).unwrap());
        prop_assert_eq!(claims.ath.is_some(), token.is_some());
        prop_assert_eq!(claims.jti, proof.claims.jti.clone());
    }
}

// =============================================================================
// MUTATION
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// Property: presenting a proof with another method is a method mismatch
    #[test]
    fn prop_changed_method_rejected(
        (issued, presented) in distinct_methods_strategy(),
        uri in uri_strategy(),
    ) {
        let proof = generator().create_proof(&issued, &uri, None).unwrap();
        let err = validator()
            .validate_proof(proof.as_str(), &presented, &uri, None)
            .unwrap_err();
        prop_assert_eq!(err.validation_kind(), Some(ValidationErrorKind::MethodMismatch));
    }

    /// Property: presenting a proof at another path is a URI mismatch
    #[test]
    fn prop_changed_uri_rejected(
        method in method_strategy(),
        uri in uri_strategy(),
        extra in "[a-z0-9]{1,8}",
    ) {
        let proof = generator().create_proof(&method, &uri, None).unwrap();
        let elsewhere = format!("{}/{extra}", normalize_htu(&uri).unwrap());
        let err = validator()
            .validate_proof(proof.as_str(), &method, &elsewhere, None)
            .unwrap_err();
        prop_assert_eq!(err.validation_kind(), Some(ValidationErrorKind::UriMismatch));
    }

    /// Property: presenting a proof with another access token is a hash mismatch
    #[test]
    fn prop_changed_token_rejected(
        method in method_strategy(),
        uri in uri_strategy(),
        token in token_strategy(),
        suffix in "[A-Za-z0-9]{1,4}",
    ) {
        let proof = generator().create_proof(&method, &uri, Some(&token)).unwrap();
        let other = format!("{token}{suffix}");
        let err = validator()
            .validate_proof(proof.as_str(), &method, &uri, Some(&other))
            .unwrap_err();
        prop_assert_eq!(err.validation_kind(), Some(ValidationErrorKind::TokenHashMismatch));
    }
}
