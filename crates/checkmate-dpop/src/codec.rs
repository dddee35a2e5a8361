//! Compact token codec
//!
//! `base64url(header) . base64url(claims) . base64url(signature)`, no padding.
//! Decoding verifies the signature against the key embedded in the header
//! before any claim is trusted.

use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::{DpopError, ValidationErrorKind};
use crate::types::{
    DpopAlgorithm, DpopClaims, DpopHeader, DpopJwk, DpopKeyPair, DpopProof, EC_KEY_TYPE,
    P256_CURVE, REGISTERED_CLAIMS,
};
use crate::{Result, crypto};

/// Header as received on the wire, before any field is trusted
#[derive(Debug, Deserialize)]
struct WireHeader {
    #[serde(default)]
    alg: Option<String>,
    #[serde(default)]
    typ: String,
    #[serde(default)]
    jwk: Option<Value>,
}

/// Encode and sign a proof with `key`
///
/// # Errors
/// Returns `Encoding` if the header does not carry `key`'s public projection or
/// an extension shadows a registered claim, and `Signature` if signing fails.
pub fn encode(header: &DpopHeader, claims: &DpopClaims, key: &DpopKeyPair) -> Result<String> {
    if &header.jwk != key.public_jwk() {
        return Err(DpopError::encoding(
            "header key does not match the signing key",
        ));
    }
    if let Some(name) = claims
        .extensions
        .keys()
        .find(|name| REGISTERED_CLAIMS.contains(&name.as_str()))
    {
        return Err(DpopError::encoding(format!(
            "extension '{name}' shadows a registered claim"
        )));
    }

    let signing_input = format!(
        "{}.{}",
        encode_segment(header, "header")?,
        encode_segment(claims, "claims")?
    );
    let signature = key.sign(signing_input.as_bytes())?;

    Ok(format!(
        "{signing_input}.{}",
        URL_SAFE_NO_PAD.encode(signature)
    ))
}

fn encode_segment<T: Serialize>(value: &T, what: &str) -> Result<String> {
    let json = serde_json::to_vec(value)
        .map_err(|e| DpopError::encoding_with(format!("failed to serialize {what}"), e))?;
    Ok(URL_SAFE_NO_PAD.encode(json))
}

/// Decode a compact proof and verify its signature against the embedded key
///
/// Only structure, algorithm, key shape and signature are checked here; `typ`
/// and claim semantics are left to the validator.
///
/// # Errors
/// - `MalformedToken` for bad structure, base64, JSON, key coordinates or
///   signature length
/// - `UnsupportedAlgorithm` for any `alg` other than ES256 or a non P-256 key
/// - `Signature` when verification fails
pub fn decode_and_verify(token: &str) -> Result<DpopProof> {
    let segments: Vec<&str> = token.split('.').collect();
    let [header_b64, claims_b64, signature_b64] = segments.as_slice() else {
        return Err(malformed(format!(
            "expected 3 segments, got {}",
            segments.len()
        )));
    };
    if header_b64.is_empty() || claims_b64.is_empty() || signature_b64.is_empty() {
        return Err(malformed("empty token segment"));
    }

    let header_json = decode_segment(header_b64)?;
    let wire: WireHeader = serde_json::from_slice(&header_json)
        .map_err(|e| DpopError::validation_with(ValidationErrorKind::MalformedToken, e))?;

    let alg = wire.alg.as_deref().and_then(DpopAlgorithm::from_jose).ok_or_else(|| {
        DpopError::validation_with(
            ValidationErrorKind::UnsupportedAlgorithm,
            format!("alg {:?} is not ES256", wire.alg),
        )
    })?;
    let jwk = embedded_key(wire.jwk)?;
    let verifying_key = crypto::verifying_key_from_jwk(&jwk)?;

    let claims_json = decode_segment(claims_b64)?;
    let claims: DpopClaims = serde_json::from_slice(&claims_json)
        .map_err(|e| DpopError::validation_with(ValidationErrorKind::MalformedToken, e))?;

    // Claims are parsed but not trusted until the signature checks out
    let signature = decode_segment(signature_b64)?;
    let signing_input_len = header_b64.len() + 1 + claims_b64.len();
    let signing_input = &token.as_bytes()[..signing_input_len];
    crypto::verify_digest(&verifying_key, &crypto::digest(signing_input), &signature)?;

    let header = DpopHeader {
        alg,
        typ: wire.typ,
        jwk,
    };
    Ok(DpopProof::new(header, claims, token.to_string()))
}

fn embedded_key(jwk: Option<Value>) -> Result<DpopJwk> {
    let Some(Value::Object(members)) = jwk else {
        return Err(malformed("header has no embedded jwk object"));
    };

    let member = |name: &str| members.get(name).and_then(Value::as_str);
    if member("kty") != Some(EC_KEY_TYPE) || member("crv") != Some(P256_CURVE) {
        return Err(DpopError::validation_with(
            ValidationErrorKind::UnsupportedAlgorithm,
            "embedded key is not an EC P-256 key",
        ));
    }
    // A proof must never carry private key material
    if members.contains_key("d") {
        return Err(malformed("embedded jwk contains a private key"));
    }

    match (member("x"), member("y")) {
        (Some(x), Some(y)) => Ok(DpopJwk {
            kty: EC_KEY_TYPE.to_string(),
            crv: P256_CURVE.to_string(),
            x: x.to_string(),
            y: y.to_string(),
        }),
        _ => Err(malformed("embedded jwk is missing a coordinate")),
    }
}

fn decode_segment(segment: &str) -> Result<Vec<u8>> {
    URL_SAFE_NO_PAD
        .decode(segment)
        .map_err(|e| DpopError::validation_with(ValidationErrorKind::MalformedToken, e))
}

fn malformed(reason: impl Into<String>) -> DpopError {
    DpopError::validation_with(ValidationErrorKind::MalformedToken, reason.into())
}
