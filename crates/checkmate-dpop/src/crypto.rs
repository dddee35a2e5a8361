//! P-256 signing primitives
//!
//! Raw ECDSA over a caller-supplied SHA-256 digest. Signatures are the 64-byte
//! JWS form (`r || s`, each 32 bytes big-endian), never DER.

use p256::ecdsa::{Signature, SigningKey, VerifyingKey};
use p256::{EncodedPoint, FieldBytes};
use rand::RngCore;
use rand::rngs::OsRng;
use sha2::{Digest, Sha256};
use signature::hazmat::{PrehashSigner, PrehashVerifier};
use zeroize::Zeroize;

use crate::errors::{DpopError, ValidationErrorKind};
use crate::types::DpopJwk;
use crate::Result;

/// Length of a JWS ES256 signature
pub const SIGNATURE_LENGTH: usize = 64;

/// Generate a fresh P-256 signing key from the system entropy source
///
/// # Errors
/// Returns `KeyGeneration` if entropy is unavailable or the drawn scalar is
/// not a valid private key.
pub fn generate_signing_key() -> Result<SigningKey> {
    let mut secret = [0u8; 32];
    OsRng
        .try_fill_bytes(&mut secret)
        .map_err(|e| DpopError::key_generation_with("system entropy source unavailable", e))?;

    let key = SigningKey::from_slice(&secret);
    secret.zeroize();

    key.map_err(|_| DpopError::key_generation("drawn scalar is not a valid P-256 private key"))
}

/// Public-key projection of a verifying key
#[must_use]
pub fn public_projection(key: &VerifyingKey) -> DpopJwk {
    let point = key.to_encoded_point(false);
    let mut x = [0u8; 32];
    let mut y = [0u8; 32];
    // Uncompressed points always carry both coordinates
    if let (Some(px), Some(py)) = (point.x(), point.y()) {
        x.copy_from_slice(px);
        y.copy_from_slice(py);
    }
    DpopJwk::from_coordinates(&x, &y)
}

/// Reconstruct a verifying key from an embedded JWK
///
/// # Errors
/// `UnsupportedAlgorithm` for a non EC / P-256 key, `MalformedToken` for bad
/// coordinates or a point that is not on the curve.
pub fn verifying_key_from_jwk(jwk: &DpopJwk) -> Result<VerifyingKey> {
    if !jwk.is_p256() {
        return Err(DpopError::validation_with(
            ValidationErrorKind::UnsupportedAlgorithm,
            format!("unsupported key kty={} crv={}", jwk.kty, jwk.crv),
        ));
    }

    let (x, y) = jwk.coordinates()?;
    let point = EncodedPoint::from_affine_coordinates(
        &FieldBytes::from(x),
        &FieldBytes::from(y),
        false,
    );
    VerifyingKey::from_encoded_point(&point).map_err(|_| {
        DpopError::validation_with(
            ValidationErrorKind::MalformedToken,
            "embedded key is not a point on P-256",
        )
    })
}

/// SHA-256 digest
#[must_use]
pub fn digest(input: &[u8]) -> [u8; 32] {
    Sha256::digest(input).into()
}

/// Sign a 32-byte digest, returning the raw `r || s` signature
///
/// # Errors
/// Returns `Signature` if the signer rejects the digest.
pub fn sign_digest(key: &SigningKey, digest: &[u8; 32]) -> Result<[u8; SIGNATURE_LENGTH]> {
    let signature: Signature = key
        .sign_prehash(digest)
        .map_err(|e| DpopError::signature_with("ECDSA signing failed", e))?;

    let mut raw = [0u8; SIGNATURE_LENGTH];
    raw.copy_from_slice(&signature.to_bytes());
    Ok(raw)
}

/// Verify a raw `r || s` signature over a digest
///
/// # Errors
/// `MalformedToken` if the signature is not 64 bytes, `Signature` if it does
/// not verify.
pub fn verify_digest(key: &VerifyingKey, digest: &[u8; 32], raw_signature: &[u8]) -> Result<()> {
    if raw_signature.len() != SIGNATURE_LENGTH {
        return Err(DpopError::validation_with(
            ValidationErrorKind::MalformedToken,
            format!(
                "signature must be {SIGNATURE_LENGTH} bytes, got {}",
                raw_signature.len()
            ),
        ));
    }

    let signature = Signature::from_slice(raw_signature)
        .map_err(|e| DpopError::signature_with("signature scalars out of range", e))?;

    key.verify_prehash(digest, &signature)
        .map_err(|e| DpopError::signature_with("signature verification failed", e))
}
