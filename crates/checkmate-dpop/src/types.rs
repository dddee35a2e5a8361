//! Core DPoP types and data structures
//!
//! Algorithms, the public JWK projection, proof header and claims, the signing
//! key pair and the assembled proof token.

use std::collections::BTreeMap;
use std::fmt;
use std::time::{Duration, Instant, SystemTime};

use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use p256::ecdsa::SigningKey;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::errors::DpopError;
use crate::{DPOP_JWT_TYPE, Result, crypto};

/// JWK key type for elliptic curve keys
pub const EC_KEY_TYPE: &str = "EC";

/// JWK curve name for P-256
pub const P256_CURVE: &str = "P-256";

/// Claim names with a typed field on [`DpopClaims`]; they may not appear as extensions
pub const REGISTERED_CLAIMS: [&str; 6] = ["jti", "htm", "htu", "iat", "ath", "nonce"];

/// DPoP signing algorithm
///
/// Only ES256 (ECDSA P-256 with SHA-256) is issued or accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DpopAlgorithm {
    /// Elliptic Curve Digital Signature Algorithm with P-256 curve and SHA-256 (RFC 7518)
    #[serde(rename = "ES256")]
    ES256,
}

impl DpopAlgorithm {
    /// Get the algorithm name as specified in RFC 7518
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ES256 => "ES256",
        }
    }

    /// Parse a JOSE `alg` value
    #[must_use]
    pub fn from_jose(alg: &str) -> Option<Self> {
        match alg {
            "ES256" => Some(Self::ES256),
            _ => None,
        }
    }
}

impl fmt::Display for DpopAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Public-key projection of a P-256 key in JWK form
///
/// Both coordinates are 32-byte big-endian values, base64url-encoded without
/// padding. This is the value embedded in every proof header and the value a
/// collaborator publishes so relying parties can verify proofs independently.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DpopJwk {
    /// Key type - always "EC"
    pub kty: String,
    /// Curve - always "P-256"
    pub crv: String,
    /// X coordinate (base64url-encoded)
    pub x: String,
    /// Y coordinate (base64url-encoded)
    pub y: String,
}

impl DpopJwk {
    /// Build a projection from raw affine coordinates
    #[must_use]
    pub fn from_coordinates(x: &[u8; 32], y: &[u8; 32]) -> Self {
        Self {
            kty: EC_KEY_TYPE.to_string(),
            crv: P256_CURVE.to_string(),
            x: URL_SAFE_NO_PAD.encode(x),
            y: URL_SAFE_NO_PAD.encode(y),
        }
    }

    /// Whether the key type and curve are the ones ES256 requires
    #[must_use]
    pub fn is_p256(&self) -> bool {
        self.kty == EC_KEY_TYPE && self.crv == P256_CURVE
    }

    /// Decode the coordinates back to fixed-width bytes
    ///
    /// # Errors
    /// Returns `MalformedToken` if either coordinate is not 32 bytes of base64url.
    pub fn coordinates(&self) -> Result<([u8; 32], [u8; 32])> {
        Ok((decode_coordinate(&self.x)?, decode_coordinate(&self.y)?))
    }

    /// JWK thumbprint as defined in RFC 7638
    ///
    /// Hash of the required members in lexicographic order with no whitespace.
    #[must_use]
    pub fn thumbprint(&self) -> String {
        let canonical = format!(
            r#"{{"crv":"{}","kty":"{}","x":"{}","y":"{}"}}"#,
            self.crv, self.kty, self.x, self.y
        );
        URL_SAFE_NO_PAD.encode(Sha256::digest(canonical.as_bytes()))
    }

    /// JWK Set document (`{"keys":[...]}`) for a publication endpoint
    #[must_use]
    pub fn to_jwk_set(&self) -> Value {
        serde_json::json!({
            "keys": [{
                "kty": self.kty,
                "crv": self.crv,
                "x": self.x,
                "y": self.y,
                "use": "sig",
                "alg": DpopAlgorithm::ES256.as_str(),
                "kid": self.thumbprint(),
            }]
        })
    }
}

fn decode_coordinate(encoded: &str) -> Result<[u8; 32]> {
    let bytes = URL_SAFE_NO_PAD.decode(encoded).map_err(|e| {
        DpopError::validation_with(crate::ValidationErrorKind::MalformedToken, e)
    })?;
    bytes.as_slice().try_into().map_err(|_| {
        DpopError::validation_with(
            crate::ValidationErrorKind::MalformedToken,
            format!("JWK coordinate must be 32 bytes, got {}", bytes.len()),
        )
    })
}

/// DPoP JWT header as defined in RFC 9449
///
/// Field order here is the serialization order: `alg`, `typ`, `jwk`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DpopHeader {
    /// Cryptographic algorithm used for signing
    pub alg: DpopAlgorithm,
    /// JWT type - "dpop+jwt" for issued proofs
    pub typ: String,
    /// Public key that verifies this proof
    pub jwk: DpopJwk,
}

impl DpopHeader {
    /// Header for a proof signed by `jwk`
    #[must_use]
    pub fn new(jwk: DpopJwk) -> Self {
        Self {
            alg: DpopAlgorithm::ES256,
            typ: DPOP_JWT_TYPE.to_string(),
            jwk,
        }
    }
}

/// DPoP proof claims
///
/// Registered claims are typed fields; anything else lands in `extensions`,
/// which is merged into the JSON object on encode and split back out on decode.
/// Required claims default to empty on decode so the validator can report
/// exactly which one is missing.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct DpopClaims {
    /// Unique proof identifier (128 random bits, base64url)
    #[serde(default)]
    pub jti: String,

    /// HTTP method being bound to this proof
    #[serde(default)]
    pub htm: String,

    /// Normalized HTTP URI being bound to this proof
    #[serde(default)]
    pub htu: String,

    /// Issued at (unix seconds)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iat: Option<i64>,

    /// Access token hash (when binding to an access token)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ath: Option<String>,

    /// Server-provided nonce
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nonce: Option<String>,

    /// Unregistered claims
    #[serde(flatten)]
    pub extensions: BTreeMap<String, Value>,
}

impl DpopClaims {
    /// Add an extension claim
    ///
    /// # Errors
    /// Returns an encoding error if `name` collides with a registered claim.
    pub fn insert_extension(&mut self, name: impl Into<String>, value: Value) -> Result<()> {
        let name = name.into();
        if REGISTERED_CLAIMS.contains(&name.as_str()) {
            return Err(DpopError::encoding(format!(
                "'{name}' is a registered claim and cannot be used as an extension"
            )));
        }
        self.extensions.insert(name, value);
        Ok(())
    }

    /// Extension claim by name
    #[must_use]
    pub fn extension(&self, name: &str) -> Option<&Value> {
        self.extensions.get(name)
    }
}

/// DPoP signing key pair
///
/// The private scalar never leaves this struct: there is no accessor and the
/// type is not `Clone`. The key manager shares it behind an `Arc` and replaces
/// it wholesale on rotation. `p256` zeroizes the scalar on drop.
pub struct DpopKeyPair {
    /// Unique identifier for this key pair
    pub id: String,
    /// JWK thumbprint (RFC 7638)
    pub thumbprint: String,
    /// Signing algorithm
    pub algorithm: DpopAlgorithm,
    /// Wall-clock creation time
    pub created_at: SystemTime,
    /// Rotation generation (0 = original, 1+ = rotated)
    pub rotation_generation: u32,
    signing_key: SigningKey,
    public_jwk: DpopJwk,
    created: Instant,
}

impl DpopKeyPair {
    /// Generate a fresh P-256 key pair
    ///
    /// # Errors
    /// Returns `KeyGeneration` if the system entropy source fails.
    pub fn generate() -> Result<Self> {
        Ok(Self::from_signing_key(crypto::generate_signing_key()?, 0))
    }

    pub(crate) fn from_signing_key(signing_key: SigningKey, rotation_generation: u32) -> Self {
        let public_jwk = crypto::public_projection(signing_key.verifying_key());
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            thumbprint: public_jwk.thumbprint(),
            algorithm: DpopAlgorithm::ES256,
            created_at: SystemTime::now(),
            rotation_generation,
            signing_key,
            public_jwk,
            created: Instant::now(),
        }
    }

    /// Public projection of this key
    #[must_use]
    pub fn public_jwk(&self) -> &DpopJwk {
        &self.public_jwk
    }

    /// Get the age of this key pair
    #[must_use]
    pub fn age(&self) -> Duration {
        self.created.elapsed()
    }

    /// Whether the key is strictly older than `max_age`
    #[must_use]
    pub fn is_older_than(&self, max_age: Duration) -> bool {
        self.age() > max_age
    }

    /// Sign a JWS signing input (SHA-256 digest, raw `r || s`)
    pub(crate) fn sign(&self, signing_input: &[u8]) -> Result<[u8; 64]> {
        crypto::sign_digest(&self.signing_key, &crypto::digest(signing_input))
    }
}

impl fmt::Debug for DpopKeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DpopKeyPair")
            .field("id", &self.id)
            .field("thumbprint", &self.thumbprint)
            .field("algorithm", &self.algorithm)
            .field("created_at", &self.created_at)
            .field("rotation_generation", &self.rotation_generation)
            .field("public_jwk", &self.public_jwk)
            .finish_non_exhaustive()
    }
}

/// Complete DPoP proof
///
/// Keeps the exact compact string that was signed or received; re-serializing
/// header and claims is never used for verification.
#[derive(Debug, Clone, PartialEq)]
pub struct DpopProof {
    /// JWT header
    pub header: DpopHeader,
    /// JWT claims
    pub claims: DpopClaims,
    token: String,
}

impl DpopProof {
    pub(crate) fn new(header: DpopHeader, claims: DpopClaims, token: String) -> Self {
        Self {
            header,
            claims,
            token,
        }
    }

    /// Compact serialization for the `DPoP` header
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.token
    }

    /// Consume the proof, returning the compact serialization
    #[must_use]
    pub fn into_string(self) -> String {
        self.token
    }

    /// Proof identifier
    #[must_use]
    pub fn jti(&self) -> &str {
        &self.claims.jti
    }

    /// Thumbprint of the key that signed this proof
    #[must_use]
    pub fn thumbprint(&self) -> String {
        self.header.jwk.thumbprint()
    }
}

impl fmt::Display for DpopProof {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.token)
    }
}
