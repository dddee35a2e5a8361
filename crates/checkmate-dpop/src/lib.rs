//! # Checkmate DPoP - RFC 9449 Proofs
//!
//! DPoP (Demonstrating Proof-of-Possession) binds every outbound request made on
//! behalf of a player to the process signing key. A stolen access token is useless
//! without the matching private key, and a captured proof cannot be replayed
//! against a different method, URI or token.
//!
//! ## Core Features
//!
//! - **ES256 only** - ECDSA P-256 with SHA-256, raw 64-byte `r || s` signatures
//! - **Self-describing proofs** - every token carries its own public JWK
//! - **Atomic key rotation** - readers never observe a torn key
//! - **Replay protection** - `jti` tracking with a background sweep
//! - **Transport binding** - tower layer that attaches `DPoP` + `Authorization: DPoP`
//!
//! ## Architecture
//!
//! - `crypto` - P-256 signing primitives
//! - `codec` - compact token encode / decode + verify
//! - `keys` - key manager and auto-rotation service
//! - `proof` - proof issuance and request attachment
//! - `replay` - replay cache and its sweeper task
//! - `validator` - proof validation with typed failures
//! - `interceptor` - outbound transport wrapper (tower)
//! - `config` - tunable freshness, replay and rotation windows
//! - `errors` - error taxonomy
//! - `types` - JWK, header, claims, key pair and proof types
//!
//! ## Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use checkmate_dpop::{DpopConfig, DpopKeyManager, DpopProofGenerator, DpopValidator};
//!
//! # fn main() -> checkmate_dpop::Result<()> {
//! let keys = Arc::new(DpopKeyManager::initialize()?);
//! let generator = DpopProofGenerator::new(keys);
//! let proof = generator.create_proof("POST", "https://pds.example/xrpc/create", Some("tok123"))?;
//!
//! let validator = DpopValidator::new(DpopConfig::default())?;
//! let claims = validator.validate_proof(
//!     proof.as_str(),
//!     "POST",
//!     "https://pds.example/xrpc/create",
//!     Some("tok123"),
//! )?;
//! assert_eq!(claims.htm, "POST");
//! # Ok(())
//! # }
//! ```

pub mod codec;
pub mod config;
pub mod crypto;
pub mod errors;
pub mod interceptor;
pub mod keys;
pub mod proof;
pub mod replay;
pub mod types;
pub mod validator;

pub use config::{DpopConfig, KeyRotationPolicy};
pub use errors::{DpopError, ValidationErrorKind};
pub use interceptor::{AccessTokenSource, DpopInterceptor, DpopLayer, DpopService};
pub use keys::{AutoRotationService, DpopKeyManager, RotationMetricsSnapshot};
pub use proof::{DpopProofGenerator, hash_access_token, normalize_htu};
pub use replay::{ReplayCache, ReplaySweeper, SweepStats};
pub use types::{DpopAlgorithm, DpopClaims, DpopHeader, DpopJwk, DpopKeyPair, DpopProof};
pub use validator::{DpopValidator, ValidatedDpopClaims};

/// DPoP result type
pub type Result<T> = std::result::Result<T, DpopError>;

/// DPoP JWT header type as defined in RFC 9449
pub const DPOP_JWT_TYPE: &str = "dpop+jwt";

/// HTTP header carrying the proof
pub const DPOP_HEADER_NAME: &str = "DPoP";

/// [`DPOP_HEADER_NAME`] as a typed header name
pub const DPOP_HEADER: http::HeaderName = http::HeaderName::from_static("dpop");

/// `Authorization` scheme used for DPoP-bound access tokens
pub const DPOP_AUTH_SCHEME: &str = "DPoP";

/// Default maximum proof age (5 minutes)
pub const DEFAULT_MAX_PROOF_AGE_SECONDS: u64 = 300;

/// Default tolerance for proofs issued by a clock running ahead of ours
pub const DEFAULT_MAX_FUTURE_SKEW_SECONDS: u64 = 30;

/// Default replay retention window (10 minutes)
pub const DEFAULT_REPLAY_RETENTION_SECONDS: u64 = 600;

/// Default interval between replay cache sweeps
pub const DEFAULT_REPLAY_SWEEP_INTERVAL_SECONDS: u64 = 60;

/// Current unix time in whole seconds
pub(crate) fn unix_now() -> Result<i64> {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .map_err(|e| DpopError::encoding_with("system clock before unix epoch", e))
}
