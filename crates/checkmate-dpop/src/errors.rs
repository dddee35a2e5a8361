//! DPoP error types
//!
//! Callers match on variants (and on [`ValidationErrorKind`] for rejected proofs)
//! rather than parsing messages. Every variant can carry the underlying cause.

use std::fmt;

use thiserror::Error;

/// Boxed underlying cause attached to a [`DpopError`]
pub type BoxedCause = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Reason a presented proof was rejected
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValidationErrorKind {
    /// Token is not three non-empty base64url segments of valid JSON, or the
    /// signature is not exactly 64 bytes
    MalformedToken,
    /// `alg` is not ES256 or the embedded key is not an EC P-256 key
    UnsupportedAlgorithm,
    /// `typ` is not `dpop+jwt`
    InvalidType,
    /// A required claim is absent or empty
    MissingClaim(&'static str),
    /// `htm` does not match the request method
    MethodMismatch,
    /// `htu` does not match the request URI
    UriMismatch,
    /// `ath` does not match the presented access token
    TokenHashMismatch,
    /// Proof is older than the freshness window
    Expired,
    /// Proof claims to be issued too far in the future
    FromFuture,
    /// `jti` was already seen within the retention window
    ReplayDetected,
}

impl ValidationErrorKind {
    /// Stable label for logs and metrics
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::MalformedToken => "malformed_token",
            Self::UnsupportedAlgorithm => "unsupported_algorithm",
            Self::InvalidType => "invalid_type",
            Self::MissingClaim(_) => "missing_claim",
            Self::MethodMismatch => "method_mismatch",
            Self::UriMismatch => "uri_mismatch",
            Self::TokenHashMismatch => "token_hash_mismatch",
            Self::Expired => "expired",
            Self::FromFuture => "from_future",
            Self::ReplayDetected => "replay_detected",
        }
    }
}

impl fmt::Display for ValidationErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MissingClaim(claim) => write!(f, "missing claim: {claim}"),
            other => f.write_str(other.as_str()),
        }
    }
}

/// DPoP error taxonomy
#[derive(Debug, Error)]
pub enum DpopError {
    /// Key pair could not be generated; the process cannot issue proofs
    #[error("DPoP key generation failed: {reason}")]
    KeyGeneration {
        reason: String,
        #[source]
        source: Option<BoxedCause>,
    },

    /// Serialization failed or issuance input was invalid
    #[error("DPoP encoding error: {reason}")]
    Encoding {
        reason: String,
        #[source]
        source: Option<BoxedCause>,
    },

    /// ECDSA signing or verification failed
    #[error("DPoP signature error: {reason}")]
    Signature {
        reason: String,
        #[source]
        source: Option<BoxedCause>,
    },

    /// A presented proof was rejected
    #[error("DPoP proof rejected: {kind}")]
    Validation {
        kind: ValidationErrorKind,
        #[source]
        source: Option<BoxedCause>,
    },

    /// Invalid configuration value
    #[error("DPoP configuration error: {reason}")]
    Configuration { reason: String },

    /// Background key or replay service lifecycle misuse
    #[error("DPoP key management error: {reason}")]
    KeyManagement { reason: String },
}

impl DpopError {
    pub(crate) fn key_generation(reason: impl Into<String>) -> Self {
        Self::KeyGeneration {
            reason: reason.into(),
            source: None,
        }
    }

    pub(crate) fn key_generation_with(
        reason: impl Into<String>,
        cause: impl Into<BoxedCause>,
    ) -> Self {
        Self::KeyGeneration {
            reason: reason.into(),
            source: Some(cause.into()),
        }
    }

    pub(crate) fn encoding(reason: impl Into<String>) -> Self {
        Self::Encoding {
            reason: reason.into(),
            source: None,
        }
    }

    pub(crate) fn encoding_with(reason: impl Into<String>, cause: impl Into<BoxedCause>) -> Self {
        Self::Encoding {
            reason: reason.into(),
            source: Some(cause.into()),
        }
    }

    pub(crate) fn signature_with(reason: impl Into<String>, cause: impl Into<BoxedCause>) -> Self {
        Self::Signature {
            reason: reason.into(),
            source: Some(cause.into()),
        }
    }

    /// Build a validation failure without an underlying cause
    #[must_use]
    pub fn validation(kind: ValidationErrorKind) -> Self {
        Self::Validation { kind, source: None }
    }

    pub(crate) fn validation_with(kind: ValidationErrorKind, cause: impl Into<BoxedCause>) -> Self {
        Self::Validation {
            kind,
            source: Some(cause.into()),
        }
    }

    pub(crate) fn configuration(reason: impl Into<String>) -> Self {
        Self::Configuration {
            reason: reason.into(),
        }
    }

    /// The rejection reason, if this is a validation failure
    #[must_use]
    pub fn validation_kind(&self) -> Option<ValidationErrorKind> {
        match self {
            Self::Validation { kind, .. } => Some(*kind),
            _ => None,
        }
    }

    /// Whether this failure more likely indicates an attack than a misconfiguration
    ///
    /// Replays and signature failures are worth alerting on; URI or method
    /// mismatches are usually a client building the wrong target.
    #[must_use]
    pub fn is_attack_signal(&self) -> bool {
        matches!(
            self,
            Self::Signature { .. }
                | Self::Validation {
                    kind: ValidationErrorKind::ReplayDetected,
                    ..
                }
        )
    }

    /// Get error category for metrics and logging
    #[must_use]
    pub fn category(&self) -> &'static str {
        match self {
            Self::KeyGeneration { .. } => "key_generation",
            Self::Encoding { .. } => "encoding",
            Self::Signature { .. } => "signature",
            Self::Validation { kind, .. } => kind.as_str(),
            Self::Configuration { .. } => "configuration",
            Self::KeyManagement { .. } => "key_management",
        }
    }
}

impl From<ValidationErrorKind> for DpopError {
    fn from(kind: ValidationErrorKind) -> Self {
        Self::validation(kind)
    }
}
