//! DPoP proof issuance
//!
//! Builds a fresh, single-use proof for every outbound request and attaches it
//! to `http::Request`s. Issuance is synchronous CPU work; it performs no I/O.

use std::sync::Arc;

use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use http::HeaderMap;
use http::header::{AUTHORIZATION, HeaderValue};
use rand::RngCore;
use rand::rngs::OsRng;
use subtle::ConstantTimeEq;
use tracing::debug;
use url::Url;

use crate::errors::DpopError;
use crate::keys::DpopKeyManager;
use crate::types::{DpopClaims, DpopHeader, DpopProof};
use crate::{DPOP_AUTH_SCHEME, DPOP_HEADER, Result, codec, crypto, unix_now};

const BEARER_SCHEME: &str = "Bearer";

/// Issues DPoP proofs signed by the key manager's active key
#[derive(Debug, Clone)]
pub struct DpopProofGenerator {
    key_manager: Arc<DpopKeyManager>,
}

impl DpopProofGenerator {
    pub fn new(key_manager: Arc<DpopKeyManager>) -> Self {
        Self { key_manager }
    }

    /// Key manager backing this generator
    pub fn key_manager(&self) -> &Arc<DpopKeyManager> {
        &self.key_manager
    }

    /// Create a proof for `method` and `uri`, optionally bound to `access_token`
    ///
    /// # Errors
    /// - `Encoding` if `method` is not an HTTP method token or `uri` is not an
    ///   absolute http(s) URI
    /// - `KeyGeneration` if no `jti` can be drawn from the system entropy source
    /// - `Signature` if signing fails
    pub fn create_proof(
        &self,
        method: &str,
        uri: &str,
        access_token: Option<&str>,
    ) -> Result<DpopProof> {
        self.issue(method, uri, access_token, None)
    }

    /// Create a proof carrying a server-provided `nonce`
    ///
    /// # Errors
    /// Same as [`create_proof`](Self::create_proof).
    pub fn create_proof_with_nonce(
        &self,
        method: &str,
        uri: &str,
        access_token: Option<&str>,
        nonce: &str,
    ) -> Result<DpopProof> {
        self.issue(method, uri, access_token, Some(nonce))
    }

    fn issue(
        &self,
        method: &str,
        uri: &str,
        access_token: Option<&str>,
        nonce: Option<&str>,
    ) -> Result<DpopProof> {
        let htm = normalize_method(method)?;
        let htu = normalize_htu(uri)?;

        let claims = DpopClaims {
            jti: generate_jti()?,
            htm,
            htu,
            iat: Some(unix_now()?),
            ath: access_token.map(hash_access_token),
            nonce: nonce.map(str::to_string),
            extensions: Default::default(),
        };

        // One load: header key and signing key always agree
        let key = self.key_manager.current_key();
        let header = DpopHeader::new(key.public_jwk().clone());
        let token = codec::encode(&header, &claims, &key)?;

        debug!(
            jti = %claims.jti,
            method = %claims.htm,
            htu = %claims.htu,
            key_id = %key.id,
            bound = claims.ath.is_some(),
            "Issued DPoP proof"
        );

        Ok(DpopProof::new(header, claims, token))
    }

    /// Sign a proof for `request` and attach it
    ///
    /// Sets the `DPoP` header. With an access token, also sets
    /// `Authorization: DPoP <token>`, replacing any existing value. Without
    /// one, a token already carried under the `Bearer` or `DPoP` scheme is
    /// bound to the proof and re-sent as `DPoP <token>`; `Bearer` never leaves
    /// alongside a proof.
    ///
    /// # Errors
    /// Same as [`create_proof`](Self::create_proof), plus `Encoding` if the proof
    /// or token is not a valid header value, or an existing `Bearer`/`DPoP`
    /// header carries no usable token. The request is left unchanged on error.
    pub fn attach_to_request<B>(
        &self,
        request: &mut http::Request<B>,
        access_token: Option<&str>,
    ) -> Result<DpopProof> {
        let presented = match access_token {
            Some(_) => None,
            None => presented_token(request.headers())?,
        };
        let access_token = access_token.or(presented.as_deref());

        let uri = request.uri().to_string();
        let proof = self.create_proof(request.method().as_str(), &uri, access_token)?;

        let proof_value = HeaderValue::from_str(proof.as_str())
            .map_err(|e| DpopError::encoding_with("proof is not a valid header value", e))?;
        let authorization = access_token
            .map(|token| {
                let mut value = HeaderValue::from_str(&format!("{DPOP_AUTH_SCHEME} {token}"))
                    .map_err(|e| {
                        DpopError::encoding_with("access token is not a valid header value", e)
                    })?;
                value.set_sensitive(true);
                Ok::<_, DpopError>(value)
            })
            .transpose()?;

        let headers = request.headers_mut();
        headers.insert(DPOP_HEADER, proof_value);
        if let Some(authorization) = authorization {
            headers.insert(AUTHORIZATION, authorization);
        }

        Ok(proof)
    }
}

/// Token in an existing `Authorization: Bearer` or `Authorization: DPoP`
/// header; other schemes are not ours to rebind
fn presented_token(headers: &HeaderMap) -> Result<Option<String>> {
    let Some(value) = headers.get(AUTHORIZATION) else {
        return Ok(None);
    };
    let bytes = value.as_bytes();
    let scheme_end = bytes.iter().position(|b| *b == b' ').unwrap_or(bytes.len());
    let scheme = &bytes[..scheme_end];
    if !scheme.eq_ignore_ascii_case(BEARER_SCHEME.as_bytes())
        && !scheme.eq_ignore_ascii_case(DPOP_AUTH_SCHEME.as_bytes())
    {
        return Ok(None);
    }

    let value = value
        .to_str()
        .map_err(|e| DpopError::encoding_with("authorization header is not visible ASCII", e))?;
    let token = value[scheme_end..].trim();
    if token.is_empty() {
        return Err(DpopError::encoding("authorization header carries no token"));
    }
    Ok(Some(token.to_string()))
}

/// `ath` value: base64url(SHA-256(token)), 43 characters
pub fn hash_access_token(access_token: &str) -> String {
    URL_SAFE_NO_PAD.encode(crypto::digest(access_token.as_bytes()))
}

/// Canonical `htu` form of an absolute http(s) URI
///
/// Scheme and host are lowercased, default ports dropped, query, fragment and
/// userinfo removed, and trailing slashes stripped from the path.
///
/// # Errors
/// Returns `Encoding` if `uri` does not parse or is not http(s) with a host.
pub fn normalize_htu(uri: &str) -> Result<String> {
    let url = Url::parse(uri).map_err(|e| DpopError::encoding_with(format!("invalid URI {uri:?}"), e))?;

    let scheme = url.scheme();
    if scheme != "http" && scheme != "https" {
        return Err(DpopError::encoding(format!(
            "htu must be http or https, got {scheme:?}"
        )));
    }
    let host = url
        .host_str()
        .ok_or_else(|| DpopError::encoding(format!("URI {uri:?} has no host")))?;

    let mut htu = format!("{scheme}://{}", host.to_ascii_lowercase());
    // `Url::port` is None for the scheme's default port
    if let Some(port) = url.port() {
        htu.push(':');
        htu.push_str(&port.to_string());
    }
    htu.push_str(url.path().trim_end_matches('/'));
    Ok(htu)
}

fn normalize_method(method: &str) -> Result<String> {
    let upper = method.trim().to_ascii_uppercase();
    http::Method::from_bytes(upper.as_bytes())
        .map(|m| m.as_str().to_string())
        .map_err(|e| DpopError::encoding_with(format!("invalid HTTP method {method:?}"), e))
}

/// Fresh 128-bit proof identifier
fn generate_jti() -> Result<String> {
    jti_from(&mut OsRng)
}

fn jti_from<R: RngCore>(rng: &mut R) -> Result<String> {
    let mut bytes = [0u8; 16];
    rng.try_fill_bytes(&mut bytes)
        .map_err(|e| DpopError::key_generation_with("system entropy source unavailable", e))?;
    Ok(URL_SAFE_NO_PAD.encode(bytes))
}

/// Constant-time string equality
pub(crate) fn constant_time_eq(a: &str, b: &str) -> bool {
    a.as_bytes().ct_eq(b.as_bytes()).into()
}
