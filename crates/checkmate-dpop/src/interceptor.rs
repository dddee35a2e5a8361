//! Outbound transport binding
//!
//! Wraps an HTTP client service so every request leaves with a fresh `DPoP`
//! proof and, when an access token is available, `Authorization: DPoP <token>`.
//!
//! ```rust,ignore
//! use tower::ServiceBuilder;
//! use checkmate_dpop::{DpopInterceptor, DpopLayer};
//!
//! let interceptor = DpopInterceptor::new(generator, move || session.access_token());
//! let client = ServiceBuilder::new()
//!     .layer(DpopLayer::new(interceptor))
//!     .service(http_client);
//! ```

use std::fmt;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures_util::future::BoxFuture;
use tower::{BoxError, Layer, Service};
use tracing::{debug, warn};

use crate::Result;
use crate::proof::DpopProofGenerator;

/// Supplies the access token to bind outbound proofs to
///
/// Queried once per request. On `None`, a `Bearer` or `DPoP` credential
/// already on the request is bound and re-sent under the `DPoP` scheme;
/// otherwise the proof carries no `ath`.
pub trait AccessTokenSource: Send + Sync {
    /// Current access token, if any
    fn access_token(&self) -> Option<String>;
}

impl<F> AccessTokenSource for F
where
    F: Fn() -> Option<String> + Send + Sync,
{
    fn access_token(&self) -> Option<String> {
        self()
    }
}

/// Attaches proofs to outbound requests
#[derive(Clone)]
pub struct DpopInterceptor {
    generator: DpopProofGenerator,
    token_source: Arc<dyn AccessTokenSource>,
}

impl DpopInterceptor {
    pub fn new(generator: DpopProofGenerator, token_source: impl AccessTokenSource + 'static) -> Self {
        Self {
            generator,
            token_source: Arc::new(token_source),
        }
    }

    /// Interceptor that never binds an access token
    pub fn without_token(generator: DpopProofGenerator) -> Self {
        Self::new(generator, || None)
    }

    pub fn generator(&self) -> &DpopProofGenerator {
        &self.generator
    }

    /// Decorated copy of `request`; the original is not touched
    ///
    /// # Errors
    /// Returns the issuance error; no copy is produced.
    pub fn prepare<B: Clone>(&self, request: &http::Request<B>) -> Result<http::Request<B>> {
        let mut copy = http::Request::new(request.body().clone());
        *copy.method_mut() = request.method().clone();
        *copy.uri_mut() = request.uri().clone();
        *copy.version_mut() = request.version();
        *copy.headers_mut() = request.headers().clone();
        *copy.extensions_mut() = request.extensions().clone();
        self.decorate(copy)
    }

    /// Attach a proof to an owned request
    ///
    /// # Errors
    /// Returns the issuance error; the request is dropped.
    pub fn decorate<B>(&self, mut request: http::Request<B>) -> Result<http::Request<B>> {
        let access_token = self.token_source.access_token();
        let proof = self
            .generator
            .attach_to_request(&mut request, access_token.as_deref())?;

        debug!(
            jti = %proof.jti(),
            method = %request.method(),
            bound = proof.claims.ath.is_some(),
            "Attached DPoP proof to outbound request"
        );
        Ok(request)
    }
}

impl fmt::Debug for DpopInterceptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DpopInterceptor")
            .field("generator", &self.generator)
            .finish_non_exhaustive()
    }
}

/// Tower Layer that adds DPoP proofs to an HTTP client service
#[derive(Debug, Clone)]
pub struct DpopLayer {
    interceptor: DpopInterceptor,
}

impl DpopLayer {
    pub fn new(interceptor: DpopInterceptor) -> Self {
        Self { interceptor }
    }
}

impl<S> Layer<S> for DpopLayer {
    type Service = DpopService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        DpopService::new(inner, self.interceptor.clone())
    }
}

/// Tower Service that signs each request before delegating
///
/// If a proof cannot be issued the call fails and the inner service is never
/// invoked; requests are not sent unproven.
#[derive(Debug, Clone)]
pub struct DpopService<S> {
    inner: S,
    interceptor: DpopInterceptor,
}

impl<S> DpopService<S> {
    pub fn new(inner: S, interceptor: DpopInterceptor) -> Self {
        Self { inner, interceptor }
    }

    /// Get a reference to the inner service
    pub fn inner(&self) -> &S {
        &self.inner
    }
}

impl<S, B> Service<http::Request<B>> for DpopService<S>
where
    S: Service<http::Request<B>> + Clone + Send + 'static,
    S::Future: Send,
    S::Error: Into<BoxError>,
    B: Send + 'static,
{
    type Response = S::Response;
    type Error = BoxError;
    type Future = BoxFuture<'static, std::result::Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<std::result::Result<(), Self::Error>> {
        self.inner.poll_ready(cx).map_err(Into::into)
    }

    fn call(&mut self, request: http::Request<B>) -> Self::Future {
        let request = match self.interceptor.decorate(request) {
            Ok(request) => request,
            Err(e) => {
                warn!(error = %e, "DPoP issuance failed, aborting outbound request");
                return Box::pin(async move { Err(BoxError::from(e)) });
            }
        };

        // Use the instance that was polled ready, leave a fresh clone behind
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);
        Box::pin(async move { inner.call(request).await.map_err(Into::into) })
    }
}
