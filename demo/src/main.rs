//! Checkmate DPoP demo
//!
//! Signs an outbound request through the tower layer, validates it the way a
//! resource server would, then prints the JWK set a collaborator would publish.
//! Logs go to stderr (`RUST_LOG`, `CHECKMATE_LOG_JSON=1` for JSON); stdout
//! carries only the JWK set.

use std::convert::Infallible;
use std::io;
use std::sync::Arc;

use anyhow::{Context, Result};
use checkmate_dpop::{
    AutoRotationService, DPOP_HEADER_NAME, DpopConfig, DpopInterceptor, DpopKeyManager, DpopLayer,
    DpopProofGenerator, DpopValidator, ReplayCache, ReplaySweeper,
};
use tower::{Layer, ServiceExt};
use tracing::info;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt};

const TARGET: &str = "https://pds.example/xrpc/com.example.chess.makeMove";

fn init_logging() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = tracing_subscriber::registry().with(filter);

    let structured = std::env::var("CHECKMATE_LOG_JSON").is_ok_and(|v| v == "1");
    if structured {
        subscriber
            .with(fmt::layer().json().with_writer(io::stderr))
            .try_init()?;
    } else {
        subscriber
            .with(fmt::layer().with_writer(io::stderr))
            .try_init()?;
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logging()?;

    let config = DpopConfig::from_env().context("loading CHECKMATE_DPOP_* configuration")?;
    let keys = Arc::new(
        DpopKeyManager::with_policy(config.rotation_policy())
            .context("generating the DPoP signing key")?,
    );

    let mut rotation = AutoRotationService::new(Arc::clone(&keys));
    rotation.start()?;

    let cache = Arc::new(ReplayCache::from_config(&config));
    let mut sweeper = ReplaySweeper::from_config(Arc::clone(&cache), &config);
    sweeper.start()?;

    // Outbound: the "transport" hands the request straight to the verifier
    let validator = DpopValidator::new(config.clone())?.with_replay_cache(Arc::clone(&cache))?;
    let transport = tower::service_fn(move |request: http::Request<String>| {
        let validator = validator.clone();
        async move {
            let proof = request
                .headers()
                .get(DPOP_HEADER_NAME)
                .and_then(|v| v.to_str().ok())
                .unwrap_or_default();
            let token = request
                .headers()
                .get(http::header::AUTHORIZATION)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.strip_prefix("DPoP "));
            let outcome = validator.validate_proof(
                proof,
                request.method().as_str(),
                &request.uri().to_string(),
                token,
            );
            Ok::<_, Infallible>(outcome)
        }
    });

    let interceptor = DpopInterceptor::new(DpopProofGenerator::new(Arc::clone(&keys)), || {
        Some("demo-access-token".to_string())
    });
    let client = DpopLayer::new(interceptor).layer(transport);

    let request = http::Request::builder()
        .method("POST")
        .uri(TARGET)
        .body(r#"{"move":"e2e4"}"#.to_string())?;
    let claims = client
        .oneshot(request)
        .await
        .map_err(|e| anyhow::anyhow!(e))?
        .context("resource server rejected the proof")?;

    info!(
        jti = %claims.jti,
        htm = %claims.htm,
        htu = %claims.htu,
        thumbprint = %claims.thumbprint,
        "Proof accepted by resource server"
    );

    let jwks = keys.current_public_key().to_jwk_set();
    println!("{}", serde_json::to_string_pretty(&jwks)?);

    sweeper.stop().await;
    rotation.stop().await;
    Ok(())
}
