//! DPoP key management
//!
//! One active P-256 key per process, shared behind an `Arc` and replaced
//! wholesale on rotation. Readers that loaded the old key keep signing with it
//! until they drop their handle; nobody ever observes a half-written key.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime};

use parking_lot::{Mutex, RwLock};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::config::KeyRotationPolicy;
use crate::errors::DpopError;
use crate::types::{DpopJwk, DpopKeyPair};
use crate::{Result, crypto};

/// Process-wide DPoP signing key holder
#[derive(Debug)]
pub struct DpopKeyManager {
    active: RwLock<Arc<DpopKeyPair>>,
    rotation_policy: KeyRotationPolicy,
}

impl DpopKeyManager {
    /// Generate the initial key with the default rotation policy
    ///
    /// # Errors
    /// Returns `KeyGeneration` if no key can be produced. The process cannot
    /// issue proofs without one, so callers should treat this as fatal.
    pub fn initialize() -> Result<Self> {
        Self::with_policy(KeyRotationPolicy::default())
    }

    /// Generate the initial key with an explicit rotation policy
    ///
    /// # Errors
    /// Same as [`initialize`](Self::initialize).
    pub fn with_policy(rotation_policy: KeyRotationPolicy) -> Result<Self> {
        let key_pair = DpopKeyPair::generate()?;

        info!(
            key_id = %key_pair.id,
            algorithm = %key_pair.algorithm,
            thumbprint = %key_pair.thumbprint,
            "Generated new DPoP key pair"
        );

        Ok(Self {
            active: RwLock::new(Arc::new(key_pair)),
            rotation_policy,
        })
    }

    /// Rotation policy this manager was built with
    pub fn rotation_policy(&self) -> &KeyRotationPolicy {
        &self.rotation_policy
    }

    /// Active key pair
    ///
    /// Sign with the returned handle; a concurrent rotation does not affect it.
    pub fn current_key(&self) -> Arc<DpopKeyPair> {
        Arc::clone(&*self.active.read())
    }

    /// Public projection of the active key
    pub fn current_public_key(&self) -> DpopJwk {
        self.active.read().public_jwk().clone()
    }

    /// RFC 7638 thumbprint of the active key
    pub fn current_thumbprint(&self) -> String {
        self.active.read().thumbprint.clone()
    }

    /// Replace the active key unconditionally
    ///
    /// # Errors
    /// Returns `KeyGeneration` if the new key cannot be produced; the old key
    /// stays active.
    pub fn rotate(&self) -> Result<Arc<DpopKeyPair>> {
        let signing_key = crypto::generate_signing_key()?;

        let mut active = self.active.write();
        let old_id = active.id.clone();
        let next = Arc::new(DpopKeyPair::from_signing_key(
            signing_key,
            active.rotation_generation.saturating_add(1),
        ));
        *active = Arc::clone(&next);
        drop(active);

        info!(
            old_key_id = %old_id,
            new_key_id = %next.id,
            new_generation = next.rotation_generation,
            thumbprint = %next.thumbprint,
            "DPoP key rotated"
        );
        Ok(next)
    }

    /// Replace the active key if it is older than `max_age`
    ///
    /// Returns whether a rotation happened. Key generation runs outside the
    /// lock; the write lock covers only the age re-check and the swap, so two
    /// concurrent callers rotate at most once.
    ///
    /// # Errors
    /// Returns `KeyGeneration` if the new key cannot be produced.
    pub fn rotate_if_older_than(&self, max_age: Duration) -> Result<bool> {
        if !self.active.read().is_older_than(max_age) {
            return Ok(false);
        }

        let signing_key = crypto::generate_signing_key()?;

        let mut active = self.active.write();
        if !active.is_older_than(max_age) {
            debug!("Key already rotated by a concurrent caller");
            return Ok(false);
        }
        let old_id = active.id.clone();
        let old_age = active.age();
        let next = Arc::new(DpopKeyPair::from_signing_key(
            signing_key,
            active.rotation_generation.saturating_add(1),
        ));
        *active = Arc::clone(&next);
        drop(active);

        info!(
            old_key_id = %old_id,
            old_key_age_secs = old_age.as_secs(),
            new_key_id = %next.id,
            new_generation = next.rotation_generation,
            "Rotated expired DPoP key"
        );
        Ok(true)
    }
}

/// Automated key rotation service
///
/// Runs as a background task that checks the active key's age every
/// `rotation_check_interval` and rotates it once it exceeds `key_lifetime`.
/// Checks are skipped while the policy has `auto_rotate` off.
#[derive(Debug)]
pub struct AutoRotationService {
    /// Key manager for rotation operations
    key_manager: Arc<DpopKeyManager>,
    /// Cancellation token for graceful shutdown
    cancellation_token: CancellationToken,
    /// Notification for manual rotation triggers
    notify: Arc<Notify>,
    /// Background task handle
    task_handle: Option<JoinHandle<()>>,
    /// Rotation metrics and monitoring
    metrics: Arc<RotationMetrics>,
}

/// Rotation metrics for monitoring and alerting
#[derive(Debug, Default)]
pub struct RotationMetrics {
    successful_rotations: AtomicU64,
    failed_rotations: AtomicU64,
    checks_run: AtomicU64,
    last_rotation_time: Mutex<Option<SystemTime>>,
    last_error: Mutex<Option<(SystemTime, String)>>,
}

impl RotationMetrics {
    fn record_check(&self) {
        self.checks_run.fetch_add(1, Ordering::SeqCst);
    }

    fn record_success(&self) {
        self.successful_rotations.fetch_add(1, Ordering::SeqCst);
        *self.last_rotation_time.lock() = Some(SystemTime::now());
    }

    fn record_failure(&self, error: &str) {
        self.failed_rotations.fetch_add(1, Ordering::SeqCst);
        *self.last_error.lock() = Some((SystemTime::now(), error.to_string()));
    }

    /// Get current metrics snapshot
    pub fn snapshot(&self) -> RotationMetricsSnapshot {
        RotationMetricsSnapshot {
            successful_rotations: self.successful_rotations.load(Ordering::SeqCst),
            failed_rotations: self.failed_rotations.load(Ordering::SeqCst),
            checks_run: self.checks_run.load(Ordering::SeqCst),
            last_rotation_time: *self.last_rotation_time.lock(),
            last_error: self.last_error.lock().clone(),
        }
    }
}

/// Snapshot of rotation metrics at a point in time
#[derive(Debug, Clone, Default)]
pub struct RotationMetricsSnapshot {
    /// Total number of successful key rotations
    pub successful_rotations: u64,
    /// Total number of failed key rotations
    pub failed_rotations: u64,
    /// Rotation checks performed while auto-rotation was enabled
    pub checks_run: u64,
    /// Timestamp of the last successful rotation
    pub last_rotation_time: Option<SystemTime>,
    /// Timestamp and message of the last error
    pub last_error: Option<(SystemTime, String)>,
}

impl AutoRotationService {
    /// Create a new auto-rotation service (not yet started)
    pub fn new(key_manager: Arc<DpopKeyManager>) -> Self {
        Self {
            key_manager,
            cancellation_token: CancellationToken::new(),
            notify: Arc::new(Notify::new()),
            task_handle: None,
            metrics: Arc::new(RotationMetrics::default()),
        }
    }

    /// Start the auto-rotation service
    ///
    /// Spawns the rotation loop on the current tokio runtime.
    ///
    /// # Errors
    /// Returns `KeyManagement` if the service is already running.
    ///
    /// # Panics
    /// Panics if called outside a tokio runtime.
    pub fn start(&mut self) -> Result<()> {
        if self.task_handle.is_some() {
            return Err(DpopError::KeyManagement {
                reason: "Auto-rotation service is already running".to_string(),
            });
        }

        info!("Starting DPoP auto-rotation service");

        // A cancelled token stays cancelled; restarts need a fresh one
        self.cancellation_token = CancellationToken::new();

        let key_manager = Arc::clone(&self.key_manager);
        let cancellation_token = self.cancellation_token.clone();
        let notify = Arc::clone(&self.notify);
        let metrics = Arc::clone(&self.metrics);

        self.task_handle = Some(tokio::spawn(async move {
            Self::rotation_loop(key_manager, cancellation_token, notify, metrics).await;
        }));

        Ok(())
    }

    /// Stop the auto-rotation service and wait for the task to finish
    pub async fn stop(&mut self) {
        info!("Stopping DPoP auto-rotation service");

        self.cancellation_token.cancel();

        if let Some(handle) = self.task_handle.take() {
            match handle.await {
                Ok(()) => info!("DPoP auto-rotation service stopped"),
                Err(e) => error!("Error stopping auto-rotation service: {}", e),
            }
        }
    }

    /// Whether the background task is running
    pub fn is_running(&self) -> bool {
        self.task_handle.is_some()
    }

    /// Wake the rotation loop for an immediate check
    pub fn trigger_rotation_check(&self) {
        debug!("Manual rotation check triggered");
        self.notify.notify_one();
    }

    /// Get current rotation metrics
    pub fn get_metrics(&self) -> RotationMetricsSnapshot {
        self.metrics.snapshot()
    }

    async fn rotation_loop(
        key_manager: Arc<DpopKeyManager>,
        cancellation_token: CancellationToken,
        notify: Arc<Notify>,
        metrics: Arc<RotationMetrics>,
    ) {
        let policy = key_manager.rotation_policy().clone();

        info!(
            auto_rotate = policy.auto_rotate,
            check_interval_secs = policy.rotation_check_interval.as_secs(),
            key_lifetime_secs = policy.key_lifetime.as_secs(),
            "Auto-rotation loop started"
        );

        loop {
            tokio::select! {
                () = cancellation_token.cancelled() => {
                    info!("Auto-rotation service cancelled, shutting down");
                    break;
                }
                () = tokio::time::sleep(policy.rotation_check_interval) => {
                    debug!("Rotation check interval elapsed");
                }
                () = notify.notified() => {
                    debug!("Manual rotation check requested");
                }
            }

            if !policy.auto_rotate {
                debug!("Auto-rotation is disabled, skipping rotation check");
                continue;
            }

            metrics.record_check();
            match key_manager.rotate_if_older_than(policy.key_lifetime) {
                Ok(true) => metrics.record_success(),
                Ok(false) => debug!("Key rotation not needed yet"),
                Err(e) => {
                    error!(error = %e, "Failed to rotate DPoP key");
                    metrics.record_failure(&e.to_string());
                }
            }
        }

        info!("Auto-rotation loop terminated");
    }
}

impl Drop for AutoRotationService {
    fn drop(&mut self) {
        self.cancellation_token.cancel();
    }
}
