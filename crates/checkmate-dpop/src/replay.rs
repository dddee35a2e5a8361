//! Replay protection
//!
//! [`ReplayCache`] remembers every accepted `jti` with the unix second it was
//! first seen. [`ReplaySweeper`] evicts entries older than the retention window
//! on a timer so the map stays bounded.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime};

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::config::DpopConfig;
use crate::errors::DpopError;
use crate::{Result, unix_now};

/// Seen-`jti` set with first-seen timestamps
#[derive(Debug)]
pub struct ReplayCache {
    entries: Mutex<HashMap<String, i64>>,
    retention: Duration,
}

impl ReplayCache {
    /// Empty cache with the given retention window
    pub fn new(retention: Duration) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            retention,
        }
    }

    /// Empty cache sized by `config.replay_retention_secs`
    pub fn from_config(config: &DpopConfig) -> Self {
        Self::new(config.replay_retention())
    }

    /// Retention window
    pub fn retention(&self) -> Duration {
        self.retention
    }

    /// Remember `jti` if it is not already present
    ///
    /// # Errors
    /// Returns an error if the system clock is before the unix epoch.
    pub fn record(&self, jti: &str) -> Result<()> {
        self.check_and_record(jti).map(|_| ())
    }

    /// Atomically check for and remember `jti`
    ///
    /// Returns `true` when `jti` was new, `false` when it was already present.
    ///
    /// # Errors
    /// Returns an error if the system clock is before the unix epoch.
    pub fn check_and_record(&self, jti: &str) -> Result<bool> {
        Ok(self.check_and_record_at(jti, unix_now()?))
    }

    /// [`check_and_record`](Self::check_and_record) against an explicit clock
    pub fn check_and_record_at(&self, jti: &str, now: i64) -> bool {
        let mut entries = self.entries.lock();
        if entries.contains_key(jti) {
            return false;
        }
        entries.insert(jti.to_string(), now);
        true
    }

    /// Whether `jti` has been seen
    pub fn contains(&self, jti: &str) -> bool {
        self.entries.lock().contains_key(jti)
    }

    /// Number of remembered identifiers
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Evict entries first seen more than `retention` ago
    ///
    /// Returns the number of entries removed.
    ///
    /// # Errors
    /// Returns an error if the system clock is before the unix epoch.
    pub fn sweep(&self) -> Result<usize> {
        Ok(self.sweep_at(unix_now()?))
    }

    /// [`sweep`](Self::sweep) against an explicit clock
    pub fn sweep_at(&self, now: i64) -> usize {
        let retention = i64::try_from(self.retention.as_secs()).unwrap_or(i64::MAX);
        let cutoff = now.saturating_sub(retention);

        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|_, first_seen| *first_seen >= cutoff);
        before - entries.len()
    }
}

/// Counters kept by the sweeper
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepStats {
    /// Completed sweep passes
    pub sweeps_run: u64,
    /// Entries evicted across all passes
    pub entries_evicted: u64,
    /// Time of the most recent pass
    pub last_sweep_at: Option<SystemTime>,
}

#[derive(Debug, Default)]
struct SweepCounters {
    sweeps_run: AtomicU64,
    entries_evicted: AtomicU64,
    last_sweep_at: Mutex<Option<SystemTime>>,
}

impl SweepCounters {
    fn record(&self, evicted: usize) {
        self.sweeps_run.fetch_add(1, Ordering::SeqCst);
        self.entries_evicted
            .fetch_add(evicted as u64, Ordering::SeqCst);
        *self.last_sweep_at.lock() = Some(SystemTime::now());
    }
}

/// Background task that periodically sweeps a [`ReplayCache`]
#[derive(Debug)]
pub struct ReplaySweeper {
    cache: Arc<ReplayCache>,
    interval: Duration,
    cancellation_token: CancellationToken,
    task_handle: Option<JoinHandle<()>>,
    counters: Arc<SweepCounters>,
}

impl ReplaySweeper {
    /// Sweeper for `cache` running every `interval` (not yet started)
    pub fn new(cache: Arc<ReplayCache>, interval: Duration) -> Self {
        Self {
            cache,
            interval,
            cancellation_token: CancellationToken::new(),
            task_handle: None,
            counters: Arc::new(SweepCounters::default()),
        }
    }

    /// Sweeper using `config.replay_sweep_interval_secs`
    pub fn from_config(cache: Arc<ReplayCache>, config: &DpopConfig) -> Self {
        Self::new(cache, config.replay_sweep_interval())
    }

    /// Start the sweep task on the current tokio runtime
    ///
    /// # Errors
    /// Returns `KeyManagement` if already running or if the interval is zero.
    ///
    /// # Panics
    /// Panics if called outside a tokio runtime.
    pub fn start(&mut self) -> Result<()> {
        if self.task_handle.is_some() {
            return Err(DpopError::KeyManagement {
                reason: "Replay sweeper is already running".to_string(),
            });
        }
        if self.interval.is_zero() {
            return Err(DpopError::KeyManagement {
                reason: "Replay sweep interval must be non-zero".to_string(),
            });
        }

        info!(
            interval_secs = self.interval.as_secs(),
            retention_secs = self.cache.retention().as_secs(),
            "Starting DPoP replay sweeper"
        );

        self.cancellation_token = CancellationToken::new();
        let cache = Arc::clone(&self.cache);
        let counters = Arc::clone(&self.counters);
        let token = self.cancellation_token.clone();
        let interval = self.interval;

        self.task_handle = Some(tokio::spawn(async move {
            Self::sweep_loop(cache, counters, interval, token).await;
        }));
        Ok(())
    }

    /// Stop the sweep task and wait for it to finish
    pub async fn stop(&mut self) {
        self.cancellation_token.cancel();

        if let Some(handle) = self.task_handle.take() {
            match handle.await {
                Ok(()) => info!("DPoP replay sweeper stopped"),
                Err(e) => error!("Error stopping replay sweeper: {}", e),
            }
        }
    }

    /// Whether the background task is running
    pub fn is_running(&self) -> bool {
        self.task_handle.is_some()
    }

    /// Run one sweep pass immediately
    ///
    /// # Errors
    /// Returns an error if the system clock is before the unix epoch.
    pub fn sweep_now(&self) -> Result<usize> {
        let evicted = self.cache.sweep()?;
        self.counters.record(evicted);
        Ok(evicted)
    }

    /// Counters for passes run so far
    pub fn stats(&self) -> SweepStats {
        SweepStats {
            sweeps_run: self.counters.sweeps_run.load(Ordering::SeqCst),
            entries_evicted: self.counters.entries_evicted.load(Ordering::SeqCst),
            last_sweep_at: *self.counters.last_sweep_at.lock(),
        }
    }

    async fn sweep_loop(
        cache: Arc<ReplayCache>,
        counters: Arc<SweepCounters>,
        interval: Duration,
        token: CancellationToken,
    ) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                () = token.cancelled() => {
                    debug!("Replay sweeper cancelled");
                    break;
                }
                _ = ticker.tick() => {}
            }

            match cache.sweep() {
                Ok(evicted) => {
                    counters.record(evicted);
                    if evicted > 0 {
                        debug!(evicted, remaining = cache.len(), "Swept replay cache");
                    }
                }
                Err(e) => error!(error = %e, "Replay sweep failed"),
            }
        }
    }
}

impl Drop for ReplaySweeper {
    fn drop(&mut self) {
        self.cancellation_token.cancel();
    }
}
