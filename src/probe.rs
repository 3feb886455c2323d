//! Health probe and auto-reconnector: a background task that periodically
//! pings the pool, tracks consecutive-failure/success counters, and drives
//! a small state machine with an exponential-backoff reconnection loop.
//! Only one reconnection may be active at a time.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use tokio::sync::{Mutex, Notify};

use crate::config::ProbeConfig;
use crate::driver::DbConnection;
use crate::error::DbCoreError;
use crate::pool::PoolInner;
use crate::telemetry::{self, ProbeEvent};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeStatus {
    Healthy,
    Unhealthy,
    Reconnecting,
    Failed,
}

/// Snapshot returned by `Probe::get_state`; the live state lives behind the
/// probe's own mutex and is never handed out by reference.
#[derive(Debug, Clone)]
pub struct ProbeStateSnapshot {
    pub status: ProbeStatus,
    pub consecutive_failures: u32,
    pub consecutive_successes: u32,
    pub total_probes: u64,
    pub total_failures: u64,
    pub is_reconnecting: bool,
    pub last_probe: Option<Instant>,
    pub last_success: Option<Instant>,
    pub last_failure: Option<Instant>,
}

struct ProbeStateInner {
    status: ProbeStatus,
    consecutive_failures: u32,
    consecutive_successes: u32,
    total_probes: u64,
    total_failures: u64,
    last_probe: Option<Instant>,
    last_success: Option<Instant>,
    last_failure: Option<Instant>,
    reported_success_since_transition: bool,
}

impl ProbeStateInner {
    fn new() -> Self {
        Self {
            status: ProbeStatus::Healthy,
            consecutive_failures: 0,
            consecutive_successes: 0,
            total_probes: 0,
            total_failures: 0,
            last_probe: None,
            last_success: None,
            last_failure: None,
            reported_success_since_transition: false,
        }
    }

    fn snapshot(&self, is_reconnecting: bool) -> ProbeStateSnapshot {
        ProbeStateSnapshot {
            status: self.status,
            consecutive_failures: self.consecutive_failures,
            consecutive_successes: self.consecutive_successes,
            total_probes: self.total_probes,
            total_failures: self.total_failures,
            is_reconnecting,
            last_probe: self.last_probe,
            last_success: self.last_success,
            last_failure: self.last_failure,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ProbeMetrics {
    pub total_probes: u64,
    pub total_failures: u64,
}

pub enum ProbeOutcome {
    Success,
    Failure(DbCoreError),
}

pub enum ReconnectOutcome {
    /// A reconnection attempt was already in flight; this call is a no-op
    /// since only one reconnection may be active at a time.
    AlreadyInProgress,
    Success,
    Abandoned,
}

/// Background health-probe task, owning a non-owning (`Weak`) reference
/// back to the pool it observes — breaking the `Probe → Pool` cycle so
/// `Pool::close` can tear the probe down deterministically before dropping
/// its own driver handle.
pub struct Probe<C: DbConnection> {
    pool: Weak<PoolInner<C>>,
    config: ProbeConfig,
    state: Mutex<ProbeStateInner>,
    reconnecting: AtomicBool,
    stop: Notify,
    stopped: AtomicBool,
    total_probes_fast: AtomicU64,
    total_failures_fast: AtomicU64,
    consecutive_failures_fast: AtomicU32,
}

impl<C: DbConnection> Probe<C> {
    pub fn new(pool: Weak<PoolInner<C>>, config: ProbeConfig) -> Self {
        Self {
            pool,
            config,
            state: Mutex::new(ProbeStateInner::new()),
            reconnecting: AtomicBool::new(false),
            stop: Notify::new(),
            stopped: AtomicBool::new(false),
            total_probes_fast: AtomicU64::new(0),
            total_failures_fast: AtomicU64::new(0),
            consecutive_failures_fast: AtomicU32::new(0),
        }
    }

    pub fn get_config(&self) -> ProbeConfig {
        self.config.clone()
    }

    pub async fn get_state(&self) -> ProbeStateSnapshot {
        let state = self.state.lock().await;
        state.snapshot(self.reconnecting.load(Ordering::Acquire))
    }

    pub fn get_metrics(&self) -> ProbeMetrics {
        ProbeMetrics {
            total_probes: self.total_probes_fast.load(Ordering::Relaxed),
            total_failures: self.total_failures_fast.load(Ordering::Relaxed),
        }
    }

    /// Starts the probe's ticker loop on its own task. Idempotent only in
    /// the sense that calling it twice spawns two loops sharing state —
    /// callers (the pool) are expected to call this exactly once.
    pub fn start(self: &Arc<Self>) {
        if !self.config.enabled {
            return;
        }
        let probe = self.clone();
        tokio::spawn(async move {
            probe.run().await;
        });
    }

    pub async fn stop(&self) {
        self.stopped.store(true, Ordering::Release);
        self.stop.notify_waiters();
    }

    async fn run(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(Duration::from_millis(self.config.interval_ms));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = self.stop.notified() => break,
            }
            if self.stopped.load(Ordering::Acquire) {
                break;
            }
            self.tick().await;
        }
    }

    async fn tick(self: &Arc<Self>) {
        let outcome = self.force_probe().await;
        if let ProbeOutcome::Failure(_) = outcome {
            let should_reconnect = {
                let state = self.state.lock().await;
                state.status == ProbeStatus::Unhealthy
            };
            if should_reconnect && self.config.reconnect_enabled {
                let probe = self.clone();
                tokio::spawn(async move {
                    probe.force_reconnect().await;
                });
            }
        }
    }

    /// Runs one probe tick immediately, outside the ticker's own cadence
    /// (operator-facing `ForceProbe`, also used internally by the loop).
    pub async fn force_probe(&self) -> ProbeOutcome {
        let timeout = Duration::from_millis(self.config.timeout_ms);
        let result = match self.pool.upgrade() {
            Some(pool) => tokio::time::timeout(timeout, pool.ping_inner())
                .await
                .unwrap_or_else(|_| Err(crate::error::DbCoreError::classified(
                    crate::error::ErrorClass::Timeout,
                    crate::error::Operation::Ping,
                    "probe ping exceeded its timeout",
                ))),
            None => return ProbeOutcome::Failure(DbCoreError::PoolClosed),
        };

        self.total_probes_fast.fetch_add(1, Ordering::Relaxed);
        let now = Instant::now();
        let mut state = self.state.lock().await;
        state.total_probes += 1;
        state.last_probe = Some(now);

        match result {
            Ok(()) => {
                state.last_success = Some(now);
                state.consecutive_failures = 0;
                self.consecutive_failures_fast.store(0, Ordering::Relaxed);
                state.consecutive_successes += 1;

                let was_unhealthy = state.status != ProbeStatus::Healthy;
                if state.consecutive_successes >= self.config.success_threshold {
                    if was_unhealthy {
                        state.status = ProbeStatus::Healthy;
                        telemetry::record_probe_event(ProbeEvent::Healthy);
                    }
                    if !state.reported_success_since_transition {
                        telemetry::record_probe_success_tick();
                        state.reported_success_since_transition = true;
                    }
                }
                ProbeOutcome::Success
            }
            Err(err) => {
                state.last_failure = Some(now);
                state.total_failures += 1;
                state.consecutive_successes = 0;
                state.consecutive_failures += 1;
                state.reported_success_since_transition = false;
                self.total_failures_fast.fetch_add(1, Ordering::Relaxed);
                self.consecutive_failures_fast.fetch_add(1, Ordering::Relaxed);

                if state.status == ProbeStatus::Healthy && state.consecutive_failures >= self.config.failure_threshold {
                    state.status = ProbeStatus::Unhealthy;
                    telemetry::record_probe_event(ProbeEvent::Unhealthy);
                }
                ProbeOutcome::Failure(err)
            }
        }
    }

    /// Operator-facing forced reconnection attempt. Shares the single-active
    /// invariant with the automatic trigger in `tick`: a concurrent caller
    /// gets `AlreadyInProgress` rather than a second interleaved loop.
    pub async fn force_reconnect(&self) -> ReconnectOutcome {
        if self.reconnecting.swap(true, Ordering::AcqRel) {
            return ReconnectOutcome::AlreadyInProgress;
        }
        {
            let mut state = self.state.lock().await;
            state.status = ProbeStatus::Reconnecting;
        }
        telemetry::record_probe_event(ProbeEvent::ReconnectStarted);

        let start = Instant::now();
        let max_elapsed = Duration::from_millis(self.config.reconnect_max_elapsed_ms);
        let mut outcome = ReconnectOutcome::Abandoned;

        for attempt in 0..self.config.reconnect_max_attempts {
            if self.stopped.load(Ordering::Acquire) {
                break;
            }
            if max_elapsed > Duration::ZERO && start.elapsed() >= max_elapsed {
                break;
            }

            let delay = reconnect_backoff(&self.config, attempt);
            if delay > Duration::ZERO {
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = self.stop.notified() => break,
                }
            }

            match self.force_probe().await {
                ProbeOutcome::Success => {
                    let mut state = self.state.lock().await;
                    state.status = ProbeStatus::Healthy;
                    state.consecutive_failures = 0;
                    drop(state);
                    telemetry::record_probe_event(ProbeEvent::ReconnectSuccess);
                    outcome = ReconnectOutcome::Success;
                    break;
                }
                ProbeOutcome::Failure(_) => {
                    telemetry::record_probe_event(ProbeEvent::ReconnectFailed);
                }
            }
        }

        if matches!(outcome, ReconnectOutcome::Abandoned) {
            let mut state = self.state.lock().await;
            state.status = ProbeStatus::Failed;
            drop(state);
            telemetry::record_probe_event(ProbeEvent::ReconnectAbandoned);
        }

        self.reconnecting.store(false, Ordering::Release);
        outcome
    }
}

/// `backoff(0) = initial`; `backoff(n) = min(max, initial * multiplier^n)`,
/// optional ±10% jitter — same formula as `retry::RetryPolicy`
/// but parameterized from `ProbeConfig`'s distinct reconnect knobs.
fn reconnect_backoff(config: &ProbeConfig, attempt: u32) -> Duration {
    let base_ms = config.reconnect_initial_backoff_ms as f64;
    let scaled_ms = base_ms * config.reconnect_multiplier.powi(attempt as i32);
    let capped_ms = scaled_ms.min(config.reconnect_max_backoff_ms as f64);
    let jittered_ms = if config.reconnect_jitter {
        let factor = 0.9 + rand::random::<f64>() * 0.2; // ±10%
        capped_ms * factor
    } else {
        capped_ms
    };
    Duration::from_secs_f64((jittered_ms.max(0.0)) / 1000.0)
}
