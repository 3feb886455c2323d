//! The top-level `Pool`: owns the driver handle (via `deadpool`), the
//! sizing policy, the retry policy, the probe, and the pool-manager
//! operational surface.
//!
//! A `deadpool::managed::Pool` wraps a `Manager` that dials fresh
//! connections and pings to recycle. Generic over the `Connect<C>` trait
//! so the same pool type serves both `mysql_async::Conn` in production and
//! a fake connection in tests.

use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use deadpool::managed::{Manager, PoolConfig, RecycleError, RecycleResult, Timeouts};

use crate::config::Config;
use crate::driver::{Connect, DbConnection, MysqlConnect};
use crate::error::{classify, DbCoreError, Operation};
use crate::handle::ConnectionHandle;
use crate::probe::{Probe, ProbeStateSnapshot};
use crate::retry::RetryPolicy;
use crate::telemetry;
use crate::tx::{self, Fut2, Transaction, TxOpts};

/// Wraps a physical connection with the bookkeeping the manager needs to
/// retire it: creation time (for `max_lifetime`) and the instant it last
/// went idle (for `max_idle_time`), updated at the end of each successful
/// `recycle` — i.e. exactly when the connection starts sitting idle again.
pub(crate) struct ManagedConn<C> {
    pub(crate) conn: C,
    created_at: Instant,
    idle_since: Instant,
}

impl<C> std::ops::Deref for ManagedConn<C> {
    type Target = C;
    fn deref(&self) -> &C {
        &self.conn
    }
}

impl<C> std::ops::DerefMut for ManagedConn<C> {
    fn deref_mut(&mut self) -> &mut C {
        &mut self.conn
    }
}

pub(crate) struct ConnManager<C: DbConnection> {
    connect: Arc<dyn Connect<C>>,
    max_lifetime: Option<Duration>,
    max_idle_time: Option<Duration>,
}

#[async_trait]
impl<C: DbConnection> Manager for ConnManager<C> {
    type Type = ManagedConn<C>;
    type Error = mysql_async::Error;

    async fn create(&self) -> Result<ManagedConn<C>, mysql_async::Error> {
        let conn = self.connect.connect().await?;
        telemetry::record_connection_created();
        let now = Instant::now();
        Ok(ManagedConn { conn, created_at: now, idle_since: now })
    }

    async fn recycle(&self, obj: &mut ManagedConn<C>) -> RecycleResult<mysql_async::Error> {
        if let Some(max_lifetime) = self.max_lifetime {
            if obj.created_at.elapsed() >= max_lifetime {
                return Err(RecycleError::Message("connection exceeded max_lifetime".into()));
            }
        }
        if let Some(max_idle) = self.max_idle_time {
            if obj.idle_since.elapsed() >= max_idle {
                return Err(RecycleError::Message("connection exceeded max_idle_time".into()));
            }
        }
        obj.conn.ping().await.map_err(RecycleError::Backend)?;
        obj.idle_since = Instant::now();
        Ok(())
    }
}

/// Counters deadpool's own `Status` doesn't track: wait occurrences and
/// cumulative wait duration, surfaced through `Pool::stats`.
#[derive(Default)]
struct WaitStats {
    wait_count: AtomicU64,
    wait_duration_nanos: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct PoolStats {
    pub open: usize,
    pub in_use: usize,
    pub idle: usize,
    pub wait_count: u64,
    pub wait_duration: Duration,
}

#[derive(Debug, Clone, Copy)]
pub struct HealthCheckResult {
    pub healthy: bool,
    pub duration: Duration,
}

pub(crate) struct PoolInner<C: DbConnection> {
    deadpool: deadpool::managed::Pool<ConnManager<C>>,
    retry: RetryPolicy,
    config: Config,
    closed: AtomicBool,
    draining: AtomicBool,
    wait_stats: WaitStats,
    telemetry_enabled: AtomicBool,
    metrics_enabled: AtomicBool,
    logging_enabled: AtomicBool,
    probe: Option<Arc<Probe<C>>>,
}

impl<C: DbConnection> PoolInner<C> {
    /// Used by the probe: a bare, un-instrumented ping that bypasses the
    /// closed/draining checks `Pool::ping` applies, since the probe must
    /// keep observing a pool mid-drain.
    pub(crate) async fn ping_inner(&self) -> Result<(), DbCoreError> {
        let mut obj = self
            .deadpool
            .get()
            .await
            .map_err(|e| map_pool_error(e))?;
        obj.conn.ping().await.map_err(|e| {
            let class = classify(&e, Operation::Ping);
            DbCoreError::classified(class, Operation::Ping, e)
        })
    }
}

/// The connection pool. Cheaply `Clone`-able — it's a thin handle around an
/// `Arc<PoolInner>`.
pub struct GenericPool<C: DbConnection>(Arc<PoolInner<C>>);

impl<C: DbConnection> Clone for GenericPool<C> {
    fn clone(&self) -> Self {
        GenericPool(self.0.clone())
    }
}

/// Production alias: a pool of real `mysql_async::Conn` connections.
pub type Pool = GenericPool<mysql_async::Conn>;

pub async fn open(config: Config) -> Result<Pool, DbCoreError> {
    config
        .validate()
        .map_err(|msg| DbCoreError::classified(crate::error::ErrorClass::Fatal, Operation::Connect, msg))?;

    let opts = mysql_async::Opts::from_url(&config.dsn)
        .map_err(|e| DbCoreError::classified(crate::error::ErrorClass::Fatal, Operation::Connect, e))?;
    let connect: Arc<dyn Connect<mysql_async::Conn>> = Arc::new(MysqlConnect { opts });
    open_with_connector(config, connect).await
}

/// Test/advanced-embedding entry point: builds a pool against any
/// `Connect<C>` implementation, not just the production MySQL dialer.
pub async fn open_with_connector<C: DbConnection>(config: Config, connect: Arc<dyn Connect<C>>) -> Result<GenericPool<C>, DbCoreError> {
    let manager = ConnManager {
        connect,
        max_lifetime: config.pool.conn_max_lifetime(),
        max_idle_time: config.pool.conn_max_idle_time(),
    };
    let max_size = if config.pool.max_open == 0 { 1 } else { config.pool.max_open as usize };
    // `wait`/`create`/`recycle` are left unset: acquisition deadlines are a
    // per-call `Acquire(ctx)` concern (see `acquire` below), not a pool-wide
    // setting.
    let pool_config = PoolConfig {
        max_size,
        timeouts: Timeouts::default(),
    };
    let deadpool_pool = deadpool::managed::Pool::builder(manager)
        .config(pool_config)
        .runtime(deadpool::Runtime::Tokio1)
        .build()
        .map_err(|e| DbCoreError::classified(crate::error::ErrorClass::Fatal, Operation::Connect, e.to_string()))?;

    let retry = RetryPolicy::from(&config.retry);
    let probe_config = config.probe.clone();

    let inner = Arc::new_cyclic(|weak: &std::sync::Weak<PoolInner<C>>| PoolInner {
        deadpool: deadpool_pool,
        retry,
        config,
        closed: AtomicBool::new(false),
        draining: AtomicBool::new(false),
        wait_stats: WaitStats::default(),
        telemetry_enabled: AtomicBool::new(true),
        metrics_enabled: AtomicBool::new(true),
        logging_enabled: AtomicBool::new(true),
        probe: if probe_config.enabled {
            Some(Arc::new(Probe::new(weak.clone(), probe_config)))
        } else {
            None
        },
    });

    if let Some(probe) = &inner.probe {
        probe.start();
    }

    Ok(GenericPool(inner))
}

fn map_pool_error(e: deadpool::managed::PoolError<mysql_async::Error>) -> DbCoreError {
    use deadpool::managed::PoolError;
    match e {
        PoolError::Closed => DbCoreError::PoolClosed,
        PoolError::Timeout(_) => DbCoreError::PoolExhausted,
        PoolError::Backend(err) => {
            let class = classify(&err, Operation::Connect);
            DbCoreError::classified(class, Operation::Connect, err)
        }
        PoolError::NoRuntimeSpecified => {
            DbCoreError::classified(crate::error::ErrorClass::Fatal, Operation::Connect, "no async runtime specified for pool")
        }
        other => DbCoreError::classified(crate::error::ErrorClass::Fatal, Operation::Connect, other.to_string()),
    }
}

impl<C: DbConnection> GenericPool<C> {
    /// `Acquire(ctx)`: blocks up to `deadline`, respecting the sizing
    /// policy's `max_open`. A `None` deadline waits indefinitely.
    pub async fn acquire(&self, deadline: Option<Duration>) -> Result<ConnectionHandle<C>, DbCoreError> {
        if self.0.closed.load(Ordering::Acquire) {
            return Err(DbCoreError::PoolClosed);
        }
        if self.0.draining.load(Ordering::Acquire) {
            return Err(DbCoreError::PoolExhausted);
        }

        let start = Instant::now();
        let obj = match deadline {
            Some(d) => match tokio::time::timeout(d, self.0.deadpool.get()).await {
                Ok(r) => r.map_err(map_pool_error)?,
                Err(_) => {
                    return Err(DbCoreError::classified(
                        crate::error::ErrorClass::Timeout,
                        Operation::Connect,
                        "acquire deadline elapsed before a connection became available",
                    ))
                }
            },
            None => self.0.deadpool.get().await.map_err(map_pool_error)?,
        };
        let wait = start.elapsed();
        self.0.wait_stats.wait_count.fetch_add(1, Ordering::Relaxed);
        self.0.wait_stats.wait_duration_nanos.fetch_add(wait.as_nanos() as u64, Ordering::Relaxed);
        if self.0.telemetry_enabled.load(Ordering::Relaxed) {
            telemetry::record_connection_acquired(wait);
        }

        let cache_capacity = self.0.config.statement_cache_capacity;
        let threshold = Duration::from_millis(self.0.config.slow_query_threshold_ms);
        Ok(ConnectionHandle::from_pooled(obj, cache_capacity, threshold))
    }

    /// `WithConn(ctx, body)`: acquires, runs `body`, and always releases —
    /// releasing here is `ConnectionHandle::close`'s own `Drop`/cache-clear,
    /// invoked on every exit path because `handle` only lives for the
    /// duration of this call.
    pub async fn with_conn<T, F, Fut>(&self, deadline: Option<Duration>, body: F) -> Result<T, DbCoreError>
    where
        F: FnOnce(ConnectionHandle<C>) -> Fut,
        Fut: Future<Output = Result<T, DbCoreError>>,
    {
        let handle = self.acquire(deadline).await?;
        body(handle).await
    }

    /// `WithinTx(ctx, opts, body)`. See `tx::with_tx` for the retry
    /// algorithm; this just wires the pool in as the per-attempt acquirer.
    pub async fn with_tx<T, F, Fut>(&self, opts: TxOpts, deadline: Option<Duration>, body: F) -> Result<T, DbCoreError>
    where
        F: Fn(&mut Transaction<C>) -> Fut,
        Fut: Future<Output = Result<T, DbCoreError>>,
    {
        let pool = self.clone();
        let acquire = move || -> Fut2<C> {
            let pool = pool.clone();
            Box::pin(async move { pool.acquire(deadline).await })
        };
        tx::with_tx(acquire, opts, &self.0.retry, body).await
    }

    /// `Ping(ctx)`: returns `PoolClosed` without touching the network when
    /// the pool has already been closed.
    pub async fn ping(&self) -> Result<(), DbCoreError> {
        if self.0.closed.load(Ordering::Acquire) {
            return Err(DbCoreError::PoolClosed);
        }
        self.0.ping_inner().await
    }

    /// Blocks further acquires, stops the probe (breaking the `Probe → Pool`
    /// cycle before the driver handle goes away), then closes the
    /// underlying `deadpool` pool. Idempotent.
    pub async fn close(&self) {
        if self.0.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(probe) = &self.0.probe {
            probe.stop().await;
        }
        self.0.deadpool.close();
    }

    pub fn stats(&self) -> PoolStats {
        let status = self.0.deadpool.status();
        PoolStats {
            open: status.size,
            in_use: status.size.saturating_sub(status.available.max(0) as usize),
            idle: status.available.max(0) as usize,
            wait_count: self.0.wait_stats.wait_count.load(Ordering::Relaxed),
            wait_duration: Duration::from_nanos(self.0.wait_stats.wait_duration_nanos.load(Ordering::Relaxed)),
        }
    }

    pub async fn health_check(&self) -> HealthCheckResult {
        let start = Instant::now();
        let healthy = self.ping().await.is_ok();
        HealthCheckResult { healthy, duration: start.elapsed() }
    }

    /// `Resize(open, idle)`: enforces `idle ≤ open`.
    pub async fn resize(&self, max_open: usize, max_idle: usize) -> Result<(), DbCoreError> {
        if max_open > 0 && max_idle > max_open {
            return Err(DbCoreError::classified(
                crate::error::ErrorClass::Fatal,
                Operation::Connect,
                format!("resize: max_idle ({max_idle}) must not exceed max_open ({max_open})"),
            ));
        }
        self.0.deadpool.resize(if max_open == 0 { usize::MAX } else { max_open });
        Ok(())
    }

    pub async fn scale_up(&self, n: usize) -> Result<(), DbCoreError> {
        let current = self.0.deadpool.status().max_size;
        self.0.deadpool.resize(current + n);
        Ok(())
    }

    /// Refuses to shrink the pool below the number of connections currently
    /// checked out.
    pub async fn scale_down(&self, n: usize) -> Result<(), DbCoreError> {
        let status = self.0.deadpool.status();
        let in_use = status.size.saturating_sub(status.available.max(0) as usize);
        let target = status.max_size.saturating_sub(n);
        if target < in_use {
            return Err(DbCoreError::classified(
                crate::error::ErrorClass::Fatal,
                Operation::Connect,
                format!("scale_down would reduce capacity ({target}) below in-use connections ({in_use})"),
            ));
        }
        self.0.deadpool.resize(target);
        Ok(())
    }

    /// `WarmUp(ctx)`: opens `min(idle_target, max_open)` connections
    /// synchronously, returning how many were actually established.
    pub async fn warm_up(&self, deadline: Option<Duration>) -> Result<usize, DbCoreError> {
        let status = self.0.deadpool.status();
        let target = self.0.config.pool.max_idle.min(self.0.config.pool.max_open.max(1)) as usize;
        let already = status.size;
        let mut opened = 0;
        let mut held = Vec::new();
        for _ in already..target {
            match self.acquire(deadline).await {
                Ok(handle) => {
                    opened += 1;
                    held.push(handle);
                }
                Err(_) => break,
            }
        }
        // Connections acquired here are released back to the pool as soon
        // as `held` drops, leaving them idle and ready for the next caller.
        drop(held);
        Ok(opened)
    }

    /// `DrainConnections(ctx)`: blocks new acquires and waits for in-use to
    /// reach zero or the deadline to expire.
    pub async fn drain_connections(&self, deadline: Option<Duration>) -> Result<(), DbCoreError> {
        self.0.draining.store(true, Ordering::Release);
        let poll_interval = Duration::from_millis(10);
        let start = Instant::now();
        loop {
            let status = self.0.deadpool.status();
            let in_use = status.size.saturating_sub(status.available.max(0) as usize);
            if in_use == 0 {
                return Ok(());
            }
            if let Some(d) = deadline {
                if start.elapsed() >= d {
                    return Err(DbCoreError::classified(
                        crate::error::ErrorClass::Timeout,
                        Operation::Connect,
                        "drain_connections deadline elapsed with connections still in use",
                    ));
                }
            }
            tokio::time::sleep(poll_interval).await;
        }
    }

    pub fn connection_utilization(&self) -> f64 {
        let status = self.0.deadpool.status();
        if status.max_size == 0 {
            return 0.0;
        }
        let in_use = status.size.saturating_sub(status.available.max(0) as usize);
        in_use as f64 / status.max_size as f64 * 100.0
    }

    pub fn enable_telemetry(&self, on: bool) {
        self.0.telemetry_enabled.store(on, Ordering::Relaxed);
    }

    pub fn enable_metrics(&self, on: bool) {
        self.0.metrics_enabled.store(on, Ordering::Relaxed);
    }

    pub fn enable_logging(&self, on: bool) {
        self.0.logging_enabled.store(on, Ordering::Relaxed);
    }

    pub async fn probe_state(&self) -> Option<ProbeStateSnapshot> {
        match &self.0.probe {
            Some(probe) => Some(probe.get_state().await),
            None => None,
        }
    }

    pub async fn force_probe(&self) -> Option<crate::probe::ProbeOutcome> {
        match &self.0.probe {
            Some(probe) => Some(probe.force_probe().await),
            None => None,
        }
    }

    pub async fn force_reconnect(&self) -> Option<crate::probe::ReconnectOutcome> {
        match &self.0.probe {
            Some(probe) => Some(probe.force_reconnect().await),
            None => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::fake::{FakeConn, FakeConnect, FakeScript};
    use tokio::sync::Mutex;

    async fn fake_pool(config: Config) -> GenericPool<FakeConn> {
        let connect: Arc<dyn Connect<FakeConn>> = Arc::new(FakeConnect { script: FakeScript::default() });
        open_with_connector(config, connect).await.unwrap()
    }

    fn config_with_max_open(max_open: u32) -> Config {
        Config {
            dsn: "mysql://localhost/test".into(),
            pool: crate::config::PoolSizing { max_open, max_idle: max_open, ..Default::default() },
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn with_conn_releases_the_handle_on_every_exit_path() {
        let pool = fake_pool(config_with_max_open(2)).await;
        pool.with_conn(None, |mut h| async move {
            h.ping().await?;
            Ok::<_, DbCoreError>(())
        })
        .await
        .unwrap();
        let stats = pool.stats();
        assert_eq!(stats.in_use, 0, "handle must be released after with_conn returns");

        let err_result: Result<(), DbCoreError> = pool
            .with_conn(None, |_h| async move { Err(DbCoreError::PoolClosed) })
            .await;
        assert!(err_result.is_err());
        assert_eq!(pool.stats().in_use, 0, "handle must be released even when body errors");
    }

    #[tokio::test]
    async fn max_open_one_serializes_two_concurrent_with_conn_calls() {
        let pool = fake_pool(config_with_max_open(1)).await;
        let order = Arc::new(Mutex::new(Vec::<&'static str>::new()));

        let pool1 = pool.clone();
        let order1 = order.clone();
        let first = tokio::spawn(async move {
            pool1
                .with_conn(None, |mut h| {
                    let order1 = order1.clone();
                    async move {
                        order1.lock().await.push("first-acquired");
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        h.ping().await?;
                        order1.lock().await.push("first-released");
                        Ok::<_, DbCoreError>(())
                    }
                })
                .await
        });

        tokio::time::sleep(Duration::from_millis(10)).await;

        let pool2 = pool.clone();
        let order2 = order.clone();
        let second = tokio::spawn(async move {
            pool2
                .with_conn(None, |mut h| {
                    let order2 = order2.clone();
                    async move {
                        order2.lock().await.push("second-acquired");
                        h.ping().await?;
                        Ok::<_, DbCoreError>(())
                    }
                })
                .await
        });

        first.await.unwrap().unwrap();
        second.await.unwrap().unwrap();

        let log = order.lock().await.clone();
        assert_eq!(log, vec!["first-acquired", "first-released", "second-acquired"]);
    }

    #[tokio::test]
    async fn acquire_times_out_when_pool_is_exhausted() {
        let pool = fake_pool(config_with_max_open(1)).await;
        let _held = pool.acquire(None).await.unwrap();
        let result = pool.acquire(Some(Duration::from_millis(20))).await;
        assert_eq!(result.unwrap_err().class(), Some(crate::error::ErrorClass::Timeout));
    }

    #[tokio::test]
    async fn ping_on_closed_pool_returns_pool_closed_without_touching_network() {
        let pool = fake_pool(config_with_max_open(2)).await;
        pool.close().await;
        let result = pool.ping().await;
        assert!(matches!(result, Err(DbCoreError::PoolClosed)));
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let pool = fake_pool(config_with_max_open(2)).await;
        pool.close().await;
        pool.close().await;
    }

    #[tokio::test]
    async fn scale_down_refuses_to_drop_below_in_use() {
        let pool = fake_pool(config_with_max_open(4)).await;
        let _held = pool.acquire(None).await.unwrap();
        let result = pool.scale_down(10).await;
        assert!(result.is_err(), "must refuse to shrink below the one checked-out connection");
    }

    #[tokio::test]
    async fn resize_rejects_idle_greater_than_open() {
        let pool = fake_pool(config_with_max_open(4)).await;
        let result = pool.resize(2, 5).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn probe_transitions_to_unhealthy_after_failure_threshold() {
        let ping_failures = Arc::new(std::sync::Mutex::new(std::collections::VecDeque::from(vec![
            mysql_async::Error::Io(mysql_async::IoError::Io(std::io::Error::new(std::io::ErrorKind::BrokenPipe, "lost"))),
            mysql_async::Error::Io(mysql_async::IoError::Io(std::io::Error::new(std::io::ErrorKind::BrokenPipe, "lost"))),
        ])));
        let script = FakeScript { ping_failures, ..Default::default() };
        let connect: Arc<dyn Connect<FakeConn>> = Arc::new(FakeConnect { script });
        let mut config = config_with_max_open(2);
        // `interval_ms` is set high enough that the probe's own background
        // ticker never fires during the test; `force_probe` below drives
        // the state machine deterministically instead.
        config.probe = crate::config::ProbeConfig {
            enabled: true,
            interval_ms: 60_000,
            timeout_ms: 2,
            failure_threshold: 2,
            success_threshold: 1,
            reconnect_enabled: false,
            ..Default::default()
        };
        let pool = open_with_connector(config, connect).await.unwrap();

        for _ in 0..2 {
            pool.force_probe().await;
        }

        let state = pool.probe_state().await.unwrap();
        assert_eq!(state.status, crate::probe::ProbeStatus::Unhealthy);
        assert!(state.consecutive_failures >= 2);
        pool.close().await;
    }
}
