//! Pooled access core for a wire-compatible MySQL server: connection
//! pooling, a per-connection prepared-statement cache, scoped-execution
//! wrappers, a classified-error transaction retry engine, and a background
//! health-probe / auto-reconnector.

pub mod cache;
pub mod config;
pub mod driver;
pub mod error;
pub mod handle;
pub mod params;
pub mod pool;
pub mod probe;
pub mod retry;
pub mod telemetry;
pub mod tx;

pub use config::Config;
pub use error::{BoxError, DbCoreError, ErrorClass, Operation};
pub use handle::{ConnectionHandle, PreparedStatement};
pub use params::{build_in, expand_named, MapParams, ParamSource, SliceParams, SortedMapParams};
pub use pool::{open, HealthCheckResult, Pool, PoolStats};
pub use probe::{Probe, ProbeMetrics, ProbeOutcome, ProbeStateSnapshot, ProbeStatus, ReconnectOutcome};
pub use retry::{RetryDecision, RetryPolicy};
pub use tx::{IsolationLevel, Transaction, TxOpts};
