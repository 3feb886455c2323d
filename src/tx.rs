//! Transaction executor: `WithinTx`'s begin/run/commit-or-rollback wrapper
//! and its classified-retry loop.
//!
//! Each attempt gets a *fresh* connection (a connection that saw
//! `ConnectionLost` must never be reused), and only `Deadlock` / `ReadOnly`
//! / `ConnectionLost` failures before a successful commit are retried.

use std::future::Future;
use std::time::{Duration, Instant};

use mysql_async::{Params, Row};

use crate::driver::{DbConnection, ExecOutcome};
use crate::error::{classify, DbCoreError, ErrorClass, Operation};
use crate::handle::ConnectionHandle;
use crate::params::ParamSource;
use crate::retry::{RetryDecision, RetryPolicy};
use crate::telemetry;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IsolationLevel {
    ReadUncommitted,
    ReadCommitted,
    RepeatableRead,
    Serializable,
}

impl IsolationLevel {
    fn as_sql(self) -> &'static str {
        match self {
            IsolationLevel::ReadUncommitted => "READ UNCOMMITTED",
            IsolationLevel::ReadCommitted => "READ COMMITTED",
            IsolationLevel::RepeatableRead => "REPEATABLE READ",
            IsolationLevel::Serializable => "SERIALIZABLE",
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct TxOpts {
    pub isolation: Option<IsolationLevel>,
    pub read_only: bool,
}

impl Default for TxOpts {
    fn default() -> Self {
        Self { isolation: None, read_only: false }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TxState {
    Begun,
    Running,
    Terminal,
}

/// A transaction bound to a single connection handle for one retry attempt.
/// Owns its `ConnectionHandle` (rather than borrowing it) because each
/// attempt in `with_tx`'s retry loop acquires a brand-new connection — the
/// handle never outlives the attempt that created it.
pub struct Transaction<C: DbConnection> {
    handle: ConnectionHandle<C>,
    state: TxState,
}

/// Rejected once a transaction has reached its terminal state, matching
/// no operation is dispatched after terminal state.
fn terminal_error() -> DbCoreError {
    DbCoreError::classified(ErrorClass::Fatal, Operation::Exec, "operation issued on a terminal transaction")
}

impl<C: DbConnection> Transaction<C> {
    async fn begin(mut handle: ConnectionHandle<C>, opts: TxOpts) -> Result<Self, DbCoreError> {
        if let Some(isolation) = opts.isolation {
            let sql = format!("SET TRANSACTION ISOLATION LEVEL {}", isolation.as_sql());
            handle.conn.query_drop(&sql).await.map_err(|e| {
                let class = classify(&e, Operation::Begin);
                DbCoreError::classified(class, Operation::Begin, e)
            })?;
        }
        let begin_sql = if opts.read_only { "START TRANSACTION READ ONLY" } else { "START TRANSACTION" };
        handle.conn.query_drop(begin_sql).await.map_err(|e| {
            let class = classify(&e, Operation::Begin);
            DbCoreError::classified(class, Operation::Begin, e)
        })?;
        Ok(Self { handle, state: TxState::Running })
    }

    fn ensure_running(&self) -> Result<(), DbCoreError> {
        if self.state != TxState::Running {
            return Err(terminal_error());
        }
        Ok(())
    }

    pub async fn exec(&mut self, sql: &str, params: impl Into<Params>) -> Result<ExecOutcome, DbCoreError> {
        self.ensure_running()?;
        self.handle.exec(sql, params).await
    }

    pub async fn query(&mut self, sql: &str, params: impl Into<Params>) -> Result<Vec<Row>, DbCoreError> {
        self.ensure_running()?;
        self.handle.query(sql, params).await
    }

    pub async fn exec_cached(&mut self, sql: &str, params: impl Into<Params>) -> Result<ExecOutcome, DbCoreError> {
        self.ensure_running()?;
        self.handle.exec_cached(sql, params).await
    }

    pub async fn query_cached(&mut self, sql: &str, params: impl Into<Params>) -> Result<Vec<Row>, DbCoreError> {
        self.ensure_running()?;
        self.handle.query_cached(sql, params).await
    }

    pub async fn named_exec(&mut self, sql: &str, source: &dyn ParamSource) -> Result<ExecOutcome, DbCoreError> {
        self.ensure_running()?;
        self.handle.named_exec(sql, source).await
    }

    pub async fn named_query(&mut self, sql: &str, source: &dyn ParamSource) -> Result<Vec<Row>, DbCoreError> {
        self.ensure_running()?;
        self.handle.named_query(sql, source).await
    }

    pub async fn bulk_insert(&mut self, table: &str, cols: &[&str], rows: &[Vec<mysql_async::Value>]) -> Result<ExecOutcome, DbCoreError> {
        self.ensure_running()?;
        self.handle.bulk_insert(table, cols, rows).await
    }

    /// Commits. A `ConnectionLost` failure here is surfaced as
    /// `CommitAmbiguous`: the executor cannot know whether the server
    /// applied the commit before the connection dropped.
    async fn commit(&mut self) -> Result<(), DbCoreError> {
        self.ensure_running()?;
        self.state = TxState::Terminal;
        match self.handle.conn.query_drop("COMMIT").await {
            Ok(()) => Ok(()),
            Err(e) => {
                let class = classify(&e, Operation::Commit);
                if class == ErrorClass::ConnectionLost {
                    Err(DbCoreError::CommitAmbiguous { operation: "commit", cause: Box::new(e) })
                } else {
                    Err(DbCoreError::classified(class, Operation::Commit, e))
                }
            }
        }
    }

    /// Best-effort rollback: failures here are swallowed (the connection is
    /// being discarded either way — it returns to the pool via `Drop` and
    /// its eventual `recycle`/`ping` will surface any lingering issue).
    async fn rollback(&mut self) {
        if self.state != TxState::Running {
            return;
        }
        self.state = TxState::Terminal;
        let _ = self.handle.conn.query_drop("ROLLBACK").await;
    }
}

/// Outcome of one attempt, prior to the retry policy's verdict.
enum AttemptOutcome<T> {
    Committed(T),
    Failed { retryable: bool, err: DbCoreError },
}

/// `WithinTx(ctx, opts, body)`: acquires a fresh connection per attempt,
/// begins a transaction with `opts`, runs `body`, and commits. Retries
/// `Deadlock` / `ReadOnly` / `ConnectionLost` failures that occur before a
/// successful commit, per the supplied `RetryPolicy`; every other class
/// propagates immediately.
pub async fn with_tx<C, A, T, F, Fut>(acquire: A, opts: TxOpts, policy: &RetryPolicy, body: F) -> Result<T, DbCoreError>
where
    C: DbConnection,
    A: Fn() -> Fut2<C>,
    F: Fn(&mut Transaction<C>) -> Fut,
    Fut: Future<Output = Result<T, DbCoreError>>,
{
    let start = Instant::now();
    let mut attempt: u32 = 0;

    loop {
        let outcome = run_attempt(&acquire, opts, &body).await;
        match outcome {
            AttemptOutcome::Committed(value) => {
                telemetry::record_transaction_outcome("committed", attempt + 1);
                return Ok(value);
            }
            AttemptOutcome::Failed { retryable, err } => {
                if !retryable {
                    telemetry::record_transaction_outcome("failed", attempt + 1);
                    return Err(err);
                }
                match policy.decide(attempt, start.elapsed()) {
                    RetryDecision::RetryAfter(delay) => {
                        attempt += 1;
                        tokio::time::sleep(delay).await;
                        continue;
                    }
                    RetryDecision::GiveUp => {
                        telemetry::record_transaction_outcome("failed", attempt + 1);
                        return Err(err.with_retry_count(attempt + 1));
                    }
                }
            }
        }
    }
}

/// Type alias working around the lack of `async fn` in traits without
/// `async_trait` here: `acquire` is a plain closure returning a boxed
/// future so `with_tx` stays generic over the caller's acquisition source
/// (the pool in production, a fake connector in tests).
pub type Fut2<C> = std::pin::Pin<Box<dyn Future<Output = Result<ConnectionHandle<C>, DbCoreError>> + Send>>;

async fn run_attempt<C, A, T, F, Fut>(acquire: &A, opts: TxOpts, body: &F) -> AttemptOutcome<T>
where
    C: DbConnection,
    A: Fn() -> Fut2<C>,
    F: Fn(&mut Transaction<C>) -> Fut,
    Fut: Future<Output = Result<T, DbCoreError>>,
{
    let handle = match acquire().await {
        Ok(h) => h,
        Err(err) => {
            let retryable = retry_eligible(&err);
            return AttemptOutcome::Failed { retryable, err };
        }
    };

    let mut tx = match Transaction::begin(handle, opts).await {
        Ok(tx) => tx,
        Err(err) => {
            let retryable = retry_eligible(&err);
            return AttemptOutcome::Failed { retryable, err };
        }
    };

    match body(&mut tx).await {
        Ok(value) => match tx.commit().await {
            Ok(()) => AttemptOutcome::Committed(value),
            // Commit-phase failures are never retried, even when their
            // class would normally be retriable elsewhere: whether the
            // server applied the commit is unknown, so blindly retrying
            // risks double-applying the transaction's effects.
            Err(err) => AttemptOutcome::Failed { retryable: false, err },
        },
        Err(err) => {
            tx.rollback().await;
            let retryable = retry_eligible(&err);
            AttemptOutcome::Failed { retryable, err }
        }
    }
}

/// Whether a pre-commit failure is one of the three classes retriable
/// at the transaction boundary.
fn retry_eligible(err: &DbCoreError) -> bool {
    matches!(
        err.class(),
        Some(ErrorClass::Deadlock) | Some(ErrorClass::ReadOnly) | Some(ErrorClass::ConnectionLost)
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::fake::{FakeConn, FakeScript};
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};

    fn acquirer(script: FakeScript) -> impl Fn() -> Fut2<FakeConn> {
        move || {
            let script = script.clone();
            Box::pin(async move {
                let conn = FakeConn::new(script);
                Ok(ConnectionHandle::new(conn, 8, Duration::ZERO))
            })
        }
    }

    fn deadlock_err() -> mysql_async::Error {
        mysql_async::Error::Server(mysql_async::ServerError {
            code: 1213,
            message: "deadlock".into(),
            state: "40001".into(),
        })
    }

    #[tokio::test]
    async fn happy_path_commits_once() {
        let script = FakeScript::default();
        let policy = RetryPolicy::default();
        let result = with_tx(acquirer(script), TxOpts::default(), &policy, |tx| async move {
            tx.exec("INSERT INTO t VALUES (1)", mysql_async::Params::Empty).await?;
            Ok::<_, DbCoreError>(42)
        })
        .await
        .unwrap();
        assert_eq!(result, 42);
    }

    #[tokio::test]
    async fn retries_deadlock_then_succeeds() {
        let script = FakeScript {
            exec_failures: Arc::new(Mutex::new(VecDeque::from(vec![deadlock_err(), deadlock_err()]))),
            ..Default::default()
        };
        let policy = RetryPolicy {
            max_attempts: 3,
            base_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(10),
            multiplier: 2.0,
            jitter: false,
            max_elapsed: None,
        };
        let attempts = Arc::new(Mutex::new(0u32));
        let attempts_clone = attempts.clone();
        let result = with_tx(acquirer(script), TxOpts::default(), &policy, move |tx| {
            let attempts_clone = attempts_clone.clone();
            async move {
                *attempts_clone.lock().unwrap() += 1;
                tx.exec("UPDATE t SET a=1", mysql_async::Params::Empty).await?;
                Ok::<_, DbCoreError>(())
            }
        })
        .await;
        assert!(result.is_ok());
        assert_eq!(*attempts.lock().unwrap(), 3);
    }

    #[tokio::test]
    async fn syntax_error_is_never_retried() {
        let syntax_err = mysql_async::Error::Server(mysql_async::ServerError {
            code: 1064,
            message: "parse error".into(),
            state: "42000".into(),
        });
        let script = FakeScript {
            exec_failures: Arc::new(Mutex::new(VecDeque::from(vec![syntax_err]))),
            ..Default::default()
        };
        let policy = RetryPolicy::default();
        let attempts = Arc::new(Mutex::new(0u32));
        let attempts_clone = attempts.clone();
        let result = with_tx(acquirer(script), TxOpts::default(), &policy, move |tx| {
            let attempts_clone = attempts_clone.clone();
            async move {
                *attempts_clone.lock().unwrap() += 1;
                tx.exec("BAD SQL", mysql_async::Params::Empty).await?;
                Ok::<_, DbCoreError>(())
            }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(result.unwrap_err().class(), Some(ErrorClass::SyntaxError));
        assert_eq!(*attempts.lock().unwrap(), 1, "must not retry a syntax error");
    }

    #[tokio::test]
    async fn terminal_transaction_rejects_further_operations() {
        let script = FakeScript::default();
        let conn = FakeConn::new(script);
        let handle = ConnectionHandle::new(conn, 8, Duration::ZERO);
        let mut tx = Transaction::begin(handle, TxOpts::default()).await.unwrap();
        tx.commit().await.unwrap();
        let err = tx.exec("SELECT 1", mysql_async::Params::Empty).await.unwrap_err();
        assert_eq!(err.class(), Some(ErrorClass::Fatal));
    }
}
