//! The acquired-connection surface: `Exec`, `Query`, `Prepare`,
//! `ExecCached`, `QueryCached`, `BulkInsert`, `NamedExec`, `NamedQuery`.
//!
//! Single owner of a borrowed connection, exposing dispatch operations over
//! it. The per-handle `StatementCache` lives here because prepared
//! statements are bound to *this* physical connection's session.

use std::time::{Duration, Instant};

use mysql_async::{Params, Row, Value};

use crate::cache::StatementCache;
use crate::driver::{DbConnection, ExecOutcome};
use crate::error::{classify, DbCoreError, ErrorClass, Operation};
use crate::params::{build_in, expand_named, ParamSource};
use crate::telemetry;

/// Where the physical connection actually lives. In production it's checked
/// out of the `deadpool` pool, and dropping it (via `ConnectionHandle::close`
/// or plain `Drop`) returns it for `recycle`; tests that build a
/// `ConnectionHandle` directly against a `FakeConn` never go through a pool
/// at all, so they own the value outright.
pub(crate) enum ConnSlot<C: DbConnection> {
    Owned(C),
    Pooled(deadpool::managed::Object<crate::pool::ConnManager<C>>),
}

impl<C: DbConnection> std::ops::Deref for ConnSlot<C> {
    type Target = C;
    fn deref(&self) -> &C {
        match self {
            ConnSlot::Owned(c) => c,
            ConnSlot::Pooled(obj) => {
                let managed: &crate::pool::ManagedConn<C> = &**obj;
                &managed.conn
            }
        }
    }
}

impl<C: DbConnection> std::ops::DerefMut for ConnSlot<C> {
    fn deref_mut(&mut self) -> &mut C {
        match self {
            ConnSlot::Owned(c) => c,
            ConnSlot::Pooled(obj) => {
                let managed: &mut crate::pool::ManagedConn<C> = &mut **obj;
                &mut managed.conn
            }
        }
    }
}

/// A single acquired physical connection, exclusively owned by its caller
/// for the scope of the acquisition.
pub struct ConnectionHandle<C: DbConnection> {
    pub(crate) conn: ConnSlot<C>,
    pub(crate) cache: StatementCache<C>,
    pub(crate) acquired_at: Instant,
    pub(crate) slow_query_threshold: Duration,
}

impl<C: DbConnection> ConnectionHandle<C> {
    pub(crate) fn new(conn: C, cache_capacity: usize, slow_query_threshold: Duration) -> Self {
        Self {
            conn: ConnSlot::Owned(conn),
            cache: StatementCache::new(cache_capacity),
            acquired_at: Instant::now(),
            slow_query_threshold,
        }
    }

    /// Wraps a connection checked out of the pool. The returned handle's
    /// `Drop` (or explicit `close`) releases `obj` back to `deadpool`, which
    /// runs `ConnManager::recycle` before handing it to the next acquirer.
    pub(crate) fn from_pooled(
        obj: deadpool::managed::Object<crate::pool::ConnManager<C>>,
        cache_capacity: usize,
        slow_query_threshold: Duration,
    ) -> Self {
        Self {
            conn: ConnSlot::Pooled(obj),
            cache: StatementCache::new(cache_capacity),
            acquired_at: Instant::now(),
            slow_query_threshold,
        }
    }

    pub fn acquired_at(&self) -> Instant {
        self.acquired_at
    }

    /// Uncached `Exec`: prepares, dispatches, and closes the statement
    /// inline. Use `exec_cached` when the same SQL text recurs on this
    /// connection.
    pub async fn exec(&mut self, sql: &str, params: impl Into<Params>) -> Result<ExecOutcome, DbCoreError> {
        let start = Instant::now();
        let params = params.into();
        let arg_count = param_count(&params);
        let stmt = self.prepare_inline(sql).await?;
        let result = self.conn.exec(&stmt, params).await;
        let _ = self.conn.close_stmt(stmt).await;
        self.finish(Operation::Exec, sql, arg_count, start, result)
    }

    /// Uncached `Query`.
    pub async fn query(&mut self, sql: &str, params: impl Into<Params>) -> Result<Vec<Row>, DbCoreError> {
        let start = Instant::now();
        let params = params.into();
        let arg_count = param_count(&params);
        let stmt = self.prepare_inline(sql).await?;
        let result = self.conn.query(&stmt, params).await;
        let _ = self.conn.close_stmt(stmt).await;
        self.finish(Operation::Query, sql, arg_count, start, result)
    }

    /// Prepares `sql` without caching it, returning a handle the caller is
    /// responsible for closing via `close_prepared`. The returned statement
    /// is bound to this physical connection and must never be used against
    /// another one.
    pub async fn prepare(&mut self, sql: &str) -> Result<PreparedStatement<C>, DbCoreError> {
        let stmt = self.prepare_inline(sql).await?;
        Ok(PreparedStatement { stmt, sql: sql.to_string() })
    }

    pub async fn exec_prepared(&mut self, stmt: &PreparedStatement<C>, params: impl Into<Params>) -> Result<ExecOutcome, DbCoreError> {
        let start = Instant::now();
        let params = params.into();
        let arg_count = param_count(&params);
        let result = self.conn.exec(&stmt.stmt, params).await;
        self.finish(Operation::Exec, &stmt.sql, arg_count, start, result)
    }

    pub async fn query_prepared(&mut self, stmt: &PreparedStatement<C>, params: impl Into<Params>) -> Result<Vec<Row>, DbCoreError> {
        let start = Instant::now();
        let params = params.into();
        let arg_count = param_count(&params);
        let result = self.conn.query(&stmt.stmt, params).await;
        self.finish(Operation::Query, &stmt.sql, arg_count, start, result)
    }

    pub async fn close_prepared(&mut self, stmt: PreparedStatement<C>) -> Result<(), DbCoreError> {
        self.conn.close_stmt(stmt.stmt).await.map_err(|e| {
            let class = classify(&e, Operation::Prepare);
            DbCoreError::classified(class, Operation::Prepare, e)
        })
    }

    /// `ExecCached`: reuses this connection's prepared-statement LRU.
    pub async fn exec_cached(&mut self, sql: &str, params: impl Into<Params>) -> Result<ExecOutcome, DbCoreError> {
        let start = Instant::now();
        let params = params.into();
        let arg_count = param_count(&params);
        let result = self.cache.exec(&mut *self.conn, sql, params).await;
        self.finish(Operation::Exec, sql, arg_count, start, result)
    }

    /// `QueryCached`.
    pub async fn query_cached(&mut self, sql: &str, params: impl Into<Params>) -> Result<Vec<Row>, DbCoreError> {
        let start = Instant::now();
        let params = params.into();
        let arg_count = param_count(&params);
        let result = self.cache.query(&mut *self.conn, sql, params).await;
        self.finish(Operation::Query, sql, arg_count, start, result)
    }

    /// Assembles one `INSERT INTO table (cols) VALUES (?,?,…), (?,?,…), …`
    /// statement with `rows.len()` value groups and row-major positional
    /// args, then dispatches it in a single round trip. An empty `rows`
    /// short-circuits to a zero-affected-rows result without touching the
    /// network.
    ///
    /// Column identifiers are emitted literally: the caller is trusted to
    /// pass real column names, not attacker-controlled strings. Only empty
    /// names are rejected.
    pub async fn bulk_insert(&mut self, table: &str, cols: &[&str], rows: &[Vec<Value>]) -> Result<ExecOutcome, DbCoreError> {
        if rows.is_empty() {
            return Ok(ExecOutcome::default());
        }
        if cols.iter().any(|c| c.is_empty()) {
            return Err(DbCoreError::classified(
                ErrorClass::SyntaxError,
                Operation::Exec,
                "bulk_insert column name must not be empty",
            ));
        }

        let col_list = cols.join(",");
        let group = format!("({})", std::iter::repeat("?").take(cols.len()).collect::<Vec<_>>().join(","));
        let groups = std::iter::repeat(group.as_str()).take(rows.len()).collect::<Vec<_>>().join(",");
        let sql = format!("INSERT INTO {table} ({col_list}) VALUES {groups}");

        let mut args = Vec::with_capacity(rows.len() * cols.len());
        for row in rows {
            args.extend(row.iter().cloned());
        }

        self.exec(&sql, Params::Positional(args)).await
    }

    /// `NamedExec` against a single bound record.
    pub async fn named_exec(&mut self, sql: &str, source: &dyn ParamSource) -> Result<ExecOutcome, DbCoreError> {
        self.named_exec_many(sql, &[source]).await
    }

    /// Dispatches `sql` once per element of `sources`, returning the sum of
    /// affected rows: one `NamedExec` dispatched per element, rows summed.
    pub async fn named_exec_many(&mut self, sql: &str, sources: &[&dyn ParamSource]) -> Result<ExecOutcome, DbCoreError> {
        let (positional_sql, names) = expand_named(sql);
        let mut total = ExecOutcome::default();
        for source in sources {
            let values = source.ordered_values(&names)?;
            let outcome = self.exec_cached(&positional_sql, Params::Positional(values)).await?;
            total.affected_rows += outcome.affected_rows;
            total.last_insert_id = outcome.last_insert_id.or(total.last_insert_id);
        }
        Ok(total)
    }

    /// `NamedQuery`.
    pub async fn named_query(&mut self, sql: &str, source: &dyn ParamSource) -> Result<Vec<Row>, DbCoreError> {
        let (positional_sql, names) = expand_named(sql);
        let values = source.ordered_values(&names)?;
        self.query_cached(&positional_sql, Params::Positional(values)).await
    }

    pub async fn ping(&mut self) -> Result<(), DbCoreError> {
        self.conn.ping().await.map_err(|e| {
            let class = classify(&e, Operation::Ping);
            DbCoreError::classified(class, Operation::Ping, e)
        })
    }

    /// Detaches and closes every prepared statement this handle accumulated,
    /// then (implicitly, via `Drop`) returns the underlying physical
    /// connection to the pool.
    pub async fn close(mut self) {
        self.cache.clear(&mut *self.conn).await;
    }

    async fn prepare_inline(&mut self, sql: &str) -> Result<C::Statement, DbCoreError> {
        self.conn.prepare(sql).await.map_err(|e| {
            let class = classify(&e, Operation::Prepare);
            DbCoreError::classified(class, Operation::Prepare, e)
        })
    }

    fn finish<T>(&self, op: Operation, sql: &str, arg_count: usize, start: Instant, result: Result<T, DbCoreError>) -> Result<T, DbCoreError> {
        let duration = start.elapsed();
        match &result {
            Ok(_) => telemetry::record_dispatch(op, "ok", duration, sql, arg_count, self.slow_query_threshold),
            Err(e) => telemetry::record_failure(op, e.class().unwrap_or(ErrorClass::Fatal), None),
        }
        result
    }
}

/// A statement prepared outside the LRU cache; the caller owns its
/// lifecycle and must close it via `ConnectionHandle::close_prepared`.
pub struct PreparedStatement<C: DbConnection> {
    stmt: C::Statement,
    sql: String,
}

fn param_count(params: &Params) -> usize {
    match params {
        Params::Empty => 0,
        Params::Positional(v) => v.len(),
        Params::Named(m) => m.len(),
        _ => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::fake::{FakeConn, FakeScript};
    use std::collections::HashMap;

    fn handle(conn: FakeConn) -> ConnectionHandle<FakeConn> {
        ConnectionHandle::new(conn, 8, Duration::ZERO)
    }

    #[tokio::test]
    async fn bulk_insert_empty_rows_short_circuits() {
        let mut h = handle(FakeConn::new(FakeScript::default()));
        let outcome = h.bulk_insert("t", &["a", "b"], &[]).await.unwrap();
        assert_eq!(outcome.affected_rows, 0);
        assert!(h.conn.prepared.is_empty(), "must not touch the network");
    }

    #[tokio::test]
    async fn bulk_insert_assembles_one_statement_for_all_rows() {
        let mut h = handle(FakeConn::new(FakeScript::default()));
        let rows = vec![
            vec![Value::Int(1), Value::Bytes(b"x".to_vec())],
            vec![Value::Int(2), Value::Bytes(b"y".to_vec())],
        ];
        let outcome = h.bulk_insert("t", &["a", "b"], &rows).await.unwrap();
        assert_eq!(outcome.affected_rows, 1); // FakeConn reports 1 affected row per exec call
        assert_eq!(h.conn.prepared.len(), 1);
        assert_eq!(h.conn.prepared[0], "INSERT INTO t (a,b) VALUES (?,?),(?,?)");
    }

    #[tokio::test]
    async fn bulk_insert_rejects_empty_column_name() {
        let mut h = handle(FakeConn::new(FakeScript::default()));
        let err = h.bulk_insert("t", &["a", ""], &[vec![Value::Int(1), Value::Int(2)]]).await.unwrap_err();
        assert_eq!(err.class(), Some(ErrorClass::SyntaxError));
    }

    #[tokio::test]
    async fn named_exec_dispatches_positional_form() {
        let mut h = handle(FakeConn::new(FakeScript::default()));
        let mut m = HashMap::new();
        m.insert("a".to_string(), Value::Int(1));
        m.insert("b".to_string(), Value::Bytes(b"x".to_vec()));
        let source = crate::params::MapParams(m);
        h.named_exec("INSERT INTO t(a,b) VALUES(:a,:b)", &source).await.unwrap();
        assert_eq!(h.conn.prepared[0], "INSERT INTO t(a,b) VALUES(?,?)");
    }

    #[tokio::test]
    async fn named_exec_many_aggregates_affected_rows() {
        let mut h = handle(FakeConn::new(FakeScript::default()));
        let mut m1 = HashMap::new();
        m1.insert("a".to_string(), Value::Int(1));
        let mut m2 = HashMap::new();
        m2.insert("a".to_string(), Value::Int(2));
        let s1 = crate::params::MapParams(m1);
        let s2 = crate::params::MapParams(m2);
        let outcome = h.named_exec_many("INSERT INTO t(a) VALUES(:a)", &[&s1, &s2]).await.unwrap();
        assert_eq!(outcome.affected_rows, 2);
    }

    #[tokio::test]
    async fn close_clears_the_statement_cache() {
        let mut h = handle(FakeConn::new(FakeScript::default()));
        h.exec_cached("SELECT 1", Params::Empty).await.unwrap();
        assert_eq!(h.cache.len(), 1);
        h.close().await;
    }
}
