//! Per-connection bounded LRU prepared-statement cache.
//!
//! Prepares on miss, evicts and closes the least-recently-used handle on
//! capacity. The cache lives with its `ConnectionHandle` rather than with
//! the physical connection: each acquisition starts with an empty cache,
//! and whatever got prepared during that scope is closed when the handle
//! is released (`clear`).

use lru::LruCache;
use std::num::NonZeroUsize;

use crate::driver::DbConnection;
use crate::error::{classify, DbCoreError, Operation};

/// Bounded per-handle statement cache. Capacity 0 disables caching entirely:
/// every call prepares and closes inline, and no cache state accumulates.
pub struct StatementCache<C: DbConnection> {
    entries: Option<LruCache<Box<str>, C::Statement>>,
}

impl<C: DbConnection> StatementCache<C> {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: NonZeroUsize::new(capacity).map(LruCache::new),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.as_ref().map(|c| c.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// `ExecCached`: prepare-or-reuse, then dispatch, returning affected rows.
    pub async fn exec(
        &mut self,
        conn: &mut C,
        sql: &str,
        params: mysql_async::Params,
    ) -> Result<crate::driver::ExecOutcome, DbCoreError> {
        let stmt = self.get_or_prepare(conn, sql).await?;
        let result = conn.exec(&stmt, params).await;
        self.close_if_uncached(conn, stmt).await;
        result.map_err(|e| {
            let class = classify(&e, Operation::Exec);
            DbCoreError::classified(class, Operation::Exec, e)
        })
    }

    /// `QueryCached`: prepare-or-reuse, then dispatch, returning rows.
    pub async fn query(
        &mut self,
        conn: &mut C,
        sql: &str,
        params: mysql_async::Params,
    ) -> Result<Vec<mysql_async::Row>, DbCoreError> {
        let stmt = self.get_or_prepare(conn, sql).await?;
        let result = conn.query(&stmt, params).await;
        self.close_if_uncached(conn, stmt).await;
        result.map_err(|e| {
            let class = classify(&e, Operation::Query);
            DbCoreError::classified(class, Operation::Query, e)
        })
    }

    async fn get_or_prepare(&mut self, conn: &mut C, sql: &str) -> Result<C::Statement, DbCoreError> {
        if let Some(cache) = self.entries.as_mut() {
            if let Some(stmt) = cache.get(sql) {
                return Ok(stmt.clone());
            }
        }
        let stmt = conn.prepare(sql).await.map_err(|e| {
            let class = classify(&e, Operation::Prepare);
            DbCoreError::classified(class, Operation::Prepare, e)
        })?;
        if let Some(cache) = self.entries.as_mut() {
            if let Some((_evicted_sql, evicted_stmt)) = cache.push(Box::from(sql), stmt.clone()) {
                let _ = conn.close_stmt(evicted_stmt).await;
            }
        }
        Ok(stmt)
    }

    /// When caching is disabled (capacity 0), every statement is single-use:
    /// close it right after the call that prepared it.
    async fn close_if_uncached(&self, conn: &mut C, stmt: C::Statement) {
        if self.entries.is_none() {
            let _ = conn.close_stmt(stmt).await;
        }
    }

    /// Detaches and closes every cached handle. Called exactly once, when
    /// the owning `ConnectionHandle` is released back to the pool — prepared
    /// handles are bound to this physical connection's server-side session
    /// and must never be leaked or reused by a different connection.
    pub async fn clear(&mut self, conn: &mut C) {
        if let Some(mut cache) = self.entries.take() {
            while let Some((_, stmt)) = cache.pop_lru() {
                let _ = conn.close_stmt(stmt).await;
            }
            self.entries = Some(LruCache::new(cache.cap()));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::fake::{FakeConn, FakeScript};

    fn null_params() -> mysql_async::Params {
        mysql_async::Params::Empty
    }

    #[tokio::test]
    async fn capacity_zero_never_accumulates_state() {
        let mut conn = FakeConn::new(FakeScript::default());
        let mut cache: StatementCache<FakeConn> = StatementCache::new(0);
        cache.exec(&mut conn, "SELECT 1", null_params()).await.unwrap();
        cache.exec(&mut conn, "SELECT 1", null_params()).await.unwrap();
        assert_eq!(cache.len(), 0);
        assert_eq!(conn.prepared.len(), 2, "capacity 0 must prepare on every call");
        assert_eq!(conn.closed.len(), 2, "capacity 0 must close on every call");
    }

    #[tokio::test]
    async fn eviction_closes_the_lru_entry() {
        let mut conn = FakeConn::new(FakeScript::default());
        let mut cache: StatementCache<FakeConn> = StatementCache::new(1);

        cache.query(&mut conn, "SELECT 1", null_params()).await.unwrap();
        cache.query(&mut conn, "SELECT 2", null_params()).await.unwrap();
        cache.query(&mut conn, "SELECT 1", null_params()).await.unwrap();

        assert_eq!(conn.prepared.len(), 3, "SELECT 1 should be evicted then re-prepared");
        assert_eq!(conn.closed.len(), 2, "both the SELECT 1 and SELECT 2 evictions should have closed a handle");
    }

    #[tokio::test]
    async fn repeat_calls_reuse_the_cached_handle() {
        let mut conn = FakeConn::new(FakeScript::default());
        let mut cache: StatementCache<FakeConn> = StatementCache::new(4);

        cache.query(&mut conn, "SELECT 1", null_params()).await.unwrap();
        cache.query(&mut conn, "SELECT 1", null_params()).await.unwrap();
        cache.query(&mut conn, "SELECT 1", null_params()).await.unwrap();

        assert_eq!(conn.prepared.len(), 1);
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test]
    async fn clear_closes_every_remaining_entry() {
        let mut conn = FakeConn::new(FakeScript::default());
        let mut cache: StatementCache<FakeConn> = StatementCache::new(4);

        cache.query(&mut conn, "SELECT 1", null_params()).await.unwrap();
        cache.query(&mut conn, "SELECT 2", null_params()).await.unwrap();
        assert_eq!(cache.len(), 2);

        cache.clear(&mut conn).await;

        assert_eq!(cache.len(), 0);
        assert_eq!(conn.closed.len(), 2);
    }
}
