//! The driver boundary: a small trait generalizing over `mysql_async::Conn`
//! so that the pool, cache, and retry engine can be exercised against an
//! in-memory fake without a live MySQL server (see `#[cfg(test)] mod fake`
//! below).

use async_trait::async_trait;

/// Outcome of a non-query-returning dispatch (`Exec`).
#[derive(Debug, Clone, Copy, Default)]
pub struct ExecOutcome {
    pub affected_rows: u64,
    pub last_insert_id: Option<u64>,
}

/// Abstraction over a single physical MySQL connection. Implemented for
/// `mysql_async::Conn` in production; a `FakeConn` implements it under
/// `#[cfg(test)]` for deterministic unit tests of pool/cache/retry/probe
/// logic. `Statement` is an associated type rather than a fixed driver type
/// so the fake never needs to fabricate a real `mysql_async::Statement`.
#[async_trait]
pub trait DbConnection: Send + 'static {
    type Statement: Clone + Send + Sync + 'static;

    async fn ping(&mut self) -> Result<(), mysql_async::Error>;
    async fn prepare(&mut self, sql: &str) -> Result<Self::Statement, mysql_async::Error>;
    async fn exec(
        &mut self,
        stmt: &Self::Statement,
        params: mysql_async::Params,
    ) -> Result<ExecOutcome, mysql_async::Error>;
    async fn query(
        &mut self,
        stmt: &Self::Statement,
        params: mysql_async::Params,
    ) -> Result<Vec<mysql_async::Row>, mysql_async::Error>;
    async fn close_stmt(&mut self, stmt: Self::Statement) -> Result<(), mysql_async::Error>;
    /// Issues a bare SQL statement with no parameters and discards any
    /// result set. Used for `BEGIN` / `COMMIT` / `ROLLBACK` / the defensive
    /// rollback issued on recycle.
    async fn query_drop(&mut self, sql: &str) -> Result<(), mysql_async::Error>;
}

#[async_trait]
impl DbConnection for mysql_async::Conn {
    type Statement = mysql_async::Statement;

    async fn ping(&mut self) -> Result<(), mysql_async::Error> {
        mysql_async::prelude::Queryable::ping(self).await
    }

    async fn prepare(&mut self, sql: &str) -> Result<Self::Statement, mysql_async::Error> {
        mysql_async::prelude::Queryable::prep(self, sql).await
    }

    async fn exec(
        &mut self,
        stmt: &Self::Statement,
        params: mysql_async::Params,
    ) -> Result<ExecOutcome, mysql_async::Error> {
        mysql_async::prelude::Queryable::exec_drop(self, stmt, params).await?;
        Ok(ExecOutcome {
            affected_rows: self.affected_rows(),
            last_insert_id: self.last_insert_id(),
        })
    }

    async fn query(
        &mut self,
        stmt: &Self::Statement,
        params: mysql_async::Params,
    ) -> Result<Vec<mysql_async::Row>, mysql_async::Error> {
        mysql_async::prelude::Queryable::exec(self, stmt, params).await
    }

    async fn close_stmt(&mut self, stmt: Self::Statement) -> Result<(), mysql_async::Error> {
        self.close(stmt).await
    }

    async fn query_drop(&mut self, sql: &str) -> Result<(), mysql_async::Error> {
        mysql_async::prelude::Queryable::query_drop(self, sql).await
    }
}

/// Connects a fresh physical connection. Kept as a trait (rather than a bare
/// async fn pointer) so `ConnManager` can be generic over both the
/// production dialer (`mysql_async::Conn::new`) and a test dialer that
/// returns fakes.
#[async_trait]
pub trait Connect<C>: Send + Sync + 'static {
    async fn connect(&self) -> Result<C, mysql_async::Error>;
}

pub struct MysqlConnect {
    pub opts: mysql_async::Opts,
}

#[async_trait]
impl Connect<mysql_async::Conn> for MysqlConnect {
    async fn connect(&self) -> Result<mysql_async::Conn, mysql_async::Error> {
        mysql_async::Conn::new(self.opts.clone()).await
    }
}
