use crate::{Result, RowSet, SqlWriter, Statement, TransactionOptions};
use std::future::Future;

/// Entry point of a database backend.
///
/// A driver is shared by the pool and opens new connections on demand, it must be cheap to
/// share across tasks.
pub trait Driver: Send + Sync + 'static {
    type Connection: Connection;
    type SqlWriter: SqlWriter;

    /// Url scheme accepted by `connect`.
    const NAME: &'static str;

    fn sql_writer(&self) -> Self::SqlWriter;

    /// Open a new physical connection.
    fn connect(&self, url: &str) -> impl Future<Output = Result<Self::Connection>> + Send;
}

/// One physical connection: the primitive everything else is built on.
///
/// Errors that mean the connection is gone must be reported as
/// [`SessionError::Disconnected`](crate::SessionError::Disconnected), the pool then discards
/// the connection instead of reusing it.
pub trait Connection: Send + 'static {
    fn begin(&mut self, options: &TransactionOptions) -> impl Future<Output = Result<()>> + Send;

    /// Run one statement, inside the open transaction if any, otherwise in autocommit.
    fn execute(&mut self, statement: &Statement) -> impl Future<Output = Result<RowSet>> + Send;

    fn savepoint(&mut self, name: &str) -> impl Future<Output = Result<()>> + Send;

    fn release_savepoint(&mut self, name: &str) -> impl Future<Output = Result<()>> + Send;

    fn rollback_to_savepoint(&mut self, name: &str) -> impl Future<Output = Result<()>> + Send;

    fn commit(&mut self) -> impl Future<Output = Result<()>> + Send;

    fn rollback(&mut self) -> impl Future<Output = Result<()>> + Send;

    /// Cheap round trip telling whether the connection is still usable.
    fn probe_liveness(&mut self) -> impl Future<Output = bool> + Send;

    fn close(self) -> impl Future<Output = Result<()>> + Send
    where
        Self: Sized;
}
