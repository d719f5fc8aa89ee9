//! Driver and connection contracts.
//!
//! - [`Connection`] - executes abstract statements and manages one
//!   transaction with savepoints
//! - [`Driver`] - opens new connections
//!
//! All operations integrate with asupersync's structured concurrency via `Cx`
//! for cancellation handling.

use crate::error::Error;
use crate::row::Row;
use crate::statement::{ExecResult, FetchRequest, Statement};
use asupersync::{Cx, Outcome};

/// A live connection to a data store.
///
/// Implementations must be `Send + Sync` for use across async boundaries.
/// A connection carries at most one open transaction; nesting is expressed
/// through savepoints.
///
/// # Example
///
/// ```rust,ignore
/// conn.begin(&cx).await?;
/// conn.savepoint(&cx, "sp_1").await?;
/// conn.execute(&cx, &statement).await?;
/// conn.rollback_to_savepoint(&cx, "sp_1").await?;
/// conn.commit(&cx).await?;
/// ```
pub trait Connection: Send + Sync {
    /// Execute a write statement.
    ///
    /// For inserts with a `returning` list, `ExecResult::returned` must hold
    /// one entry per row in statement row order.
    fn execute(
        &self,
        cx: &Cx,
        statement: &Statement,
    ) -> impl Future<Output = Outcome<ExecResult, Error>> + Send;

    /// Fetch all columns of the matching rows.
    fn fetch(
        &self,
        cx: &Cx,
        request: &FetchRequest,
    ) -> impl Future<Output = Outcome<Vec<Row>, Error>> + Send;

    /// Begin a transaction.
    fn begin(&self, cx: &Cx) -> impl Future<Output = Outcome<(), Error>> + Send;

    /// Commit the open transaction.
    fn commit(&self, cx: &Cx) -> impl Future<Output = Outcome<(), Error>> + Send;

    /// Roll back the open transaction.
    fn rollback(&self, cx: &Cx) -> impl Future<Output = Outcome<(), Error>> + Send;

    /// Create a named savepoint inside the open transaction.
    fn savepoint(&self, cx: &Cx, name: &str) -> impl Future<Output = Outcome<(), Error>> + Send;

    /// Release a savepoint, keeping its work.
    fn release_savepoint(
        &self,
        cx: &Cx,
        name: &str,
    ) -> impl Future<Output = Outcome<(), Error>> + Send;

    /// Undo everything done since the savepoint was created.
    fn rollback_to_savepoint(
        &self,
        cx: &Cx,
        name: &str,
    ) -> impl Future<Output = Outcome<(), Error>> + Send;

    /// Check that the connection is still usable.
    fn ping(&self, cx: &Cx) -> impl Future<Output = Outcome<(), Error>> + Send;

    /// Is a transaction currently open?
    fn in_transaction(&self) -> bool;
}

/// Factory for connections.
pub trait Driver: Send + Sync + 'static {
    /// The connection type produced by this driver.
    type Conn: Connection + 'static;

    /// Open a new connection.
    fn connect(&self, cx: &Cx) -> impl Future<Output = Outcome<Self::Conn, Error>> + Send;

    /// Short driver name for logs.
    fn name(&self) -> &'static str;
}
