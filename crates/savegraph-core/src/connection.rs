//! Database connection trait.
//!
//! [`Connection`] is the executor the save engine issues statements
//! through. It is always borrowed inside a transaction the caller owns;
//! the engine never begins, commits or rolls back.
//!
//! All operations integrate with asupersync's structured concurrency via `Cx` context
//! for proper cancellation and timeout handling.

use crate::row::Row;
use crate::value::Value;
use asupersync::{Cx, Outcome};

/// A database connection capable of executing queries.
///
/// All operations are async and take a `Cx` context for cancellation/timeout support.
/// Implementations must be `Send + Sync` for use across async boundaries.
///
/// # Example
///
/// ```rust,ignore
/// let rows = conn.query(&cx, "SELECT \"id\" FROM \"book\" WHERE \"id\" IN ($1)", &[Value::BigInt(1)]).await?;
/// let n = conn.execute(&cx, "DELETE FROM \"book\" WHERE \"id\" IN ($1)", &[Value::BigInt(1)]).await?;
/// ```
pub trait Connection: Send + Sync {
    /// Execute a query and return all rows.
    ///
    /// Also used for `INSERT ... RETURNING`, which yields one row per
    /// inserted tuple in VALUES order.
    fn query(
        &self,
        cx: &Cx,
        sql: &str,
        params: &[Value],
    ) -> impl Future<Output = Outcome<Vec<Row>, crate::Error>> + Send;

    /// Execute a statement (INSERT, UPDATE, DELETE) and return rows affected.
    fn execute(
        &self,
        cx: &Cx,
        sql: &str,
        params: &[Value],
    ) -> impl Future<Output = Outcome<u64, crate::Error>> + Send;

    /// Execute multiple statements in a batch.
    ///
    /// Returns the number of rows affected by each statement, in order.
    /// The statements are executed sequentially but may be optimized
    /// by the driver for better performance.
    fn batch(
        &self,
        cx: &Cx,
        statements: &[(String, Vec<Value>)],
    ) -> impl Future<Output = Outcome<Vec<u64>, crate::Error>> + Send;
}
