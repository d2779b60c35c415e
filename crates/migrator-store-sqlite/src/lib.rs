use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use rusqlite::types::{FromSql, Value, ValueRef};
use time::OffsetDateTime;

mod double_write;
mod pool;
pub mod table;

pub use double_write::{DoubleWritePool, DoubleWriteTx};
pub use pool::{PoolConfig, PooledConnection, SqlitePool, SqliteStatement, SqliteTx};
pub use table::TableEntity;

/// Owned SQL parameter; both stores of a double write replay the same values.
pub use rusqlite::types::Value as SqlValue;

/// Locking mode used when a transaction is opened.
#[derive(Debug, Clone, Copy, Default, Eq, PartialEq)]
pub enum TxBehavior {
    #[default]
    Deferred,
    Immediate,
    Exclusive,
}

impl TxBehavior {
    #[must_use]
    pub fn begin_sql(self) -> &'static str {
        match self {
            Self::Deferred => "BEGIN DEFERRED",
            Self::Immediate => "BEGIN IMMEDIATE",
            Self::Exclusive => "BEGIN EXCLUSIVE",
        }
    }
}

/// Minimal connection pool surface the data-access layer is written against.
///
/// Implemented by a single store ([`SqlitePool`]) and by [`DoubleWritePool`], so
/// code above it cannot tell whether it is writing to one store or two.
pub trait ConnPool: Send + Sync + 'static {
    type Tx: Transaction;
    type Stmt: PreparedStatement;

    /// Prepare a reusable statement.
    ///
    /// # Errors
    /// Returns an error when the statement is invalid or not supported by the pool.
    fn prepare(&self, sql: &str) -> Result<Self::Stmt>;

    /// Execute one statement and return the number of affected rows.
    ///
    /// # Errors
    /// Returns an error when the statement fails on the authoritative store.
    fn exec(&self, sql: &str, params: &[Value]) -> Result<usize>;

    /// Run a query and materialize every row.
    ///
    /// # Errors
    /// Returns an error when the query fails or a row cannot be read.
    fn query(&self, sql: &str, params: &[Value]) -> Result<Vec<SqlRow>>;

    /// Run a query and return its first row, if any.
    ///
    /// # Errors
    /// Returns an error when the query fails or the row cannot be read.
    fn query_row(&self, sql: &str, params: &[Value]) -> Result<Option<SqlRow>> {
        Ok(self.query(sql, params)?.into_iter().next())
    }

    /// Open a transaction.
    ///
    /// # Errors
    /// Returns an error when no connection is available or `BEGIN` fails.
    fn begin_tx(&self, behavior: TxBehavior) -> Result<Self::Tx>;
}

/// An open transaction. Dropping it without `commit` rolls it back.
pub trait Transaction: Send {
    /// # Errors
    /// Returns an error when the statement fails.
    fn exec(&mut self, sql: &str, params: &[Value]) -> Result<usize>;

    /// # Errors
    /// Returns an error when the query fails or a row cannot be read.
    fn query(&mut self, sql: &str, params: &[Value]) -> Result<Vec<SqlRow>>;

    /// # Errors
    /// Returns an error when the query fails or the row cannot be read.
    fn query_row(&mut self, sql: &str, params: &[Value]) -> Result<Option<SqlRow>> {
        Ok(self.query(sql, params)?.into_iter().next())
    }

    /// # Errors
    /// Returns an error when `COMMIT` fails.
    fn commit(self) -> Result<()>;

    /// # Errors
    /// Returns an error when `ROLLBACK` fails.
    fn rollback(self) -> Result<()>;
}

pub trait PreparedStatement: Send {
    /// # Errors
    /// Returns an error when the statement fails.
    fn exec(&mut self, params: &[Value]) -> Result<usize>;

    /// # Errors
    /// Returns an error when the query fails or a row cannot be read.
    fn query(&mut self, params: &[Value]) -> Result<Vec<SqlRow>>;
}

/// One materialized result row.
#[derive(Debug, Clone, PartialEq)]
pub struct SqlRow {
    columns: Arc<[String]>,
    values: Vec<Value>,
}

impl SqlRow {
    #[cfg(test)]
    fn new(columns: Arc<[String]>, values: Vec<Value>) -> Self {
        Self { columns, values }
    }

    /// Decode column `idx`.
    ///
    /// # Errors
    /// Returns an error when the index is out of range or the value has the wrong type.
    pub fn get<T: FromSql>(&self, idx: usize) -> Result<T> {
        let value = self.values.get(idx).ok_or_else(|| {
            anyhow!("column index {idx} out of range for row with {} columns", self.values.len())
        })?;
        let name = self.columns.get(idx).map_or("?", String::as_str);
        T::column_result(ValueRef::from(value))
            .with_context(|| format!("failed to decode column {name}"))
    }

    /// Decode the column called `name`.
    ///
    /// # Errors
    /// Returns an error when no such column exists or the value has the wrong type.
    pub fn get_named<T: FromSql>(&self, name: &str) -> Result<T> {
        let idx = self
            .columns
            .iter()
            .position(|column| column == name)
            .ok_or_else(|| anyhow!("row has no column named {name}"))?;
        self.get(idx)
    }
}

pub(crate) fn collect_rows(
    stmt: &mut rusqlite::Statement<'_>,
    params: &[Value],
) -> Result<Vec<SqlRow>> {
    let columns: Arc<[String]> =
        stmt.column_names().into_iter().map(str::to_string).collect::<Vec<_>>().into();
    let width = columns.len();
    let mut rows = stmt.query(rusqlite::params_from_iter(params.iter()))?;
    let mut out = Vec::new();

    while let Some(row) = rows.next()? {
        let mut values = Vec::with_capacity(width);
        for idx in 0..width {
            values.push(row.get::<_, Value>(idx)?);
        }
        out.push(SqlRow { columns: Arc::clone(&columns), values });
    }

    Ok(out)
}

/// Current wall clock in unix milliseconds, the unit `utime`/`ctime` columns use.
#[must_use]
pub fn now_millis() -> i64 {
    i64::try_from(OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000).unwrap_or(i64::MAX)
}

/// Current wall clock formatted as RFC 3339.
///
/// # Errors
/// Returns an error when the timestamp cannot be formatted.
pub fn now_rfc3339() -> Result<String> {
    OffsetDateTime::now_utc()
        .format(&time::format_description::well_known::Rfc3339)
        .context("failed to format RFC3339 timestamp")
}
