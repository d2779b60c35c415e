use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::types::Value;

use crate::{collect_rows, ConnPool, PreparedStatement, SqlRow, Transaction, TxBehavior};

/// A connection checked out of a [`SqlitePool`]; returned to the pool on drop.
pub type PooledConnection = r2d2::PooledConnection<SqliteConnectionManager>;

const CONNECTION_PRAGMAS_SQL: &str = r"
PRAGMA journal_mode = WAL;
PRAGMA foreign_keys = ON;
";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolConfig {
    /// Upper bound on open connections; `acquire` waits once it is reached.
    pub max_size: u32,
    pub min_idle: u32,
    /// How long `acquire` waits for a free connection before failing.
    pub connection_timeout: Duration,
    pub busy_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_size: 8,
            min_idle: 1,
            connection_timeout: Duration::from_secs(5),
            busy_timeout: Duration::from_millis(5000),
        }
    }
}

/// Bounded pool of `SQLite` connections to one database file.
#[derive(Clone)]
pub struct SqlitePool {
    pool: r2d2::Pool<SqliteConnectionManager>,
    path: PathBuf,
}

impl std::fmt::Debug for SqlitePool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqlitePool")
            .field("path", &self.path)
            .field("state", &self.pool.state())
            .finish()
    }
}

fn manager(path: &Path, busy_timeout: Duration) -> SqliteConnectionManager {
    SqliteConnectionManager::file(path).with_init(move |conn| {
        conn.execute_batch(CONNECTION_PRAGMAS_SQL)?;
        conn.busy_timeout(busy_timeout)
    })
}

fn builder(config: &PoolConfig) -> r2d2::Builder<SqliteConnectionManager> {
    r2d2::Pool::builder()
        .max_size(config.max_size.max(1))
        .min_idle(Some(config.min_idle.min(config.max_size)))
        .connection_timeout(config.connection_timeout)
}

impl SqlitePool {
    /// Create a pool without touching the database; connections open on first use.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>, config: &PoolConfig) -> Self {
        let path = path.into();
        let pool = builder(config).build_unchecked(manager(&path, config.busy_timeout));
        Self { pool, path }
    }

    /// Create a pool with default settings and open its first connection.
    ///
    /// # Errors
    /// Returns an error when the database cannot be opened or pragmas cannot be applied.
    pub fn open(path: &Path) -> Result<Self> {
        Self::open_with(path, &PoolConfig::default())
    }

    /// # Errors
    /// Returns an error when the database cannot be opened or pragmas cannot be applied.
    pub fn open_with(path: &Path, config: &PoolConfig) -> Result<Self> {
        let pool = builder(config)
            .build(manager(path, config.busy_timeout))
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;
        Ok(Self { pool, path: path.to_path_buf() })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Connections currently open, idle or checked out.
    #[must_use]
    pub fn connections(&self) -> u32 {
        self.pool.state().connections
    }

    #[must_use]
    pub fn idle_connections(&self) -> u32 {
        self.pool.state().idle_connections
    }

    /// Run a `;`-separated batch of statements, such as schema setup, on one connection.
    ///
    /// # Errors
    /// Returns an error when no connection is available or a statement fails.
    pub fn execute_batch(&self, sql: &str) -> Result<()> {
        self.acquire()?
            .execute_batch(sql)
            .with_context(|| format!("failed to execute batch on {}", self.path.display()))
    }

    /// Check out a connection, waiting up to the connection timeout when the pool is exhausted.
    ///
    /// # Errors
    /// Returns an error when no connection becomes available or a new one cannot be opened.
    pub fn acquire(&self) -> Result<PooledConnection> {
        self.pool
            .get()
            .with_context(|| format!("no sqlite connection available for {}", self.path.display()))
    }
}

impl ConnPool for SqlitePool {
    type Tx = SqliteTx;
    type Stmt = SqliteStatement;

    fn prepare(&self, sql: &str) -> Result<SqliteStatement> {
        SqliteStatement::new(self.acquire()?, sql)
    }

    fn exec(&self, sql: &str, params: &[Value]) -> Result<usize> {
        let conn = self.acquire()?;
        conn.execute(sql, rusqlite::params_from_iter(params.iter()))
            .with_context(|| format!("failed to execute statement on {}", self.path.display()))
    }

    fn query(&self, sql: &str, params: &[Value]) -> Result<Vec<SqlRow>> {
        let conn = self.acquire()?;
        let mut stmt = conn.prepare_cached(sql).context("failed to prepare query")?;
        collect_rows(&mut stmt, params)
            .with_context(|| format!("failed to run query on {}", self.path.display()))
    }

    fn begin_tx(&self, behavior: TxBehavior) -> Result<SqliteTx> {
        let conn = self.acquire()?;
        conn.execute_batch(behavior.begin_sql())
            .with_context(|| format!("failed to begin transaction on {}", self.path.display()))?;
        Ok(SqliteTx { conn, finished: false })
    }
}

/// Transaction on one pooled connection. Dropped unfinished, it rolls back before the
/// connection goes back to the pool.
pub struct SqliteTx {
    conn: PooledConnection,
    finished: bool,
}

impl SqliteTx {
    fn finish(&mut self, sql: &str) -> Result<()> {
        self.conn.execute_batch(sql).with_context(|| format!("{sql} failed"))?;
        self.finished = true;
        Ok(())
    }
}

impl Transaction for SqliteTx {
    fn exec(&mut self, sql: &str, params: &[Value]) -> Result<usize> {
        self.conn
            .execute(sql, rusqlite::params_from_iter(params.iter()))
            .context("failed to execute statement in transaction")
    }

    fn query(&mut self, sql: &str, params: &[Value]) -> Result<Vec<SqlRow>> {
        let mut stmt = self.conn.prepare_cached(sql).context("failed to prepare query")?;
        collect_rows(&mut stmt, params).context("failed to run query in transaction")
    }

    fn commit(mut self) -> Result<()> {
        self.finish("COMMIT")
    }

    fn rollback(mut self) -> Result<()> {
        self.finish("ROLLBACK")
    }
}

impl Drop for SqliteTx {
    fn drop(&mut self) {
        if self.finished || self.conn.is_autocommit() {
            return;
        }
        if let Err(err) = self.conn.execute_batch("ROLLBACK") {
            tracing::warn!(error = %err, "failed to roll back abandoned transaction");
        }
    }
}

/// A statement validated at prepare time and bound to one pooled connection.
pub struct SqliteStatement {
    conn: PooledConnection,
    sql: String,
}

impl SqliteStatement {
    fn new(conn: PooledConnection, sql: &str) -> Result<Self> {
        conn.prepare_cached(sql).with_context(|| format!("failed to prepare statement: {sql}"))?;
        Ok(Self { conn, sql: sql.to_string() })
    }
}

impl PreparedStatement for SqliteStatement {
    fn exec(&mut self, params: &[Value]) -> Result<usize> {
        let mut stmt = self.conn.prepare_cached(&self.sql)?;
        stmt.execute(rusqlite::params_from_iter(params.iter()))
            .context("failed to execute prepared statement")
    }

    fn query(&mut self, params: &[Value]) -> Result<Vec<SqlRow>> {
        let mut stmt = self.conn.prepare_cached(&self.sql)?;
        collect_rows(&mut stmt, params).context("failed to run prepared query")
    }
}
