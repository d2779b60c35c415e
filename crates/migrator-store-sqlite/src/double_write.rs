use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use anyhow::Result;
use migrator_core::{MigratorError, Pattern, Side};
use rusqlite::types::Value;

use crate::{ConnPool, SqlRow, Transaction, TxBehavior};

/// Connection pool that routes every statement according to the active [`Pattern`].
///
/// Writes go to the primary store and, for the `*_first` patterns, are then
/// replayed on the secondary store. Secondary failures are logged and never
/// reach the caller. Reads only ever hit the primary.
#[derive(Debug)]
pub struct DoubleWritePool<P> {
    src: Arc<P>,
    dst: Arc<P>,
    pattern: AtomicU8,
}

impl<P: ConnPool> DoubleWritePool<P> {
    /// Build a pool that starts in [`Pattern::SrcOnly`].
    #[must_use]
    pub fn new(src: Arc<P>, dst: Arc<P>) -> Self {
        Self::with_pattern(src, dst, Pattern::SrcOnly)
    }

    #[must_use]
    pub fn with_pattern(src: Arc<P>, dst: Arc<P>, pattern: Pattern) -> Self {
        Self { src, dst, pattern: AtomicU8::new(pattern.as_u8()) }
    }

    /// Switch the active pattern. In-flight transactions keep the pattern they were opened with.
    pub fn update_pattern(&self, pattern: Pattern) {
        self.pattern.store(pattern.as_u8(), Ordering::SeqCst);
        tracing::info!(pattern = %pattern, "double write pattern updated");
    }

    /// The pattern new statements and transactions are routed by.
    ///
    /// # Errors
    /// Returns [`MigratorError::UnknownPattern`] when the stored value is not a known pattern.
    pub fn pattern(&self) -> Result<Pattern> {
        let raw = self.pattern.load(Ordering::SeqCst);
        Pattern::from_u8(raw).ok_or_else(|| MigratorError::UnknownPattern(raw.to_string()).into())
    }

    #[must_use]
    pub fn store(&self, side: Side) -> &Arc<P> {
        match side {
            Side::Src => &self.src,
            Side::Dst => &self.dst,
        }
    }
}

impl<P: ConnPool> ConnPool for DoubleWritePool<P> {
    type Tx = DoubleWriteTx<P::Tx>;
    type Stmt = P::Stmt;

    fn prepare(&self, sql: &str) -> Result<P::Stmt> {
        tracing::error!(sql, "prepared statements are not supported by the double write pool");
        Err(MigratorError::Unsupported(
            "prepared statements cannot be routed to two stores".to_string(),
        )
        .into())
    }

    fn exec(&self, sql: &str, params: &[Value]) -> Result<usize> {
        let pattern = self.pattern()?;
        let affected = self.store(pattern.primary()).exec(sql, params)?;

        if let Some(side) = pattern.secondary() {
            if let Err(err) = self.store(side).exec(sql, params) {
                tracing::error!(
                    pattern = %pattern,
                    side = %side,
                    sql,
                    error = format!("{err:#}"),
                    "double write to secondary store failed"
                );
            }
        }

        Ok(affected)
    }

    fn query(&self, sql: &str, params: &[Value]) -> Result<Vec<SqlRow>> {
        let pattern = self.pattern()?;
        self.store(pattern.primary()).query(sql, params)
    }

    fn query_row(&self, sql: &str, params: &[Value]) -> Result<Option<SqlRow>> {
        let pattern = self.pattern()?;
        self.store(pattern.primary()).query_row(sql, params)
    }

    fn begin_tx(&self, behavior: TxBehavior) -> Result<DoubleWriteTx<P::Tx>> {
        let pattern = self.pattern()?;
        let primary = self.store(pattern.primary()).begin_tx(behavior)?;

        let secondary = match pattern.secondary() {
            Some(side) => match self.store(side).begin_tx(behavior) {
                Ok(tx) => Some(tx),
                Err(err) => {
                    tracing::error!(
                        pattern = %pattern,
                        side = %side,
                        error = format!("{err:#}"),
                        "failed to begin transaction on secondary store"
                    );
                    None
                }
            },
            None => None,
        };

        Ok(DoubleWriteTx { pattern, primary, secondary })
    }
}

/// Transaction spanning the primary store and, when available, the secondary one.
///
/// The pattern is fixed when the transaction is opened.
#[derive(Debug)]
pub struct DoubleWriteTx<T> {
    pattern: Pattern,
    primary: T,
    secondary: Option<T>,
}

impl<T> DoubleWriteTx<T> {
    #[must_use]
    pub fn pattern(&self) -> Pattern {
        self.pattern
    }

    #[must_use]
    pub fn has_secondary(&self) -> bool {
        self.secondary.is_some()
    }
}

impl<T: Transaction> Transaction for DoubleWriteTx<T> {
    fn exec(&mut self, sql: &str, params: &[Value]) -> Result<usize> {
        let affected = self.primary.exec(sql, params)?;

        if let Some(secondary) = self.secondary.as_mut() {
            if let Err(err) = secondary.exec(sql, params) {
                tracing::error!(
                    pattern = %self.pattern,
                    sql,
                    error = format!("{err:#}"),
                    "double write to secondary transaction failed"
                );
            }
        }

        Ok(affected)
    }

    fn query(&mut self, sql: &str, params: &[Value]) -> Result<Vec<SqlRow>> {
        self.primary.query(sql, params)
    }

    /// Commit the primary, then the secondary on a best-effort basis.
    ///
    /// When the primary commit fails the secondary is never committed: it is dropped
    /// unfinished and rolls itself back.
    fn commit(self) -> Result<()> {
        self.primary.commit()?;

        if let Some(secondary) = self.secondary {
            if let Err(err) = secondary.commit() {
                tracing::error!(
                    pattern = %self.pattern,
                    error = format!("{err:#}"),
                    "failed to commit secondary transaction"
                );
            }
        }

        Ok(())
    }

    fn rollback(self) -> Result<()> {
        self.primary.rollback()?;

        if let Some(secondary) = self.secondary {
            if let Err(err) = secondary.rollback() {
                tracing::error!(
                    pattern = %self.pattern,
                    error = format!("{err:#}"),
                    "failed to roll back secondary transaction"
                );
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use anyhow::anyhow;

    use super::*;
    use crate::testing::{unreachable_pool, TempDb};
    use crate::{PreparedStatement, SqlitePool};

    const CREATE_ARTICLES_SQL: &str =
        "CREATE TABLE IF NOT EXISTS articles (id INTEGER PRIMARY KEY, title TEXT NOT NULL)";
    const INSERT_ARTICLE_SQL: &str = "INSERT INTO articles(id, title) VALUES (?1, ?2)";

    fn articles(db: &TempDb, name: &str) -> Result<Arc<SqlitePool>> {
        let pool = SqlitePool::open(&db.path(name))?;
        pool.exec(CREATE_ARTICLES_SQL, &[])?;
        Ok(Arc::new(pool))
    }

    fn pair() -> Result<(TempDb, Arc<SqlitePool>, Arc<SqlitePool>)> {
        let db = TempDb::new()?;
        let (src, dst) = (articles(&db, "src.sqlite3")?, articles(&db, "dst.sqlite3")?);
        Ok((db, src, dst))
    }

    fn article(id: i64, title: &str) -> [Value; 2] {
        [Value::Integer(id), Value::Text(title.to_string())]
    }

    fn titles(pool: &SqlitePool) -> Result<Vec<(i64, String)>> {
        pool.query("SELECT id, title FROM articles ORDER BY id", &[])?
            .iter()
            .map(|row| -> Result<(i64, String)> { Ok((row.get(0)?, row.get(1)?)) })
            .collect()
    }

    #[test]
    fn writes_follow_the_most_recent_pattern() -> Result<()> {
        let (_db, src, dst) = pair()?;
        let pool = DoubleWritePool::new(Arc::clone(&src), Arc::clone(&dst));

        pool.exec(INSERT_ARTICLE_SQL, &article(1, "src only"))?;
        pool.update_pattern(Pattern::DstOnly);
        pool.update_pattern(Pattern::SrcFirst);
        pool.exec(INSERT_ARTICLE_SQL, &article(2, "src first"))?;
        pool.update_pattern(Pattern::DstFirst);
        pool.exec(INSERT_ARTICLE_SQL, &article(3, "dst first"))?;
        pool.update_pattern(Pattern::DstOnly);
        pool.exec(INSERT_ARTICLE_SQL, &article(4, "dst only"))?;

        let src_ids: Vec<i64> = titles(&src)?.into_iter().map(|(id, _)| id).collect();
        let dst_ids: Vec<i64> = titles(&dst)?.into_iter().map(|(id, _)| id).collect();
        assert_eq!(src_ids, vec![1, 2, 3]);
        assert_eq!(dst_ids, vec![2, 3, 4]);
        assert_eq!(pool.pattern()?, Pattern::DstOnly);
        Ok(())
    }

    #[test]
    fn reads_only_hit_the_primary_store() -> Result<()> {
        let (_db, src, dst) = pair()?;
        dst.exec(INSERT_ARTICLE_SQL, &article(9, "only in dst"))?;

        let pool = DoubleWritePool::with_pattern(src, dst, Pattern::SrcFirst);
        let sql = "SELECT id, title FROM articles WHERE id = ?1";
        assert!(pool.query_row(sql, &[Value::Integer(9)])?.is_none());

        pool.update_pattern(Pattern::DstFirst);
        let row = pool.query_row(sql, &[Value::Integer(9)])?;
        let title = row.map(|row| row.get::<String>(1)).transpose()?;
        assert_eq!(title.as_deref(), Some("only in dst"));
        Ok(())
    }

    #[test]
    fn unreachable_secondary_does_not_fail_primary_writes() -> Result<()> {
        let db = TempDb::new()?;
        let src = articles(&db, "src.sqlite3")?;
        let pool =
            DoubleWritePool::with_pattern(Arc::clone(&src), unreachable_pool(), Pattern::SrcFirst);

        assert_eq!(pool.exec(INSERT_ARTICLE_SQL, &article(1, "a"))?, 1);

        let mut tx = pool.begin_tx(TxBehavior::Immediate)?;
        assert!(!tx.has_secondary());
        tx.exec(INSERT_ARTICLE_SQL, &article(2, "b"))?;
        tx.commit()?;

        assert_eq!(titles(&src)?.len(), 2);
        Ok(())
    }

    #[test]
    fn unreachable_primary_fails_the_caller() -> Result<()> {
        let db = TempDb::new()?;
        let dst = articles(&db, "dst.sqlite3")?;
        let pool = DoubleWritePool::with_pattern(unreachable_pool(), dst, Pattern::SrcFirst);

        assert!(pool.exec(INSERT_ARTICLE_SQL, &article(1, "a")).is_err());
        assert!(pool.begin_tx(TxBehavior::Deferred).is_err());

        pool.update_pattern(Pattern::DstOnly);
        assert_eq!(pool.exec(INSERT_ARTICLE_SQL, &article(1, "a"))?, 1);
        Ok(())
    }

    #[test]
    fn transactions_keep_the_pattern_they_were_opened_with() -> Result<()> {
        let (_db, src, dst) = pair()?;
        let pool =
            DoubleWritePool::with_pattern(Arc::clone(&src), Arc::clone(&dst), Pattern::SrcFirst);

        let mut tx = pool.begin_tx(TxBehavior::Deferred)?;
        pool.update_pattern(Pattern::DstOnly);
        tx.exec(INSERT_ARTICLE_SQL, &article(5, "in flight"))?;
        assert_eq!(tx.pattern(), Pattern::SrcFirst);
        tx.commit()?;

        assert_eq!(titles(&src)?, vec![(5, "in flight".to_string())]);
        assert_eq!(titles(&dst)?, vec![(5, "in flight".to_string())]);
        Ok(())
    }

    #[test]
    fn rollback_discards_both_sides() -> Result<()> {
        let (_db, src, dst) = pair()?;
        let pool =
            DoubleWritePool::with_pattern(Arc::clone(&src), Arc::clone(&dst), Pattern::DstFirst);

        let mut tx = pool.begin_tx(TxBehavior::Deferred)?;
        tx.exec(INSERT_ARTICLE_SQL, &article(1, "discarded"))?;
        assert_eq!(tx.query("SELECT id FROM articles", &[])?.len(), 1);
        tx.rollback()?;

        assert!(titles(&src)?.is_empty());
        assert!(titles(&dst)?.is_empty());
        Ok(())
    }

    #[test]
    fn unfinished_double_write_transaction_rolls_back_both_sides() -> Result<()> {
        let (_db, src, dst) = pair()?;
        let pool =
            DoubleWritePool::with_pattern(Arc::clone(&src), Arc::clone(&dst), Pattern::SrcFirst);
        {
            let mut tx = pool.begin_tx(TxBehavior::Immediate)?;
            assert!(tx.has_secondary());
            tx.exec(INSERT_ARTICLE_SQL, &article(1, "never committed"))?;
        }

        assert!(titles(&src)?.is_empty());
        assert!(titles(&dst)?.is_empty());
        assert_eq!(pool.exec(INSERT_ARTICLE_SQL, &article(2, "after"))?, 1);
        assert_eq!(titles(&dst)?, vec![(2, "after".to_string())]);
        Ok(())
    }

    #[test]
    fn dropped_transaction_is_rolled_back() -> Result<()> {
        let db = TempDb::new()?;
        let src = articles(&db, "src.sqlite3")?;
        {
            let mut tx = src.begin_tx(TxBehavior::Deferred)?;
            tx.exec(INSERT_ARTICLE_SQL, &article(1, "abandoned"))?;
        }
        assert!(titles(&src)?.is_empty());
        assert!(src.idle_connections() >= 1);
        Ok(())
    }

    #[test]
    fn prepare_is_rejected_in_double_write_mode() -> Result<()> {
        let (_db, src, dst) = pair()?;

        let mut stmt = src.prepare(INSERT_ARTICLE_SQL)?;
        assert_eq!(stmt.exec(&article(1, "prepared"))?, 1);

        let pool = DoubleWritePool::new(src, dst);
        let Err(err) = pool.prepare(INSERT_ARTICLE_SQL) else {
            return Err(anyhow!("expected prepare to be rejected"));
        };
        assert!(matches!(err.downcast_ref::<MigratorError>(), Some(MigratorError::Unsupported(_))));
        Ok(())
    }
}
