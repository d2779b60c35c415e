use anyhow::{anyhow, Result};
use migrator_core::Entity;
use migrator_store_sqlite::{
    now_millis, ConnPool, SqlRow, SqlValue, SqlitePool, TableEntity, Transaction, TxBehavior,
};
use serde::{Deserialize, Serialize};

const CREATE_INTERACTIVES_SQL: &str = r"
CREATE TABLE IF NOT EXISTS interactives (
  id INTEGER PRIMARY KEY,
  biz TEXT NOT NULL,
  biz_id INTEGER NOT NULL,
  read_cnt INTEGER NOT NULL DEFAULT 0,
  like_cnt INTEGER NOT NULL DEFAULT 0,
  collect_cnt INTEGER NOT NULL DEFAULT 0,
  ctime INTEGER NOT NULL,
  utime INTEGER NOT NULL
);

CREATE UNIQUE INDEX IF NOT EXISTS idx_interactives_biz ON interactives(biz_id, biz);
CREATE INDEX IF NOT EXISTS idx_interactives_utime ON interactives(utime);
";

const INSERT_INTERACTIVE_SQL: &str = r"INSERT INTO interactives(
  id, biz, biz_id, read_cnt, like_cnt, collect_cnt, ctime, utime
) VALUES (?1, ?2, ?3, 1, 0, 0, ?4, ?4)";

/// Read/like/collect counters of one business object.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Interactive {
    pub id: i64,
    pub biz: String,
    pub biz_id: i64,
    pub read_cnt: i64,
    pub like_cnt: i64,
    pub collect_cnt: i64,
    pub ctime: i64,
    pub utime: i64,
}

impl Entity for Interactive {
    fn id(&self) -> i64 {
        self.id
    }

    fn compare_to(&self, other: &Self) -> bool {
        self == other
    }
}

impl TableEntity for Interactive {
    const TABLE: &'static str = "interactives";
    const COLUMNS: &'static [&'static str] =
        &["id", "biz", "biz_id", "read_cnt", "like_cnt", "collect_cnt", "ctime", "utime"];

    fn from_row(row: &SqlRow) -> Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            biz: row.get(1)?,
            biz_id: row.get(2)?,
            read_cnt: row.get(3)?,
            like_cnt: row.get(4)?,
            collect_cnt: row.get(5)?,
            ctime: row.get(6)?,
            utime: row.get(7)?,
        })
    }

    fn to_values(&self) -> Vec<SqlValue> {
        vec![
            SqlValue::Integer(self.id),
            SqlValue::Text(self.biz.clone()),
            SqlValue::Integer(self.biz_id),
            SqlValue::Integer(self.read_cnt),
            SqlValue::Integer(self.like_cnt),
            SqlValue::Integer(self.collect_cnt),
            SqlValue::Integer(self.ctime),
            SqlValue::Integer(self.utime),
        ]
    }
}

/// # Errors
/// Returns an error when the table or its indexes cannot be created.
pub fn ensure_schema(pool: &SqlitePool) -> Result<()> {
    pool.execute_batch(CREATE_INTERACTIVES_SQL)
}

/// # Errors
/// Returns an error when the query fails or the row cannot be decoded.
pub fn find_by_biz<C: ConnPool + ?Sized>(
    pool: &C,
    biz: &str,
    biz_id: i64,
) -> Result<Option<Interactive>> {
    let sql = format!(
        "SELECT {} FROM interactives WHERE biz = ?1 AND biz_id = ?2",
        Interactive::COLUMNS.join(", ")
    );
    pool.query_row(&sql, &[SqlValue::Text(biz.to_string()), SqlValue::Integer(biz_id)])?
        .map(|row| Interactive::from_row(&row))
        .transpose()
}

/// Count one read of `biz`/`biz_id`, creating the counters on first read.
///
/// New rows get an explicit id so every store written through a double write pool
/// ends up with the same primary key.
///
/// # Errors
/// Returns an error when the transaction fails on the authoritative store.
pub fn incr_read_cnt<C: ConnPool + ?Sized>(
    pool: &C,
    biz: &str,
    biz_id: i64,
) -> Result<Interactive> {
    let now = now_millis();
    let key = [SqlValue::Text(biz.to_string()), SqlValue::Integer(biz_id)];
    let mut tx = pool.begin_tx(TxBehavior::Immediate)?;

    match tx.query_row("SELECT id FROM interactives WHERE biz = ?1 AND biz_id = ?2", &key)? {
        Some(row) => {
            let id: i64 = row.get(0)?;
            tx.exec(
                "UPDATE interactives SET read_cnt = read_cnt + 1, utime = ?2 WHERE id = ?1",
                &[SqlValue::Integer(id), SqlValue::Integer(now)],
            )?;
        }
        None => {
            let id: i64 = tx
                .query_row("SELECT COALESCE(MAX(id), 0) + 1 FROM interactives", &[])?
                .map_or(Ok(1), |row| row.get(0))?;
            tx.exec(
                INSERT_INTERACTIVE_SQL,
                &[
                    SqlValue::Integer(id),
                    SqlValue::Text(biz.to_string()),
                    SqlValue::Integer(biz_id),
                    SqlValue::Integer(now),
                ],
            )?;
        }
    }
    tx.commit()?;

    find_by_biz(pool, biz, biz_id)?
        .ok_or_else(|| anyhow!("interactive {biz}/{biz_id} vanished after write"))
}
