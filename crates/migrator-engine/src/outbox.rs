use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use migrator_core::{Direction, InconsistencyType, InconsistentEvent};
use migrator_store_sqlite::{now_millis, now_rfc3339, ConnPool, SqlRow, SqlValue, SqlitePool};

use crate::events::{Delivery, EventSource, Producer};
use crate::metrics;
use crate::run_blocking;

const CREATE_OUTBOX_SQL: &str = r"
CREATE TABLE IF NOT EXISTS migrator_outbox (
  seq INTEGER PRIMARY KEY AUTOINCREMENT,
  topic TEXT NOT NULL,
  entity_id INTEGER NOT NULL,
  direction TEXT NOT NULL,
  kind TEXT NOT NULL,
  attempts INTEGER NOT NULL DEFAULT 0,
  available_at INTEGER NOT NULL,
  created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_migrator_outbox_due ON migrator_outbox(topic, available_at, seq);
";

const INSERT_EVENT_SQL: &str = r"INSERT INTO migrator_outbox(
  topic, entity_id, direction, kind, attempts, available_at, created_at
) VALUES (?1, ?2, ?3, ?4, 0, ?5, ?6)";

const NEXT_DUE_SQL: &str = r"SELECT seq, entity_id, direction, kind, attempts
FROM migrator_outbox
WHERE topic = ?1 AND available_at <= ?2
ORDER BY available_at, seq
LIMIT 1";

const POSTPONE_SQL: &str = r"UPDATE migrator_outbox
SET attempts = attempts + 1, available_at = ?2
WHERE seq = ?1";

/// Durable event channel stored in a `SQLite` table, one logical topic per instance.
///
/// Events stay in the table until acknowledged, so they survive restarts.
#[derive(Debug, Clone)]
pub struct SqliteOutbox {
    pool: Arc<SqlitePool>,
    topic: String,
}

impl SqliteOutbox {
    /// Open the outbox, creating its table when missing.
    ///
    /// # Errors
    /// Returns an error when the table cannot be created.
    pub fn open(pool: Arc<SqlitePool>, topic: impl Into<String>) -> Result<Self> {
        pool.execute_batch(CREATE_OUTBOX_SQL).context("failed to create outbox table")?;
        Ok(Self { pool, topic: topic.into() })
    }

    #[must_use]
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// A source that polls for due events every `poll_interval` while the topic is empty.
    #[must_use]
    pub fn source(&self, poll_interval: Duration) -> OutboxSource {
        OutboxSource { outbox: self.clone(), poll_interval }
    }

    /// Events of this topic not yet acknowledged, due or not.
    ///
    /// # Errors
    /// Returns an error when the table cannot be read.
    pub fn pending(&self) -> Result<i64> {
        let row = self.pool.query_row(
            "SELECT COUNT(*) FROM migrator_outbox WHERE topic = ?1",
            &[SqlValue::Text(self.topic.clone())],
        )?;
        row.map_or(Ok(0), |row| row.get(0))
    }

    fn insert(&self, event: InconsistentEvent) -> Result<()> {
        self.pool
            .exec(
                INSERT_EVENT_SQL,
                &[
                    SqlValue::Text(self.topic.clone()),
                    SqlValue::Integer(event.id),
                    SqlValue::Text(event.direction.as_str().to_string()),
                    SqlValue::Text(event.kind.as_str().to_string()),
                    SqlValue::Integer(now_millis()),
                    SqlValue::Text(now_rfc3339()?),
                ],
            )
            .with_context(|| format!("failed to enqueue inconsistency for id {}", event.id))?;
        Ok(())
    }

    fn next_due(&self) -> Result<Option<Delivery>> {
        loop {
            let Some(row) = self.pool.query_row(
                NEXT_DUE_SQL,
                &[SqlValue::Text(self.topic.clone()), SqlValue::Integer(now_millis())],
            )?
            else {
                return Ok(None);
            };

            match decode_delivery(&row) {
                Ok(delivery) => return Ok(Some(delivery)),
                Err(err) => {
                    let seq: i64 = row.get(0)?;
                    tracing::error!(
                        topic = %self.topic,
                        seq,
                        error = format!("{err:#}"),
                        "dropping undecodable outbox event"
                    );
                    metrics::record_outbox_dropped(&self.topic);
                    self.delete(seq)?;
                }
            }
        }
    }

    fn delete(&self, seq: i64) -> Result<()> {
        self.pool
            .exec("DELETE FROM migrator_outbox WHERE seq = ?1", &[SqlValue::Integer(seq)])
            .with_context(|| format!("failed to delete outbox event {seq}"))?;
        Ok(())
    }

    fn postpone(&self, seq: i64, delay: Duration) -> Result<()> {
        let delay_ms = i64::try_from(delay.as_millis()).unwrap_or(i64::MAX);
        self.pool
            .exec(
                POSTPONE_SQL,
                &[SqlValue::Integer(seq), SqlValue::Integer(now_millis().saturating_add(delay_ms))],
            )
            .with_context(|| format!("failed to postpone outbox event {seq}"))?;
        Ok(())
    }
}

fn decode_delivery(row: &SqlRow) -> Result<Delivery> {
    let direction: String = row.get(2)?;
    let kind: String = row.get(3)?;
    let attempts: i64 = row.get(4)?;

    let direction = Direction::parse(&direction)
        .ok_or_else(|| anyhow!("unknown direction {direction}"))?;
    let kind = InconsistencyType::parse(&kind)
        .ok_or_else(|| anyhow!("unknown inconsistency type {kind}"))?;

    Ok(Delivery {
        seq: row.get(0)?,
        event: InconsistentEvent::new(row.get(1)?, direction, kind),
        attempt: u32::try_from(attempts).unwrap_or(u32::MAX),
    })
}

#[async_trait]
impl Producer for SqliteOutbox {
    async fn produce_inconsistent_event(&self, event: InconsistentEvent) -> Result<()> {
        let outbox = self.clone();
        run_blocking(move || outbox.insert(event)).await?
    }
}

/// Consumer side of a [`SqliteOutbox`]. Never reports the channel as closed.
#[derive(Debug, Clone)]
pub struct OutboxSource {
    outbox: SqliteOutbox,
    poll_interval: Duration,
}

#[async_trait]
impl EventSource for OutboxSource {
    async fn next(&mut self) -> Result<Option<Delivery>> {
        loop {
            let outbox = self.outbox.clone();
            if let Some(delivery) = run_blocking(move || outbox.next_due()).await?? {
                return Ok(Some(delivery));
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    async fn ack(&mut self, delivery: &Delivery) -> Result<()> {
        let outbox = self.outbox.clone();
        let seq = delivery.seq;
        run_blocking(move || outbox.delete(seq)).await?
    }

    async fn retry_later(&mut self, delivery: &Delivery, delay: Duration) -> Result<()> {
        let outbox = self.outbox.clone();
        let seq = delivery.seq;
        run_blocking(move || outbox.postpone(seq, delay)).await?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::TempDb;

    fn outbox(db: &TempDb, topic: &str) -> Result<SqliteOutbox> {
        SqliteOutbox::open(Arc::new(SqlitePool::open(db.path())?), topic)
    }

    #[tokio::test]
    async fn events_survive_reopen_until_acknowledged() -> Result<()> {
        let db = TempDb::new("outbox")?;
        let event = InconsistentEvent::new(3, Direction::Dst, InconsistencyType::BaseMissing);
        outbox(&db, "interactive")?.produce_inconsistent_event(event).await?;

        let reopened = outbox(&db, "interactive")?;
        assert_eq!(reopened.pending()?, 1);

        let mut source = reopened.source(Duration::from_millis(5));
        let Some(delivery) = source.next().await? else {
            panic!("expected an outbox delivery");
        };
        assert_eq!(delivery.event, event);
        assert_eq!(delivery.attempt, 0);

        source.ack(&delivery).await?;
        assert_eq!(reopened.pending()?, 0);
        Ok(())
    }

    #[tokio::test]
    async fn retried_events_come_back_with_attempt_count() -> Result<()> {
        let db = TempDb::new("outbox")?;
        let outbox = outbox(&db, "interactive")?;
        let event = InconsistentEvent::new(8, Direction::Src, InconsistencyType::TargetMissing);
        outbox.produce_inconsistent_event(event).await?;

        let mut source = outbox.source(Duration::from_millis(5));
        let Some(first) = source.next().await? else {
            panic!("expected an outbox delivery");
        };
        source.retry_later(&first, Duration::from_millis(30)).await?;

        let Some(second) = source.next().await? else {
            panic!("expected a redelivery");
        };
        assert_eq!(second.seq, first.seq);
        assert_eq!(second.attempt, 1);
        assert_eq!(outbox.pending()?, 1);
        Ok(())
    }

    #[tokio::test]
    async fn topics_do_not_see_each_other() -> Result<()> {
        let db = TempDb::new("outbox")?;
        let interactive = outbox(&db, "interactive")?;
        let articles = outbox(&db, "articles")?;
        interactive
            .produce_inconsistent_event(InconsistentEvent::new(
                1,
                Direction::Src,
                InconsistencyType::Neq,
            ))
            .await?;

        assert_eq!(interactive.pending()?, 1);
        assert_eq!(articles.pending()?, 0);
        assert_eq!(articles.next_due()?, None);
        Ok(())
    }

    #[tokio::test]
    async fn undecodable_rows_are_dropped() -> Result<()> {
        let db = TempDb::new("outbox")?;
        let outbox = outbox(&db, "interactive")?;
        outbox.pool.exec(
            r"INSERT INTO migrator_outbox(
  topic, entity_id, direction, kind, available_at, created_at
) VALUES ('interactive', 1, 'SIDEWAYS', 'neq', 0, 'now')",
            &[],
        )?;

        assert_eq!(outbox.next_due()?, None);
        assert_eq!(outbox.pending()?, 0);
        Ok(())
    }
}
