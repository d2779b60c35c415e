use std::sync::Arc;

use anyhow::Result;
use migrator_core::Direction;
use migrator_store_sqlite::{ConnPool, TableEntity};
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::config::FixerConfig;
use crate::events::{Delivery, EventSource};
use crate::fixer::{FixOutcome, OverrideFixer};
use crate::metrics;
use crate::run_blocking;

#[derive(Debug, Clone, Copy, Default, Serialize, Eq, PartialEq)]
pub struct ConsumerStats {
    pub upserted: u64,
    pub deleted: u64,
    pub retried: u64,
}

/// Applies the fixer to every event delivered by an [`EventSource`].
///
/// Events flagged against the source table repair the destination, and the other
/// way round for events flagged against the destination.
pub struct FixerConsumer<T, P, S> {
    src_to_dst: OverrideFixer<T, P>,
    dst_to_src: OverrideFixer<T, P>,
    source: S,
    backoff: FixerConfig,
}

impl<T, P, S> FixerConsumer<T, P, S>
where
    T: TableEntity,
    P: ConnPool,
    S: EventSource,
{
    /// # Errors
    /// Returns an error when either fixer cannot discover its columns.
    pub fn new(src: Arc<P>, dst: Arc<P>, source: S, backoff: FixerConfig) -> Result<Self> {
        let src_to_dst = OverrideFixer::new(Arc::clone(&src), Arc::clone(&dst))?;
        let dst_to_src = OverrideFixer::new(dst, src)?;
        Ok(Self::with_fixers(src_to_dst, dst_to_src, source, backoff))
    }

    #[must_use]
    pub fn with_fixers(
        src_to_dst: OverrideFixer<T, P>,
        dst_to_src: OverrideFixer<T, P>,
        source: S,
        backoff: FixerConfig,
    ) -> Self {
        Self { src_to_dst, dst_to_src, source, backoff }
    }

    fn fixer(&self, direction: Direction) -> &OverrideFixer<T, P> {
        match direction {
            Direction::Src => &self.src_to_dst,
            Direction::Dst => &self.dst_to_src,
        }
    }

    /// Consume until `cancel` fires or the source is closed and drained.
    ///
    /// A failed fix is never acknowledged; it is handed back to the source for redelivery.
    ///
    /// # Errors
    /// Returns an error only when a fix task itself fails to run.
    pub async fn run(mut self, cancel: CancellationToken) -> Result<ConsumerStats> {
        let mut stats = ConsumerStats::default();
        let mut read_failures = 0_u32;

        loop {
            let next = tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                next = self.source.next() => next,
            };

            let delivery = match next {
                Ok(Some(delivery)) => delivery,
                Ok(None) => break,
                Err(err) => {
                    let delay = self.backoff.backoff(read_failures);
                    read_failures = read_failures.saturating_add(1);
                    tracing::error!(
                        error = format!("{err:#}"),
                        retry_in_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        "failed to read inconsistency event"
                    );
                    tokio::select! {
                        () = cancel.cancelled() => break,
                        () = tokio::time::sleep(delay) => continue,
                    }
                }
            };
            read_failures = 0;

            self.handle(delivery, &mut stats).await?;
        }

        tracing::info!(
            upserted = stats.upserted,
            deleted = stats.deleted,
            retried = stats.retried,
            "fixer consumer stopped"
        );
        Ok(stats)
    }

    async fn handle(&mut self, delivery: Delivery, stats: &mut ConsumerStats) -> Result<()> {
        let fixer = self.fixer(delivery.event.direction).clone();
        let event = delivery.event;

        match run_blocking(move || fixer.fix_event(&event)).await? {
            Ok(outcome) => {
                metrics::record_fix(event.direction, outcome);
                match outcome {
                    FixOutcome::Upserted => stats.upserted += 1,
                    FixOutcome::Deleted => stats.deleted += 1,
                }
                if let Err(err) = self.source.ack(&delivery).await {
                    tracing::warn!(
                        id = event.id,
                        seq = delivery.seq,
                        error = format!("{err:#}"),
                        "failed to acknowledge fixed event, it will be fixed again"
                    );
                }
            }
            Err(err) => {
                let delay = self.backoff.backoff(delivery.attempt);
                stats.retried += 1;
                metrics::record_fix_retry(event.direction);
                tracing::error!(
                    id = event.id,
                    direction = %event.direction,
                    kind = %event.kind,
                    attempt = delivery.attempt,
                    retry_in_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                    error = format!("{err:#}"),
                    "fix failed, scheduling redelivery"
                );
                if let Err(err) = self.source.retry_later(&delivery, delay).await {
                    tracing::error!(
                        id = event.id,
                        seq = delivery.seq,
                        error = format!("{err:#}"),
                        "failed to schedule redelivery"
                    );
                }
            }
        }
        Ok(())
    }
}
