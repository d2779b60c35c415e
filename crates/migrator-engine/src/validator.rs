use std::collections::HashSet;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use migrator_core::{
    difference_by, Direction, Entity, InconsistencyType, InconsistentEvent, MigratorError,
};
use migrator_store_sqlite::{table, ConnPool, TableEntity};
use tokio_util::sync::CancellationToken;

use crate::config::MigratorConfig;
use crate::events::Producer;
use crate::metrics;
use crate::run_blocking;

/// One-shot scans stop after this many read failures in a row.
const MAX_CONSECUTIVE_READ_ERRORS: u32 = 10;

/// Compares a base table against a target table and publishes every row that differs.
///
/// Never writes to either store. A validator with a zero sleep interval scans once;
/// otherwise it keeps polling for new rows until cancelled.
pub struct Validator<T, P> {
    base: Arc<P>,
    target: Arc<P>,
    producer: Arc<dyn Producer>,
    direction: Direction,
    batch_size: usize,
    update_time: Option<i64>,
    sleep_interval: Duration,
    publish_timeout: Duration,
    _entity: PhantomData<fn() -> T>,
}

impl<T, P> std::fmt::Debug for Validator<T, P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Validator")
            .field("direction", &self.direction)
            .field("batch_size", &self.batch_size)
            .field("update_time", &self.update_time)
            .field("sleep_interval", &self.sleep_interval)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Scan {
    BaseToTarget,
    TargetToBase,
}

impl Scan {
    fn as_str(self) -> &'static str {
        match self {
            Self::BaseToTarget => "base_to_target",
            Self::TargetToBase => "target_to_base",
        }
    }
}

impl<T: TableEntity, P: ConnPool> Validator<T, P> {
    /// Full one-shot validator.
    ///
    /// # Errors
    /// Returns [`MigratorError::Config`] when `config` is invalid.
    pub fn new(
        base: Arc<P>,
        target: Arc<P>,
        direction: Direction,
        producer: Arc<dyn Producer>,
        config: &MigratorConfig,
    ) -> Result<Self, MigratorError> {
        config.validate()?;
        Ok(Self {
            base,
            target,
            producer,
            direction,
            batch_size: config.batch_size,
            update_time: None,
            sleep_interval: Duration::ZERO,
            publish_timeout: config.publish_timeout(),
            _entity: PhantomData,
        })
    }

    /// Only scan base rows updated strictly after `update_time` (unix milliseconds).
    #[must_use]
    pub fn incremental(mut self, update_time: i64) -> Self {
        self.update_time = Some(update_time);
        self
    }

    /// Wait `interval` and look again when a scan runs out of rows. Zero scans once.
    #[must_use]
    pub fn sleep_interval(mut self, interval: Duration) -> Self {
        self.sleep_interval = interval;
        self
    }

    #[must_use]
    pub fn direction(&self) -> Direction {
        self.direction
    }

    #[must_use]
    pub fn is_one_shot(&self) -> bool {
        self.sleep_interval.is_zero()
    }

    /// Run both scans concurrently until they finish or `cancel` fires.
    ///
    /// # Errors
    /// Returns an error only when a scan task itself fails; store errors are logged and skipped.
    pub async fn validate(&self, cancel: &CancellationToken) -> Result<()> {
        tracing::info!(
            direction = %self.direction,
            update_time = ?self.update_time,
            batch_size = self.batch_size,
            one_shot = self.is_one_shot(),
            "validation started"
        );

        tokio::try_join!(
            self.validate_base_to_target(cancel),
            self.validate_target_to_base(cancel)
        )?;

        tracing::info!(
            direction = %self.direction,
            cancelled = cancel.is_cancelled(),
            "validation finished"
        );
        Ok(())
    }

    async fn validate_base_to_target(&self, cancel: &CancellationToken) -> Result<()> {
        let mut offset = 0_usize;
        let mut failures = 0_u32;

        while !cancel.is_cancelled() {
            let base = Arc::clone(&self.base);
            let (limit, update_time) = (self.batch_size, self.update_time);
            let page = run_blocking(move || match update_time {
                Some(update_time) => {
                    table::page_updated_after::<T, P>(&base, update_time, offset, limit)
                }
                None => table::page_by_id::<T, P>(&base, offset, limit),
            })
            .await?;

            let base_rows = match page {
                Ok(rows) => rows,
                Err(err) => {
                    self.read_failed(Scan::BaseToTarget, offset, &err);
                    offset += self.batch_size;
                    failures += 1;
                    if !self.keep_going_after_error(failures, cancel).await {
                        return Ok(());
                    }
                    continue;
                }
            };
            failures = 0;

            if base_rows.is_empty() {
                if self.wait_for_rows(cancel).await {
                    continue;
                }
                return Ok(());
            }

            let ids: Vec<i64> = base_rows.iter().map(Entity::id).collect();
            let target = Arc::clone(&self.target);
            match run_blocking(move || table::find_by_ids::<T, P>(&target, &ids)).await? {
                Ok(target_rows) => {
                    let missing = if target_rows.is_empty() {
                        base_rows.iter().collect()
                    } else {
                        difference_by(&base_rows, &target_rows, Entity::compare_to)
                    };
                    for row in missing {
                        self.notify(row.id(), InconsistencyType::TargetMissing).await;
                    }
                }
                Err(err) => self.read_failed(Scan::BaseToTarget, offset, &err),
            }

            offset += base_rows.len();
            if base_rows.len() < self.batch_size && self.is_one_shot() {
                return Ok(());
            }
        }
        Ok(())
    }

    async fn validate_target_to_base(&self, cancel: &CancellationToken) -> Result<()> {
        let mut offset = 0_usize;
        let mut failures = 0_u32;

        while !cancel.is_cancelled() {
            let target = Arc::clone(&self.target);
            let limit = self.batch_size;
            let page =
                run_blocking(move || table::ids_page::<T, P>(&target, offset, limit)).await?;

            let ids = match page {
                Ok(ids) => ids,
                Err(err) => {
                    self.read_failed(Scan::TargetToBase, offset, &err);
                    offset += self.batch_size;
                    failures += 1;
                    if !self.keep_going_after_error(failures, cancel).await {
                        return Ok(());
                    }
                    continue;
                }
            };
            failures = 0;

            if ids.is_empty() {
                if self.wait_for_rows(cancel).await {
                    continue;
                }
                return Ok(());
            }

            let base = Arc::clone(&self.base);
            let lookup = ids.clone();
            match run_blocking(move || table::existing_ids::<T, P>(&base, &lookup)).await? {
                Ok(present) => {
                    let present: HashSet<i64> = present.into_iter().collect();
                    for id in ids.iter().filter(|id| !present.contains(*id)) {
                        self.notify(*id, InconsistencyType::BaseMissing).await;
                    }
                }
                Err(err) => self.read_failed(Scan::TargetToBase, offset, &err),
            }

            offset += ids.len();
            if ids.len() < self.batch_size && self.is_one_shot() {
                return Ok(());
            }
        }
        Ok(())
    }

    /// Returns `false` when the scan should end instead of looking again.
    async fn wait_for_rows(&self, cancel: &CancellationToken) -> bool {
        if self.is_one_shot() {
            return false;
        }
        tokio::select! {
            () = cancel.cancelled() => false,
            () = tokio::time::sleep(self.sleep_interval) => true,
        }
    }

    async fn keep_going_after_error(&self, failures: u32, cancel: &CancellationToken) -> bool {
        if self.is_one_shot() {
            if failures >= MAX_CONSECUTIVE_READ_ERRORS {
                tracing::error!(
                    direction = %self.direction,
                    failures,
                    "giving up one-shot scan after repeated read failures"
                );
                return false;
            }
            return !cancel.is_cancelled();
        }
        self.wait_for_rows(cancel).await
    }

    fn read_failed(&self, scan: Scan, offset: usize, err: &anyhow::Error) {
        tracing::error!(
            direction = %self.direction,
            scan = scan.as_str(),
            offset,
            batch_size = self.batch_size,
            error = format!("{err:#}"),
            "failed to read validation batch, skipping it"
        );
    }

    async fn notify(&self, id: i64, kind: InconsistencyType) {
        let event = InconsistentEvent::new(id, self.direction, kind);
        let published = tokio::time::timeout(
            self.publish_timeout,
            self.producer.produce_inconsistent_event(event),
        )
        .await;

        match published {
            Ok(Ok(())) => metrics::record_inconsistency(self.direction, kind),
            Ok(Err(err)) => {
                metrics::record_publish_failure(self.direction, "error");
                tracing::error!(
                    id,
                    direction = %self.direction,
                    kind = %kind,
                    error = format!("{err:#}"),
                    "failed to publish inconsistency"
                );
            }
            Err(_) => {
                metrics::record_publish_failure(self.direction, "timeout");
                tracing::error!(
                    id,
                    direction = %self.direction,
                    kind = %kind,
                    timeout_ms =
                        u64::try_from(self.publish_timeout.as_millis()).unwrap_or(u64::MAX),
                    "timed out publishing inconsistency"
                );
            }
        }
    }
}
