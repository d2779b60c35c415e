use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use migrator_core::{Direction, Pattern};
use migrator_store_sqlite::{ConnPool, DoubleWritePool, TableEntity};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::MigratorConfig;
use crate::events::Producer;
use crate::validator::Validator;

pub const INCR_STARTED_MSG: &str = "启动增量校验成功";

/// Snapshot of what the scheduler is doing.
#[derive(Debug, Clone, Copy, Serialize, Eq, PartialEq)]
pub struct SchedulerStatus {
    pub pattern: Pattern,
    pub full_running: bool,
    pub incr_running: bool,
}

#[derive(Debug)]
struct ValidationRun {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

impl ValidationRun {
    fn is_running(&self) -> bool {
        !self.handle.is_finished()
    }
}

#[derive(Debug, Default)]
struct SchedulerState {
    full: Option<ValidationRun>,
    incr: Option<ValidationRun>,
}

/// Control surface of one table migration: switches the write pattern and
/// starts or stops validation runs in the background.
///
/// The double write pool is the only record of the active pattern; the scheduler
/// reads it back instead of keeping its own copy.
pub struct Scheduler<T, P> {
    src: Arc<P>,
    dst: Arc<P>,
    pool: Arc<DoubleWritePool<P>>,
    producer: Arc<dyn Producer>,
    config: MigratorConfig,
    state: Mutex<SchedulerState>,
    _entity: PhantomData<fn() -> T>,
}

impl<T: TableEntity, P: ConnPool> Scheduler<T, P> {
    /// # Errors
    /// Returns an error when `config` is invalid.
    pub fn new(
        src: Arc<P>,
        dst: Arc<P>,
        pool: Arc<DoubleWritePool<P>>,
        producer: Arc<dyn Producer>,
        config: MigratorConfig,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            src,
            dst,
            pool,
            producer,
            config,
            state: Mutex::new(SchedulerState::default()),
            _entity: PhantomData,
        })
    }

    /// # Errors
    /// Returns an error when the pool holds an unknown pattern.
    pub fn pattern(&self) -> Result<Pattern> {
        self.pool.pattern()
    }

    /// Switch the pool's pattern. Runs started afterwards pair the stores by the new one.
    pub fn set_pattern(&self, pattern: Pattern) {
        let _state = self.state.lock();
        self.pool.update_pattern(pattern);
    }

    pub fn src_only(&self) {
        self.set_pattern(Pattern::SrcOnly);
    }

    pub fn src_first(&self) {
        self.set_pattern(Pattern::SrcFirst);
    }

    pub fn dst_first(&self) {
        self.set_pattern(Pattern::DstFirst);
    }

    pub fn dst_only(&self) {
        self.set_pattern(Pattern::DstOnly);
    }

    /// Start a full one-shot validation, replacing any full run still in progress.
    ///
    /// # Errors
    /// Returns an error when the validator cannot be built or no runtime is available.
    pub fn start_full_validation(&self) -> Result<()> {
        let mut state = self.state.lock();
        let validator = self.validator(self.pool.pattern()?)?;
        let run = spawn_run(validator, "full")?;
        if let Some(previous) = state.full.replace(run) {
            previous.cancel.cancel();
        }
        Ok(())
    }

    /// Start an incremental validation over rows updated after `update_time` (unix ms).
    ///
    /// A positive `interval_ms` keeps the run polling for new rows; otherwise it scans once.
    ///
    /// # Errors
    /// Returns an error when the validator cannot be built or no runtime is available.
    pub fn start_incremental_validation(&self, update_time: i64, interval_ms: i64) -> Result<()> {
        let mut state = self.state.lock();
        let interval = Duration::from_millis(u64::try_from(interval_ms).unwrap_or(0));
        let validator = self
            .validator(self.pool.pattern()?)?
            .incremental(update_time)
            .sleep_interval(interval);
        let run = spawn_run(validator, "incremental")?;
        if let Some(previous) = state.incr.replace(run) {
            previous.cancel.cancel();
        }
        Ok(())
    }

    pub fn stop_full_validation(&self) {
        if let Some(run) = self.state.lock().full.take() {
            run.cancel.cancel();
        }
    }

    pub fn stop_incremental_validation(&self) {
        if let Some(run) = self.state.lock().incr.take() {
            run.cancel.cancel();
        }
    }

    /// # Errors
    /// Returns an error when the pool holds an unknown pattern.
    pub fn status(&self) -> Result<SchedulerStatus> {
        let state = self.state.lock();
        Ok(SchedulerStatus {
            pattern: self.pool.pattern()?,
            full_running: state.full.as_ref().is_some_and(ValidationRun::is_running),
            incr_running: state.incr.as_ref().is_some_and(ValidationRun::is_running),
        })
    }

    fn validator(&self, pattern: Pattern) -> Result<Validator<T, P>> {
        let direction = pattern.direction();
        let (base, target) = match direction {
            Direction::Src => (&self.src, &self.dst),
            Direction::Dst => (&self.dst, &self.src),
        };
        Ok(Validator::new(
            Arc::clone(base),
            Arc::clone(target),
            direction,
            Arc::clone(&self.producer),
            &self.config,
        )?)
    }
}

impl<T, P> Drop for Scheduler<T, P> {
    fn drop(&mut self) {
        let state = self.state.get_mut();
        for run in [state.full.take(), state.incr.take()].into_iter().flatten() {
            run.cancel.cancel();
        }
    }
}

fn spawn_run<T: TableEntity, P: ConnPool>(
    validator: Validator<T, P>,
    mode: &'static str,
) -> Result<ValidationRun> {
    let runtime = Handle::try_current().context("validation runs need a tokio runtime")?;
    let cancel = CancellationToken::new();
    let token = cancel.clone();
    let direction = validator.direction();

    let handle = runtime.spawn(async move {
        if let Err(err) = validator.validate(&token).await {
            tracing::error!(
                mode,
                direction = %direction,
                error = format!("{err:#}"),
                "validation failed"
            );
        }
    });

    tracing::info!(mode, direction = %direction, "validation scheduled");
    Ok(ValidationRun { cancel, handle })
}
