use anyhow::{Context, Result};

pub mod config;
pub mod consumer;
pub mod events;
pub mod fixer;
pub mod metrics;
pub mod outbox;
pub mod scheduler;
pub mod validator;

pub use config::{FixerConfig, MigratorConfig, OutboxConfig};
pub use consumer::{ConsumerStats, FixerConsumer};
pub use events::{channel, ChannelProducer, ChannelSource, Delivery, EventSource, Producer};
pub use fixer::{FixOutcome, OverrideFixer};
pub use outbox::{OutboxSource, SqliteOutbox};
pub use scheduler::{Scheduler, SchedulerStatus, INCR_STARTED_MSG};
pub use validator::Validator;

/// Run synchronous store work on the blocking pool.
///
/// Only a failed task surfaces as the outer error; the closure's own result is returned as-is.
pub(crate) async fn run_blocking<F, R>(task: F) -> Result<R>
where
    F: FnOnce() -> R + Send + 'static,
    R: Send + 'static,
{
    tokio::task::spawn_blocking(task).await.context("blocking store task failed")
}
