//! Inconsistency event channel.
//!
//! Delivery is at-least-once: a consumer acknowledges an event only after it was
//! fixed, and asks for redelivery otherwise.

use std::collections::VecDeque;
use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use migrator_core::InconsistentEvent;
use tokio::sync::mpsc;
use tokio::time::Instant;

/// Publishes inconsistency events found by a validation run.
#[async_trait]
pub trait Producer: Send + Sync {
    /// # Errors
    /// Returns an error when the event could not be handed to the channel.
    async fn produce_inconsistent_event(&self, event: InconsistentEvent) -> Result<()>;
}

/// One delivery of an event to a consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Delivery {
    pub seq: i64,
    pub event: InconsistentEvent,
    /// Failed attempts before this delivery.
    pub attempt: u32,
}

#[async_trait]
pub trait EventSource: Send {
    /// Wait for the next due event. `None` means the channel is closed and drained.
    ///
    /// # Errors
    /// Returns an error when the backing store cannot be read.
    async fn next(&mut self) -> Result<Option<Delivery>>;

    /// # Errors
    /// Returns an error when the acknowledgement cannot be recorded.
    async fn ack(&mut self, delivery: &Delivery) -> Result<()>;

    /// Make `delivery` due again after `delay`.
    ///
    /// # Errors
    /// Returns an error when the redelivery cannot be recorded.
    async fn retry_later(&mut self, delivery: &Delivery, delay: Duration) -> Result<()>;
}

/// Bounded in-process channel. Events are not persisted.
#[must_use]
pub fn channel(capacity: usize) -> (ChannelProducer, ChannelSource) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (
        ChannelProducer { tx },
        ChannelSource { rx, delayed: VecDeque::new(), next_seq: 1, closed: false },
    )
}

#[derive(Debug, Clone)]
pub struct ChannelProducer {
    tx: mpsc::Sender<InconsistentEvent>,
}

#[async_trait]
impl Producer for ChannelProducer {
    async fn produce_inconsistent_event(&self, event: InconsistentEvent) -> Result<()> {
        self.tx.send(event).await.map_err(|_| anyhow!("inconsistency channel is closed"))
    }
}

#[derive(Debug)]
pub struct ChannelSource {
    rx: mpsc::Receiver<InconsistentEvent>,
    /// Deliveries waiting for redelivery, ordered by due time.
    delayed: VecDeque<(Instant, Delivery)>,
    next_seq: i64,
    closed: bool,
}

impl ChannelSource {
    fn fresh(&mut self, event: InconsistentEvent) -> Delivery {
        let seq = self.next_seq;
        self.next_seq += 1;
        Delivery { seq, event, attempt: 0 }
    }

    /// Deliveries scheduled for redelivery and not yet handed out again.
    #[must_use]
    pub fn pending_retries(&self) -> usize {
        self.delayed.len()
    }
}

#[async_trait]
impl EventSource for ChannelSource {
    async fn next(&mut self) -> Result<Option<Delivery>> {
        loop {
            let wake = self.delayed.front().map(|(due, _)| *due);
            if wake.is_some_and(|due| due <= Instant::now()) {
                return Ok(self.delayed.pop_front().map(|(_, delivery)| delivery));
            }

            let received = match wake {
                None if self.closed => return Ok(None),
                None => Some(self.rx.recv().await),
                Some(due) => tokio::select! {
                    received = self.rx.recv(), if !self.closed => Some(received),
                    () = tokio::time::sleep_until(due) => None,
                },
            };

            match received {
                Some(Some(event)) => return Ok(Some(self.fresh(event))),
                Some(None) => self.closed = true,
                None => {}
            }
        }
    }

    async fn ack(&mut self, _delivery: &Delivery) -> Result<()> {
        Ok(())
    }

    async fn retry_later(&mut self, delivery: &Delivery, delay: Duration) -> Result<()> {
        let due = Instant::now() + delay;
        let retry = Delivery { attempt: delivery.attempt.saturating_add(1), ..*delivery };
        let at = self.delayed.partition_point(|(queued, _)| *queued <= due);
        self.delayed.insert(at, (due, retry));
        Ok(())
    }
}
