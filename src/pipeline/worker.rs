use std::{sync::Arc, time::Duration};

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

use super::{
    backoff::Backoff,
    commit::{CommitError, Committer, TopicMap},
    queue::{DurableQueue, QueueEntry, QueueError},
};
use crate::{config::ConfigPipeline, ports::Ports};

#[derive(Debug, Clone, PartialEq)]
pub struct WorkerSettings {
    pub max_attempts: u32,
    pub backoff: Backoff,
    pub phase_timeout: Duration,
    pub grace: Duration,
    pub poll_interval: Duration,
}

impl WorkerSettings {
    pub fn from_config(cfg: &ConfigPipeline) -> Self {
        Self {
            max_attempts: cfg.max_attempts,
            backoff: Backoff::from_config(cfg),
            phase_timeout: cfg.phase_timeout(),
            grace: cfg.shutdown_grace(),
            poll_interval: cfg.poll_interval(),
        }
    }
}

/// How a claimed entry was resolved
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum Delivery {
    Delivered(Uuid),
    RetryScheduled { id: Uuid, attempt: u32 },
    DeadLettered(Uuid),
    /// Shutdown arrived between phases; the entry went back to the queue as it was
    Released(Uuid),
}

pub struct DeliveryWorker {
    index: usize,
    queue: Arc<DurableQueue>,
    committer: Committer,
    max_attempts: u32,
    backoff: Backoff,
    poll_interval: Duration,
    shutdown: CancellationToken,
}

impl DeliveryWorker {
    pub fn new(
        index: usize,
        queue: Arc<DurableQueue>,
        ports: Ports,
        topics: Arc<TopicMap>,
        settings: &WorkerSettings,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            index,
            committer: Committer::new(
                queue.clone(),
                ports,
                topics,
                settings.phase_timeout,
                settings.grace,
                shutdown.clone(),
            ),
            queue,
            max_attempts: settings.max_attempts,
            backoff: settings.backoff.clone(),
            poll_interval: settings.poll_interval,
            shutdown,
        }
    }

    /// Pulls at most one ready entry, commits it and resolves it
    pub async fn step(&self) -> Result<Option<Delivery>, QueueError> {
        let entry = match self.queue.next_ready(Utc::now())? {
            Some(entry) => entry,
            None => return Ok(None),
        };
        let outcome = self.committer.commit(&entry).await;
        match self.resolve(&entry, outcome) {
            Ok(delivery) => Ok(Some(delivery)),
            Err(e) => {
                // Leave it for recovery rather than holding the claim forever
                self.queue.release(&entry.handle);
                Err(e)
            }
        }
    }

    fn resolve(
        &self,
        entry: &QueueEntry,
        outcome: Result<(), CommitError>,
    ) -> Result<Delivery, QueueError> {
        let id = entry.handle.id();
        let failure = match outcome {
            Ok(()) => {
                self.queue.ack(&entry.handle)?;
                info!(id=%id, camera=%entry.record.camera_id, object=%entry.record.object_type, "Alert delivered");
                return Ok(Delivery::Delivered(id));
            }
            Err(CommitError::Stopped(phase)) => {
                self.queue.release(&entry.handle);
                debug!(id=%id, phase=%phase, "Shutdown before phase, entry released");
                return Ok(Delivery::Released(id));
            }
            Err(CommitError::Phase(failure)) => failure,
        };

        let attempt = entry.record.attempt_count + 1;
        let reason = failure.to_string();
        let exhausted = failure.error.is_unauthorized() || attempt >= self.max_attempts;
        if exhausted && !failure.interrupted {
            self.queue.dead_letter(&entry.handle, &reason, Utc::now())?;
            error!(id=%id, attempt, "Alert dead-lettered: {}", reason);
            Ok(Delivery::DeadLettered(id))
        } else {
            let scheduled = self
                .queue
                .retry(&entry.handle, &reason, &self.backoff, Utc::now())?;
            warn!(id=%id, attempt, next_retry_at=%scheduled.next_retry_at, "Delivery failed: {}", reason);
            Ok(Delivery::RetryScheduled {
                id,
                attempt: scheduled.attempt_count,
            })
        }
    }

    /// Drains ready entries until shutdown, sleeping on the queue signal or the poll interval when idle
    pub async fn run(self) {
        let span = info_span!("Delivery worker", index = self.index);
        async move {
            debug!("Worker started");
            while !self.shutdown.is_cancelled() {
                match self.step().await {
                    Ok(Some(_)) => continue,
                    Ok(None) => {}
                    Err(e) => error!("Queue unavailable: {}", e),
                }
                tokio::select! {
                    _ = self.shutdown.cancelled() => break,
                    _ = self.queue.work_available() => {}
                    _ = tokio::time::sleep(self.poll_interval) => {}
                }
            }
            debug!("Worker stopped");
        }
        .instrument(span)
        .await
    }
}
