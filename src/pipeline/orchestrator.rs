use std::{collections::HashSet, sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use tokio::{sync::mpsc, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, trace, warn, Instrument};
use uuid::Uuid;

use super::{
    commit::TopicMap,
    dedup::Deduplicator,
    queue::{DurableQueue, EntryHandle, QueueError},
    record::AlertRecord,
    worker::{DeliveryWorker, WorkerSettings},
};
use crate::{
    config::{Config, FullQueuePolicy},
    detection::DetectionEvent,
    ports::Ports,
};

/// Pairs tracked by the deduplicator before expired ones are swept
const DEDUP_PRUNE_THRESHOLD: usize = 1024;

#[derive(Debug, Clone, PartialEq)]
pub struct AdmissionSettings {
    pub watched_classes: HashSet<String>,
    pub min_confidence: f32,
    pub cooldown: Duration,
    pub on_full: FullQueuePolicy,
    pub block_timeout: Duration,
}

impl AdmissionSettings {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            watched_classes: cfg.pipeline.watched_classes.iter().cloned().collect(),
            min_confidence: cfg.pipeline.min_confidence,
            cooldown: cfg.pipeline.cooldown(),
            on_full: cfg.queue.on_full,
            block_timeout: cfg.queue.block_timeout(),
        }
    }
}

/// What happened to a submitted detection
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum Admission {
    Enqueued(EntryHandle),
    /// Missing or out-of-range fields
    Malformed,
    /// Class not watched or confidence too low
    Ignored,
    /// Same camera and class already alerted within the cooldown
    Suppressed,
    /// Queue stayed full
    Dropped,
}

/// Turns detections into queued alerts
pub struct Orchestrator {
    queue: Arc<DurableQueue>,
    dedup: Deduplicator,
    settings: AdmissionSettings,
}

impl Orchestrator {
    pub fn new(queue: Arc<DurableQueue>, settings: AdmissionSettings) -> Self {
        Self {
            queue,
            dedup: Deduplicator::new(settings.cooldown),
            settings,
        }
    }

    pub async fn submit(
        &mut self,
        event: DetectionEvent,
        now: DateTime<Utc>,
    ) -> Result<Admission, PipelineError> {
        if let Err(e) = event.validate() {
            warn!(camera=%event.camera_id, "Rejected detection: {}", e);
            return Ok(Admission::Malformed);
        }
        if !self.settings.watched_classes.contains(&event.object_type)
            || event.confidence < self.settings.min_confidence
        {
            trace!(object=%event.object_type, confidence=event.confidence, "Detection ignored");
            return Ok(Admission::Ignored);
        }
        if self.dedup.tracked() > DEDUP_PRUNE_THRESHOLD {
            self.dedup.prune(now);
        }
        if !self.dedup.admit(&event.camera_id, &event.object_type, now) {
            debug!(camera=%event.camera_id, object=%event.object_type, "Detection within cooldown");
            return Ok(Admission::Suppressed);
        }

        let record = AlertRecord::new(Uuid::new_v4(), event, now);
        let deadline = tokio::time::Instant::now() + self.settings.block_timeout;
        loop {
            match self.queue.append(&record, now) {
                Ok(handle) => {
                    info!(id=%record.id, camera=%record.camera_id, object=%record.object_type, position=handle.position(), "Alert queued");
                    return Ok(Admission::Enqueued(handle));
                }
                Err(QueueError::CapacityExceeded(capacity)) => {
                    let freed = self.settings.on_full == FullQueuePolicy::Block
                        && tokio::time::timeout_at(deadline, self.queue.space_available())
                            .await
                            .is_ok();
                    if !freed {
                        // Let the next detection of this pair through since nothing was sent
                        self.dedup.forget(&record.camera_id, &record.object_type);
                        warn!(
                            camera=%record.camera_id,
                            object=%record.object_type,
                            capacity,
                            "Queue full, alert dropped"
                        );
                        return Ok(Admission::Dropped);
                    }
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Admits detections until the intake closes or shutdown is requested.
    /// Only local storage failures end it early.
    pub async fn run(
        mut self,
        mut events: mpsc::Receiver<DetectionEvent>,
        shutdown: CancellationToken,
    ) -> Result<(), PipelineError> {
        async move {
            loop {
                let event = tokio::select! {
                    _ = shutdown.cancelled() => break,
                    event = events.recv() => match event {
                        Some(event) => event,
                        None => break,
                    },
                };
                // A detection still waiting for queue space is dropped on shutdown
                tokio::select! {
                    biased;
                    admitted = self.submit(event, Utc::now()) => {
                        admitted?;
                    }
                    _ = shutdown.cancelled() => {
                        debug!("Shutdown while waiting for queue space");
                        break;
                    }
                }
            }
            debug!("No longer admitting detections");
            Ok::<(), PipelineError>(())
        }
        .instrument(info_span!("Orchestrator"))
        .await
    }
}

/// The running worker pool
pub struct Pipeline {
    queue: Arc<DurableQueue>,
    workers: Vec<JoinHandle<()>>,
}

impl Pipeline {
    /// Recovers interrupted deliveries and then starts `worker_count` workers
    pub fn start(
        queue: Arc<DurableQueue>,
        ports: Ports,
        topics: TopicMap,
        settings: &WorkerSettings,
        worker_count: usize,
        shutdown: CancellationToken,
    ) -> Result<Self, PipelineError> {
        let recovered = queue.recover_on_startup(Utc::now())?;
        if !recovered.is_empty() {
            info!(pending = recovered.len(), "Resuming undelivered alerts");
        }
        let dead = queue.dead_letters()?;
        if !dead.is_empty() {
            warn!(dead = dead.len(), "Dead-lettered alerts retained for inspection");
        }
        for letter in &dead {
            debug!(
                id=%letter.record.id,
                enqueued_at=%letter.enqueued_at,
                failed_at=%letter.failed_at,
                attempts=letter.record.attempt_count,
                "Dead letter: {}",
                letter.record.last_error.as_deref().unwrap_or("unknown error")
            );
        }

        let topics = Arc::new(topics);
        let workers = (0..worker_count)
            .map(|index| {
                let worker = DeliveryWorker::new(
                    index,
                    queue.clone(),
                    ports.clone(),
                    topics.clone(),
                    settings,
                    shutdown.clone(),
                );
                tokio::spawn(worker.run())
            })
            .collect();
        Ok(Self { queue, workers })
    }

    pub fn queue(&self) -> Arc<DurableQueue> {
        self.queue.clone()
    }

    /// Waits for every worker to finish its current phase and stop
    pub async fn join(self) {
        for result in futures::future::join_all(self.workers).await {
            if let Err(e) = result {
                error!("Delivery worker failed: {}", e);
            }
        }
        match self.queue.len() {
            Ok(pending) => info!(pending, "Delivery stopped"),
            Err(e) => error!("Unable to read queue on shutdown: {}", e),
        }
    }
}

quick_error! {
    #[derive(Debug)]
    pub enum PipelineError {
        Queue(error: QueueError) {
            display("Alert queue failure: {}", error)
            source(error)
            from()
        }
    }
}
