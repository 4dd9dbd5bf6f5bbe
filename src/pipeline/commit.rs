//! The three-phase remote commit for one claimed entry: upload, publish, record.
//!
//! Phases run strictly in order and each one is keyed by the alert id, so an attempt that stops
//! part way can be repeated from the start without creating a second blob or record.

use std::{collections::HashMap, fmt, future::Future, sync::Arc, time::Duration};

use strum::Display;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::{
    queue::{DurableQueue, QueueEntry, QueueError},
    record::{AlertDocument, AlertStatus, ImageRef},
};
use crate::ports::{PortError, Ports, Qos};

/// Broker topic for each alert source
#[derive(Debug, Clone, PartialEq)]
pub struct TopicMap {
    default: String,
    per_camera: HashMap<String, String>,
}

impl TopicMap {
    pub fn new(default: String, per_camera: HashMap<String, String>) -> Self {
        Self {
            default,
            per_camera,
        }
    }

    pub fn for_camera(&self, camera_id: &str) -> &str {
        self.per_camera
            .get(camera_id)
            .map(String::as_str)
            .unwrap_or(&self.default)
    }
}

#[derive(Debug, PartialEq, Eq, Clone, Copy, Display)]
#[strum(serialize_all = "lowercase")]
pub enum Phase {
    Upload,
    Publish,
    Record,
}

/// A phase that started and did not succeed
#[derive(Debug, Clone, PartialEq)]
pub struct PhaseFailure {
    pub phase: Phase,
    pub error: PortError,
    /// The phase was still running when the shutdown grace period ran out
    pub interrupted: bool,
}

impl fmt::Display for PhaseFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} failed: {}", self.phase, self.error)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum CommitError {
    Phase(PhaseFailure),
    /// Shutdown was requested before this phase began. Nothing was attempted.
    Stopped(Phase),
}

impl From<PhaseFailure> for CommitError {
    fn from(failure: PhaseFailure) -> Self {
        CommitError::Phase(failure)
    }
}

pub struct Committer {
    queue: Arc<DurableQueue>,
    ports: Ports,
    topics: Arc<TopicMap>,
    phase_timeout: Duration,
    grace: Duration,
    shutdown: CancellationToken,
}

impl Committer {
    pub fn new(
        queue: Arc<DurableQueue>,
        ports: Ports,
        topics: Arc<TopicMap>,
        phase_timeout: Duration,
        grace: Duration,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            queue,
            ports,
            topics,
            phase_timeout,
            grace,
            shutdown,
        }
    }

    /// Runs every outstanding phase for a claimed entry. The claim is left for the caller to resolve.
    pub async fn commit(&self, entry: &QueueEntry) -> Result<(), CommitError> {
        let handle = &entry.handle;
        let mut record = entry.record.clone();

        if let ImageRef::Local(bytes) = &record.image_ref {
            self.check_running(Phase::Upload)?;
            self.mark(Phase::Upload, entry, AlertStatus::Uploading)?;
            let key = record.blob_key();
            let url = self
                .guarded(Phase::Upload, self.ports.blobs.put(&key, bytes))
                .await?;
            self.queue
                .set_uploaded(handle, &url)
                .map_err(|e| storage_failure(Phase::Upload, e))?;
            debug!(id=%record.id, url=%url, "Image uploaded");
            record.image_ref = ImageRef::Remote(url);
        } else {
            debug!(id=%record.id, "Image already uploaded");
        }

        let message = record.message().ok_or_else(|| PhaseFailure {
            phase: Phase::Publish,
            error: PortError::Rejected("image has not been uploaded".into()),
            interrupted: false,
        })?;

        self.check_running(Phase::Publish)?;
        self.mark(Phase::Publish, entry, AlertStatus::Publishing)?;
        let payload = serde_json::to_vec(&message).map_err(|e| PhaseFailure {
            phase: Phase::Publish,
            error: PortError::Rejected(e.to_string()),
            interrupted: false,
        })?;
        let topic = self.topics.for_camera(&record.camera_id);
        self.guarded(
            Phase::Publish,
            self.ports.broker.publish(topic, payload, Qos::AtLeastOnce),
        )
        .await?;
        self.mark(Phase::Publish, entry, AlertStatus::Published)?;
        debug!(id=%record.id, topic=%topic, "Alert published");

        self.check_running(Phase::Record)?;
        self.mark(Phase::Record, entry, AlertStatus::Recording)?;
        let document = AlertDocument {
            alert: message,
            status: AlertStatus::Recorded,
        };
        self.guarded(
            Phase::Record,
            self.ports.records.upsert(record.id, &document),
        )
        .await?;
        debug!(id=%record.id, "Alert recorded");
        Ok(())
    }

    fn check_running(&self, phase: Phase) -> Result<(), CommitError> {
        if self.shutdown.is_cancelled() {
            return Err(CommitError::Stopped(phase));
        }
        Ok(())
    }

    fn mark(
        &self,
        phase: Phase,
        entry: &QueueEntry,
        status: AlertStatus,
    ) -> Result<(), PhaseFailure> {
        self.queue
            .set_status(&entry.handle, status)
            .map_err(|e| storage_failure(phase, e))
    }

    /// Bounds a remote call by the phase timeout, and by the grace period once shutdown starts
    async fn guarded<T, F>(&self, phase: Phase, call: F) -> Result<T, PhaseFailure>
    where
        F: Future<Output = Result<T, PortError>>,
    {
        let failure = |error, interrupted| PhaseFailure {
            phase,
            error,
            interrupted,
        };
        tokio::select! {
            result = tokio::time::timeout(self.phase_timeout, call) => match result {
                Ok(Ok(value)) => Ok(value),
                Ok(Err(e)) => Err(failure(e, false)),
                Err(_) => Err(failure(
                    PortError::Transient(format!("no response within {:?}", self.phase_timeout)),
                    false,
                )),
            },
            _ = self.grace_expired() => Err(failure(
                PortError::Transient("interrupted by shutdown".into()),
                true,
            )),
        }
    }

    async fn grace_expired(&self) {
        self.shutdown.cancelled().await;
        tokio::time::sleep(self.grace).await;
    }
}

fn storage_failure(phase: Phase, error: QueueError) -> PhaseFailure {
    PhaseFailure {
        phase,
        error: PortError::Transient(error.to_string()),
        interrupted: false,
    }
}

#[cfg(test)]
mod test {
    use std::{collections::HashMap, sync::Arc, time::Duration};

    use chrono::{TimeZone, Utc};
    use tokio_util::sync::CancellationToken;

    use super::{CommitError, Committer, Phase, PhaseFailure, TopicMap};
    use crate::{
        pipeline::{
            queue::{DurableQueue, QueueEntry},
            record::{test::sample_record, AlertRecord, AlertStatus, ImageRef},
        },
        ports::{
            testing::{FailureScript, MemoryBlobStore, MemoryBroker, MemoryPorts, MemoryRecordStore},
            PortError, Qos,
        },
    };

    fn topics() -> Arc<TopicMap> {
        Arc::new(TopicMap::new(
            "alerts".into(),
            HashMap::from([("cam_02".to_string(), "alerts/gate".to_string())]),
        ))
    }

    fn committer(queue: &Arc<DurableQueue>, ports: &MemoryPorts) -> Committer {
        Committer::new(
            queue.clone(),
            ports.ports(),
            topics(),
            Duration::from_millis(200),
            Duration::from_millis(50),
            CancellationToken::new(),
        )
    }

    fn queued(record: &AlertRecord) -> (Arc<DurableQueue>, QueueEntry) {
        let queue = Arc::new(DurableQueue::open_in_memory(10).unwrap());
        let now = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 1).unwrap();
        queue.append(record, now).unwrap();
        let entry = queue.next_ready(now).unwrap().unwrap();
        (queue, entry)
    }

    #[test]
    fn test_topic_lookup() {
        let topics = topics();
        assert_eq!(topics.for_camera("cam_01"), "alerts");
        assert_eq!(topics.for_camera("cam_02"), "alerts/gate");
    }

    #[tokio::test]
    async fn test_full_commit() {
        let record = sample_record();
        let (queue, entry) = queued(&record);
        let ports = MemoryPorts::healthy();

        committer(&queue, &ports).commit(&entry).await.unwrap();

        let key = "alerts/5b1f7c2e-8a0d-4a39-9c59-0e3f2f6a1d11.jpeg";
        assert_eq!(
            ports.blobs.objects.lock().unwrap().get(key),
            Some(&vec![0xff, 0xd8, 0xff, 0xe0])
        );

        let published = ports.broker.published.lock().unwrap().clone();
        assert_eq!(published.len(), 1);
        let (topic, payload, qos) = &published[0];
        assert_eq!(topic, "alerts");
        assert_eq!(*qos, Qos::AtLeastOnce);
        insta::assert_snapshot!(String::from_utf8(payload.clone()).unwrap(), @r###"{"id":"5b1f7c2e-8a0d-4a39-9c59-0e3f2f6a1d11","timestamp":"2024-05-01T12:00:00.000Z","object_type":"person","latitude":17.5987567,"longitude":78.4172736,"camera_id":"cam_01","image_ref":"mem://alerts/5b1f7c2e-8a0d-4a39-9c59-0e3f2f6a1d11.jpeg"}"###);

        let document = ports.records.get(record.id).unwrap();
        assert_eq!(document.status, AlertStatus::Recorded);
        assert_eq!(document.alert.image_ref, format!("mem://{}", key));

        // Resolution is left to the caller
        let stored = queue.get(record.id).unwrap().unwrap();
        assert_eq!(stored.record.status, AlertStatus::Recording);
    }

    #[tokio::test]
    async fn test_failed_publish_keeps_upload() {
        let record = sample_record();
        let (queue, entry) = queued(&record);
        let ports = MemoryPorts::new(
            MemoryBlobStore::default(),
            MemoryBroker::failing(FailureScript::once(vec![PortError::Transient(
                "connection lost".into(),
            )])),
            MemoryRecordStore::default(),
        );

        let err = committer(&queue, &ports).commit(&entry).await.unwrap_err();
        assert_eq!(
            err,
            CommitError::Phase(PhaseFailure {
                phase: Phase::Publish,
                error: PortError::Transient("connection lost".into()),
                interrupted: false,
            })
        );
        if let CommitError::Phase(failure) = err {
            assert_eq!(
                failure.to_string(),
                "publish failed: Temporary failure: connection lost"
            );
        }
        assert_eq!(ports.records.len(), 0);

        let stored = queue.get(record.id).unwrap().unwrap();
        assert_eq!(stored.record.status, AlertStatus::Publishing);
        assert!(stored.record.image_ref.remote_url().is_some());
    }

    #[tokio::test]
    async fn test_uploaded_image_is_not_sent_again() {
        let mut record = sample_record();
        record.image_ref = ImageRef::Remote("https://bucket/alerts/x.jpeg".into());
        record.camera_id = "cam_02".into();
        let (queue, entry) = queued(&record);
        let ports = MemoryPorts::healthy();

        committer(&queue, &ports).commit(&entry).await.unwrap();
        assert_eq!(*ports.blobs.calls.lock().unwrap(), 0);
        assert_eq!(ports.broker.published.lock().unwrap()[0].0, "alerts/gate");
        assert_eq!(
            ports.records.get(record.id).unwrap().alert.image_ref,
            "https://bucket/alerts/x.jpeg"
        );
    }

    #[tokio::test]
    async fn test_slow_call_times_out() {
        let record = sample_record();
        let (queue, entry) = queued(&record);
        let ports = MemoryPorts::new(
            MemoryBlobStore::slow(Duration::from_secs(5)),
            MemoryBroker::default(),
            MemoryRecordStore::default(),
        );

        match committer(&queue, &ports).commit(&entry).await {
            Err(CommitError::Phase(failure)) => {
                assert_eq!(failure.phase, Phase::Upload);
                assert!(matches!(failure.error, PortError::Transient(_)));
                assert!(!failure.interrupted);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(ports.broker.published.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_no_phase_starts_after_shutdown() {
        let record = sample_record();
        let (queue, entry) = queued(&record);
        let ports = MemoryPorts::healthy();
        let shutdown = CancellationToken::new();
        let committer = Committer::new(
            queue.clone(),
            ports.ports(),
            topics(),
            Duration::from_secs(1),
            Duration::from_secs(1),
            shutdown.clone(),
        );
        shutdown.cancel();

        assert_eq!(
            committer.commit(&entry).await,
            Err(CommitError::Stopped(Phase::Upload))
        );
        assert_eq!(*ports.blobs.calls.lock().unwrap(), 0);
        assert_eq!(
            queue.get(record.id).unwrap().unwrap().record.status,
            AlertStatus::New
        );
    }

    #[tokio::test]
    async fn test_shutdown_mid_phase_finishes_that_phase_only() {
        let record = sample_record();
        let (queue, entry) = queued(&record);
        let ports = MemoryPorts::new(
            MemoryBlobStore::slow(Duration::from_millis(100)),
            MemoryBroker::default(),
            MemoryRecordStore::default(),
        );
        let shutdown = CancellationToken::new();
        let committer = Committer::new(
            queue.clone(),
            ports.ports(),
            topics(),
            Duration::from_secs(30),
            Duration::from_secs(2),
            shutdown.clone(),
        );

        let cancel = shutdown.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            cancel.cancel();
        });
        assert_eq!(
            committer.commit(&entry).await,
            Err(CommitError::Stopped(Phase::Publish))
        );
        assert_eq!(*ports.blobs.writes.lock().unwrap(), 1);
        assert!(ports.broker.published.lock().unwrap().is_empty());
        assert_eq!(ports.records.len(), 0);

        let stored = queue.get(record.id).unwrap().unwrap();
        assert_eq!(stored.record.status, AlertStatus::Uploaded);
        assert!(stored.record.image_ref.remote_url().is_some());
    }

    #[tokio::test]
    async fn test_phase_overrunning_grace_is_interrupted() {
        let record = sample_record();
        let (queue, entry) = queued(&record);
        let ports = MemoryPorts::new(
            MemoryBlobStore::slow(Duration::from_secs(5)),
            MemoryBroker::default(),
            MemoryRecordStore::default(),
        );
        let shutdown = CancellationToken::new();
        let committer = Committer::new(
            queue.clone(),
            ports.ports(),
            topics(),
            Duration::from_secs(30),
            Duration::from_millis(20),
            shutdown.clone(),
        );

        let cancel = shutdown.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            cancel.cancel();
        });
        let started = std::time::Instant::now();
        match committer.commit(&entry).await {
            Err(CommitError::Phase(failure)) => {
                assert_eq!(failure.phase, Phase::Upload);
                assert!(failure.interrupted);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(started.elapsed() < Duration::from_secs(5));
    }
}
