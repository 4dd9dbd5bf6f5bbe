//! In-memory ports whose failures can be scripted

use std::{
    collections::{HashMap, VecDeque},
    sync::{Arc, Mutex},
    time::Duration,
};

use async_trait::async_trait;
use uuid::Uuid;

use super::{BlobStore, MessageBroker, PortError, Ports, Qos, RecordStore};
use crate::pipeline::AlertDocument;

/// Failures handed out one per call before calls start succeeding, or forever if `always` is set
#[derive(Default)]
pub struct FailureScript {
    queued: Mutex<VecDeque<PortError>>,
    always: Option<PortError>,
}

impl FailureScript {
    pub fn once(errors: Vec<PortError>) -> Self {
        Self {
            queued: Mutex::new(errors.into()),
            always: None,
        }
    }

    pub fn always(error: PortError) -> Self {
        Self {
            queued: Mutex::default(),
            always: Some(error),
        }
    }

    fn next(&self) -> Result<(), PortError> {
        if let Some(e) = self.queued.lock().unwrap().pop_front() {
            return Err(e);
        }
        match &self.always {
            Some(e) => Err(e.clone()),
            None => Ok(()),
        }
    }
}

#[derive(Default)]
pub struct MemoryBlobStore {
    pub objects: Mutex<HashMap<String, Vec<u8>>>,
    pub writes: Mutex<usize>,
    pub calls: Mutex<usize>,
    pub delay: Option<Duration>,
    script: FailureScript,
}

impl MemoryBlobStore {
    pub fn failing(script: FailureScript) -> Self {
        Self {
            script,
            ..Default::default()
        }
    }

    pub fn slow(delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..Default::default()
        }
    }

    pub fn object_count(&self) -> usize {
        self.objects.lock().unwrap().len()
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn put(&self, key: &str, bytes: &[u8]) -> Result<String, PortError> {
        *self.calls.lock().unwrap() += 1;
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.script.next()?;
        self.objects
            .lock()
            .unwrap()
            .insert(key.to_string(), bytes.to_vec());
        *self.writes.lock().unwrap() += 1;
        Ok(format!("mem://{}", key))
    }
}

#[derive(Default)]
pub struct MemoryBroker {
    pub published: Mutex<Vec<(String, Vec<u8>, Qos)>>,
    script: FailureScript,
}

impl MemoryBroker {
    pub fn failing(script: FailureScript) -> Self {
        Self {
            script,
            ..Default::default()
        }
    }

    /// Distinct alert ids seen by a subscriber that dedupes on id
    pub fn distinct_ids(&self) -> usize {
        let published = self.published.lock().unwrap();
        let mut ids: Vec<String> = published
            .iter()
            .map(|(_, payload, _)| {
                let value: serde_json::Value = serde_json::from_slice(payload).unwrap();
                value["id"].as_str().unwrap().to_string()
            })
            .collect();
        ids.sort();
        ids.dedup();
        ids.len()
    }
}

#[async_trait]
impl MessageBroker for MemoryBroker {
    async fn publish(&self, topic: &str, payload: Vec<u8>, qos: Qos) -> Result<(), PortError> {
        self.script.next()?;
        self.published
            .lock()
            .unwrap()
            .push((topic.to_string(), payload, qos));
        Ok(())
    }
}

#[derive(Default)]
pub struct MemoryRecordStore {
    pub records: Mutex<HashMap<Uuid, AlertDocument>>,
    pub upserts: Mutex<usize>,
    script: FailureScript,
}

impl MemoryRecordStore {
    pub fn failing(script: FailureScript) -> Self {
        Self {
            script,
            ..Default::default()
        }
    }

    pub fn get(&self, id: Uuid) -> Option<AlertDocument> {
        self.records.lock().unwrap().get(&id).cloned()
    }

    pub fn len(&self) -> usize {
        self.records.lock().unwrap().len()
    }
}

#[async_trait]
impl RecordStore for MemoryRecordStore {
    async fn upsert(&self, id: Uuid, record: &AlertDocument) -> Result<(), PortError> {
        self.script.next()?;
        self.records.lock().unwrap().insert(id, record.clone());
        *self.upserts.lock().unwrap() += 1;
        Ok(())
    }
}

/// Concrete handles kept by a test alongside the type-erased [`Ports`]
pub struct MemoryPorts {
    pub blobs: Arc<MemoryBlobStore>,
    pub broker: Arc<MemoryBroker>,
    pub records: Arc<MemoryRecordStore>,
}

impl MemoryPorts {
    pub fn new(blobs: MemoryBlobStore, broker: MemoryBroker, records: MemoryRecordStore) -> Self {
        Self {
            blobs: Arc::new(blobs),
            broker: Arc::new(broker),
            records: Arc::new(records),
        }
    }

    pub fn healthy() -> Self {
        Self::new(
            MemoryBlobStore::default(),
            MemoryBroker::default(),
            MemoryRecordStore::default(),
        )
    }

    pub fn ports(&self) -> Ports {
        Ports {
            blobs: self.blobs.clone(),
            broker: self.broker.clone(),
            records: self.records.clone(),
        }
    }
}
