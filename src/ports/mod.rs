//! Remote capabilities the delivery pipeline commits alerts to.
//!
//! Every call is keyed by the alert id so that repeating it after a partial failure is harmless.

mod filesystem;
mod http;
mod sqlite;
#[cfg(test)]
pub mod testing;

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
    config::{ConfigBlobStore, ConfigRecordStore},
    pipeline::AlertDocument,
};

pub use filesystem::FsBlobStore;
pub use http::{HttpBlobStore, HttpRecordStore};
pub use sqlite::SqliteRecordStore;

#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Stores `bytes` under `key`, overwriting any previous object, and returns its URL
    async fn put(&self, key: &str, bytes: &[u8]) -> Result<String, PortError>;
}

#[async_trait]
pub trait MessageBroker: Send + Sync {
    async fn publish(&self, topic: &str, payload: Vec<u8>, qos: Qos) -> Result<(), PortError>;
}

#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Inserts or replaces the record for `id`
    async fn upsert(&self, id: Uuid, record: &AlertDocument) -> Result<(), PortError>;
}

/// Client handles shared by every delivery worker
#[derive(Clone)]
pub struct Ports {
    pub blobs: Arc<dyn BlobStore>,
    pub broker: Arc<dyn MessageBroker>,
    pub records: Arc<dyn RecordStore>,
}

#[derive(Debug, PartialEq, Eq, Serialize, Deserialize, Clone, Copy)]
#[allow(clippy::enum_variant_names)]
pub enum Qos {
    AtMostOnce = 0,
    AtLeastOnce = 1,
    ExactlyOnce = 2,
}

quick_error! {
    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub enum PortError {
        /// Timeouts, connection loss, throttling and server-side failures
        Transient(reason: String) {
            display("Temporary failure: {}", reason)
        }
        /// The remote refused the request itself; retrying the same request is unlikely to help
        Rejected(reason: String) {
            display("Request rejected: {}", reason)
        }
        /// Credentials were refused. These never resolve on their own.
        Unauthorized(reason: String) {
            display("Not authorized: {}", reason)
        }
    }
}

impl PortError {
    pub fn is_unauthorized(&self) -> bool {
        matches!(self, PortError::Unauthorized(_))
    }

    /// Classifies a non-success HTTP status
    pub fn from_status(status: reqwest::StatusCode, context: &str) -> Self {
        let reason = format!("{} returned {}", context, status);
        match status.as_u16() {
            401 | 403 => PortError::Unauthorized(reason),
            408 | 429 => PortError::Transient(reason),
            s if s >= 500 => PortError::Transient(reason),
            _ => PortError::Rejected(reason),
        }
    }

    pub fn from_reqwest(error: reqwest::Error) -> Self {
        if let Some(status) = error.status() {
            return Self::from_status(status, "Server");
        }
        if error.is_builder() {
            PortError::Rejected(error.to_string())
        } else {
            PortError::Transient(error.to_string())
        }
    }
}

pub async fn blob_store_from_config(cfg: &ConfigBlobStore) -> Result<Arc<dyn BlobStore>, String> {
    Ok(match cfg {
        ConfigBlobStore::Http {
            url,
            public_url,
            token,
        } => Arc::new(HttpBlobStore::new(
            url.clone(),
            public_url.clone(),
            token.clone(),
        )?),
        ConfigBlobStore::Filesystem {
            directory,
            public_url,
        } => Arc::new(
            FsBlobStore::create(directory.clone(), public_url.clone())
                .await
                .map_err(|e| format!("Unable to use blob directory {:?}: {}", directory, e))?,
        ),
    })
}

pub fn record_store_from_config(cfg: &ConfigRecordStore) -> Result<Arc<dyn RecordStore>, String> {
    Ok(match cfg {
        ConfigRecordStore::Http { url, token } => {
            Arc::new(HttpRecordStore::new(url.clone(), token.clone())?)
        }
        ConfigRecordStore::Sqlite { path } => Arc::new(
            SqliteRecordStore::open(path)
                .map_err(|e| format!("Unable to open record store {:?}: {}", path, e))?,
        ),
    })
}
