use std::time::Duration;

use async_trait::async_trait;
use reqwest::{header, RequestBuilder};
use tracing::trace;
use uuid::Uuid;

use super::{BlobStore, PortError, RecordStore};
use crate::pipeline::AlertDocument;

fn build_client() -> Result<reqwest::Client, String> {
    reqwest::Client::builder()
        .tcp_keepalive(Duration::from_secs(60))
        .build()
        .map_err(|e| format!("Unable to build HTTP client: {}", e))
}

fn with_token(request: RequestBuilder, token: &Option<String>) -> RequestBuilder {
    match token {
        Some(token) => request.bearer_auth(token),
        None => request,
    }
}

fn join_url(base: &str, path: &str) -> String {
    format!("{}/{}", base.trim_end_matches('/'), path.trim_start_matches('/'))
}

/// Object store reachable through plain HTTP `PUT` (S3-compatible gateways, MinIO, WebDAV)
pub struct HttpBlobStore {
    client: reqwest::Client,
    url: String,
    public_url: Option<String>,
    token: Option<String>,
}

impl HttpBlobStore {
    pub fn new(url: String, public_url: Option<String>, token: Option<String>) -> Result<Self, String> {
        Ok(Self {
            client: build_client()?,
            url,
            public_url,
            token,
        })
    }

    fn object_url(&self, key: &str) -> String {
        join_url(self.public_url.as_ref().unwrap_or(&self.url), key)
    }
}

#[async_trait]
impl BlobStore for HttpBlobStore {
    async fn put(&self, key: &str, bytes: &[u8]) -> Result<String, PortError> {
        let target = join_url(&self.url, key);
        trace!(url=%target, size=bytes.len(), "Uploading blob");
        let request = self
            .client
            .put(&target)
            .header(header::CONTENT_TYPE, mime::IMAGE_JPEG.as_ref())
            .body(bytes.to_vec());
        let res = with_token(request, &self.token)
            .send()
            .await
            .map_err(PortError::from_reqwest)?;
        if !res.status().is_success() {
            return Err(PortError::from_status(res.status(), "Blob store"));
        }
        Ok(self.object_url(key))
    }
}

/// Record store exposing one JSON document per alert at `{url}/{id}`
pub struct HttpRecordStore {
    client: reqwest::Client,
    url: String,
    token: Option<String>,
}

impl HttpRecordStore {
    pub fn new(url: String, token: Option<String>) -> Result<Self, String> {
        Ok(Self {
            client: build_client()?,
            url,
            token,
        })
    }
}

#[async_trait]
impl RecordStore for HttpRecordStore {
    async fn upsert(&self, id: Uuid, record: &AlertDocument) -> Result<(), PortError> {
        let target = join_url(&self.url, &id.to_string());
        let request = self.client.put(&target).json(record);
        let res = with_token(request, &self.token)
            .send()
            .await
            .map_err(PortError::from_reqwest)?;
        if !res.status().is_success() {
            return Err(PortError::from_status(res.status(), "Record store"));
        }
        Ok(())
    }
}
