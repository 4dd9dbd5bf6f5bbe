use std::{collections::HashMap, path::Path, path::PathBuf, time::Duration};

use figment::{providers::Format, Figment};
use serde::{Deserialize, Serialize};

#[derive(Debug, PartialEq, Serialize, Deserialize, Clone)]
pub struct Config {
    #[serde(default)]
    pub system: ConfigSystem,
    #[serde(default)]
    pub queue: ConfigQueue,
    #[serde(default)]
    pub pipeline: ConfigPipeline,
    pub mqtt: ConfigMqtt,
    pub blob_store: ConfigBlobStore,
    pub record_store: ConfigRecordStore,
}

#[derive(Debug, PartialEq, Serialize, Deserialize, Clone)]
pub struct ConfigSystem {
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for ConfigSystem {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
        }
    }
}

/// What the orchestrator does with a new alert when the queue is at capacity.
#[derive(Debug, PartialEq, Eq, Serialize, Deserialize, Clone, Copy)]
#[serde(rename_all = "snake_case")]
pub enum FullQueuePolicy {
    Reject,
    Block,
}

#[derive(Debug, PartialEq, Serialize, Deserialize, Clone)]
pub struct ConfigQueue {
    #[serde(default = "default_queue_path")]
    pub path: PathBuf,
    #[serde(default = "default_capacity")]
    pub capacity: usize,
    #[serde(default = "default_on_full")]
    pub on_full: FullQueuePolicy,
    #[serde(default = "default_block_timeout_ms")]
    pub block_timeout_ms: u64,
}

impl ConfigQueue {
    pub fn block_timeout(&self) -> Duration {
        Duration::from_millis(self.block_timeout_ms)
    }
}

impl Default for ConfigQueue {
    fn default() -> Self {
        Self {
            path: default_queue_path(),
            capacity: default_capacity(),
            on_full: default_on_full(),
            block_timeout_ms: default_block_timeout_ms(),
        }
    }
}

#[derive(Debug, PartialEq, Serialize, Deserialize, Clone)]
pub struct ConfigPipeline {
    #[serde(default = "default_cooldown_secs")]
    pub cooldown_secs: u64,
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
    #[serde(default = "default_backoff_cap_ms")]
    pub backoff_cap_ms: u64,
    /// Fraction of the computed delay that is randomly added or removed
    #[serde(default = "default_backoff_jitter")]
    pub backoff_jitter: f64,
    #[serde(default = "default_phase_timeout_ms")]
    pub phase_timeout_ms: u64,
    #[serde(default = "default_shutdown_grace_ms")]
    pub shutdown_grace_ms: u64,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_watched_classes")]
    pub watched_classes: Vec<String>,
    #[serde(default = "default_min_confidence")]
    pub min_confidence: f32,
}

impl ConfigPipeline {
    pub fn cooldown(&self) -> Duration {
        Duration::from_secs(self.cooldown_secs)
    }
    pub fn phase_timeout(&self) -> Duration {
        Duration::from_millis(self.phase_timeout_ms)
    }
    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

impl Default for ConfigPipeline {
    fn default() -> Self {
        Self {
            cooldown_secs: default_cooldown_secs(),
            workers: default_workers(),
            max_attempts: default_max_attempts(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_cap_ms: default_backoff_cap_ms(),
            backoff_jitter: default_backoff_jitter(),
            phase_timeout_ms: default_phase_timeout_ms(),
            shutdown_grace_ms: default_shutdown_grace_ms(),
            poll_interval_ms: default_poll_interval_ms(),
            watched_classes: default_watched_classes(),
            min_confidence: default_min_confidence(),
        }
    }
}

#[derive(Debug, PartialEq, Serialize, Deserialize, Clone)]
pub struct ConfigMqtt {
    pub address: String,
    pub port: u16,
    #[serde(default = "default_client_id")]
    pub client_id: String,
    pub username: Option<String>,
    pub password: Option<String>,
    /// Topic alerts are published to unless the camera has its own entry in `camera_topics`
    pub topic: String,
    #[serde(default)]
    pub camera_topics: HashMap<String, String>,
    #[serde(default = "default_base_topic")]
    pub base_topic: String,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    pub tls: Option<ConfigTls>,
}

impl ConfigMqtt {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

#[derive(Debug, PartialEq, Serialize, Deserialize, Clone)]
pub struct ConfigTls {
    pub ca_path: PathBuf,
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
}

#[derive(Debug, PartialEq, Serialize, Deserialize, Clone)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ConfigBlobStore {
    Http {
        url: String,
        /// Base of the URL recorded in alerts, when it differs from the upload URL
        public_url: Option<String>,
        token: Option<String>,
    },
    Filesystem {
        directory: PathBuf,
        public_url: Option<String>,
    },
}

#[derive(Debug, PartialEq, Serialize, Deserialize, Clone)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ConfigRecordStore {
    Http { url: String, token: Option<String> },
    Sqlite { path: PathBuf },
}

fn default_log_level() -> String {
    "info".into()
}
fn default_queue_path() -> PathBuf {
    "alert_queue.db".into()
}
fn default_capacity() -> usize {
    1000
}
fn default_on_full() -> FullQueuePolicy {
    FullQueuePolicy::Reject
}
fn default_block_timeout_ms() -> u64 {
    5_000
}
fn default_cooldown_secs() -> u64 {
    10
}
fn default_workers() -> usize {
    4
}
fn default_max_attempts() -> u32 {
    8
}
fn default_backoff_base_ms() -> u64 {
    1_000
}
fn default_backoff_cap_ms() -> u64 {
    300_000
}
fn default_backoff_jitter() -> f64 {
    0.2
}
fn default_phase_timeout_ms() -> u64 {
    30_000
}
fn default_shutdown_grace_ms() -> u64 {
    10_000
}
fn default_poll_interval_ms() -> u64 {
    1_000
}
fn default_watched_classes() -> Vec<String> {
    vec!["person".into(), "car".into(), "truck".into()]
}
fn default_min_confidence() -> f32 {
    0.5
}
fn default_client_id() -> String {
    "alert-sink".into()
}
fn default_base_topic() -> String {
    "alert_sink".into()
}
fn default_connect_timeout_ms() -> u64 {
    10_000
}

const MAX_BACKOFF_CAP_MS: u64 = 24 * 60 * 60 * 1000;

pub fn load_config(path: impl AsRef<Path>) -> Result<Config, String> {
    extract_config(
        Figment::new()
            .merge(figment::providers::Toml::file(path))
            .merge(figment::providers::Env::prefixed("ALERTSINK_").split("__")),
    )
}

fn extract_config(figment: Figment) -> Result<Config, String> {
    let cfg: Config = figment.extract().map_err(|e| e.to_string())?;

    let pipeline = &cfg.pipeline;
    if pipeline.workers == 0 {
        return Err("pipeline.workers must be at least 1".into());
    }
    if pipeline.max_attempts == 0 {
        return Err("pipeline.max_attempts must be at least 1".into());
    }
    if !(0.0..=1.0).contains(&pipeline.backoff_jitter) {
        return Err(format!(
            "pipeline.backoff_jitter must be between 0 and 1, got {}",
            pipeline.backoff_jitter
        ));
    }
    if pipeline.backoff_cap_ms < pipeline.backoff_base_ms {
        return Err(format!(
            "pipeline.backoff_cap_ms ({}) is lower than pipeline.backoff_base_ms ({})",
            pipeline.backoff_cap_ms, pipeline.backoff_base_ms
        ));
    }
    if pipeline.backoff_cap_ms > MAX_BACKOFF_CAP_MS {
        return Err(format!(
            "pipeline.backoff_cap_ms ({}) exceeds one day ({})",
            pipeline.backoff_cap_ms, MAX_BACKOFF_CAP_MS
        ));
    }
    if cfg.queue.capacity == 0 {
        return Err("queue.capacity must be at least 1".into());
    }
    // Topics are used verbatim, so wildcards would be rejected by the broker on every publish
    for topic in std::iter::once(&cfg.mqtt.topic).chain(cfg.mqtt.camera_topics.values()) {
        if topic.is_empty() || topic.contains('+') || topic.contains('#') {
            return Err(format!("Invalid MQTT alert topic: {:?}", topic));
        }
    }
    Ok(cfg)
}
