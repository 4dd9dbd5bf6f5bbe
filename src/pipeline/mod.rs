mod backoff;
mod commit;
mod dedup;
mod orchestrator;
mod queue;
pub mod record;
mod worker;

pub use commit::TopicMap;
pub use orchestrator::{AdmissionSettings, Orchestrator, Pipeline};
pub use queue::DurableQueue;
pub use record::AlertDocument;
pub use worker::WorkerSettings;
