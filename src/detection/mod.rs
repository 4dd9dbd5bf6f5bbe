mod event;
mod intake;

#[cfg(test)]
pub use event::BoundingBox;
pub use event::{DetectionEvent, DetectionLine, EventError};
pub use intake::read_events;
