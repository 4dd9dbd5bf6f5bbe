use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, PartialEq, Eq, Deserialize, Serialize, Clone, Copy)]
pub struct BoundingBox {
    pub x1: u32,
    pub y1: u32,
    pub x2: u32,
    pub y2: u32,
}

/// One confirmed detection handed over by the detector
#[derive(Debug, PartialEq, Clone)]
pub struct DetectionEvent {
    pub object_type: String,
    pub confidence: f32,
    pub bbox: BoundingBox,
    pub camera_id: String,
    pub latitude: f64,
    pub longitude: f64,
    pub image: Vec<u8>,
    pub captured_at: DateTime<Utc>,
}

impl DetectionEvent {
    /// Rejects events that could never produce a deliverable alert
    pub fn validate(&self) -> Result<(), EventError> {
        if self.object_type.trim().is_empty() {
            return Err(EventError::FieldMissing("object_type".into()));
        }
        if self.camera_id.trim().is_empty() {
            return Err(EventError::FieldMissing("camera_id".into()));
        }
        if !(0.0..=1.0).contains(&self.confidence) {
            return Err(EventError::FieldInvalid(
                "confidence".into(),
                format!("{} is not between 0 and 1", self.confidence),
            ));
        }
        if !(-90.0..=90.0).contains(&self.latitude) {
            return Err(EventError::FieldInvalid(
                "latitude".into(),
                format!("{} is out of range", self.latitude),
            ));
        }
        if !(-180.0..=180.0).contains(&self.longitude) {
            return Err(EventError::FieldInvalid(
                "longitude".into(),
                format!("{} is out of range", self.longitude),
            ));
        }
        if self.bbox.x2 < self.bbox.x1 || self.bbox.y2 < self.bbox.y1 {
            return Err(EventError::FieldInvalid(
                "bbox".into(),
                "corners are inverted".into(),
            ));
        }
        if self.image.is_empty() {
            return Err(EventError::FieldMissing("image".into()));
        }
        Ok(())
    }
}

/// Wire form of a detection as written by the detector, one JSON object per line.
/// The image crop is referenced by path rather than inlined.
#[derive(Debug, PartialEq, Deserialize, Serialize, Clone)]
pub struct DetectionLine {
    pub object_type: String,
    pub confidence: f32,
    pub bbox: BoundingBox,
    pub camera_id: String,
    pub latitude: f64,
    pub longitude: f64,
    pub image_path: PathBuf,
    pub captured_at: Option<DateTime<Utc>>,
}

impl DetectionLine {
    pub fn parse(s: &str) -> Result<DetectionLine, EventError> {
        Ok(serde_json::from_str(s)?)
    }

    pub fn into_event(self, image: Vec<u8>, received_at: DateTime<Utc>) -> DetectionEvent {
        DetectionEvent {
            object_type: self.object_type,
            confidence: self.confidence,
            bbox: self.bbox,
            camera_id: self.camera_id,
            latitude: self.latitude,
            longitude: self.longitude,
            image,
            captured_at: self.captured_at.unwrap_or(received_at),
        }
    }
}

quick_error! {
    #[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
    pub enum EventError {
        JsonInvalid(error: String) {
            display("Detection is not valid JSON: {}", error)
            from(e: serde_json::Error) -> (e.to_string())
        }
        FieldMissing(field: String) {
            display("Field was expected but missing: {}", field)
        }
        FieldInvalid(field: String, reason: String) {
            display("Field {} is invalid: {}", field, reason)
        }
        ImageUnreadable(path: String, error: String) {
            display("Unable to read image {}: {}", path, error)
        }
    }
}
