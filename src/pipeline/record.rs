use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display, EnumString};
use uuid::Uuid;

use crate::detection::DetectionEvent;

#[derive(
    Debug, PartialEq, Eq, Deserialize, Serialize, Clone, Copy, Display, EnumString, AsRefStr,
)]
pub enum AlertStatus {
    New,
    Uploading,
    Uploaded,
    Publishing,
    Published,
    Recording,
    Recorded,
    RetryPending,
    Failed,
}

/// Where the captured image currently lives
#[derive(PartialEq, Clone)]
pub enum ImageRef {
    Local(Vec<u8>),
    Remote(String),
}

impl ImageRef {
    pub fn remote_url(&self) -> Option<&str> {
        match self {
            ImageRef::Local(_) => None,
            ImageRef::Remote(url) => Some(url),
        }
    }
}

impl std::fmt::Debug for ImageRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ImageRef::Local(bytes) => write!(f, "Local({} bytes)", bytes.len()),
            ImageRef::Remote(url) => write!(f, "Remote({})", url),
        }
    }
}

#[derive(Debug, PartialEq, Clone)]
pub struct AlertRecord {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub object_type: String,
    pub camera_id: String,
    pub latitude: f64,
    pub longitude: f64,
    pub image_ref: ImageRef,
    pub status: AlertStatus,
    pub attempt_count: u32,
    pub next_retry_at: DateTime<Utc>,
    pub last_error: Option<String>,
}

impl AlertRecord {
    /// Builds a fresh record for an admitted detection. It is ready for delivery immediately.
    pub fn new(id: Uuid, event: DetectionEvent, now: DateTime<Utc>) -> Self {
        AlertRecord {
            id,
            timestamp: event.captured_at,
            object_type: event.object_type,
            camera_id: event.camera_id,
            latitude: event.latitude,
            longitude: event.longitude,
            image_ref: ImageRef::Local(event.image),
            status: AlertStatus::New,
            attempt_count: 0,
            next_retry_at: now,
            last_error: None,
        }
    }

    /// Blob store key. Derived only from the id so repeated uploads land on the same object.
    pub fn blob_key(&self) -> String {
        format!("alerts/{}.jpeg", self.id)
    }

    /// The announcement sent to subscribers. Only available once the image has been uploaded.
    pub fn message(&self) -> Option<AlertMessage> {
        Some(AlertMessage {
            id: self.id,
            timestamp: self.timestamp.to_rfc3339_opts(SecondsFormat::Millis, true),
            object_type: self.object_type.clone(),
            latitude: self.latitude,
            longitude: self.longitude,
            camera_id: self.camera_id.clone(),
            image_ref: self.image_ref.remote_url()?.to_string(),
        })
    }
}

/// Broker payload. Field order is part of the wire format.
#[derive(Debug, PartialEq, Deserialize, Serialize, Clone)]
pub struct AlertMessage {
    pub id: Uuid,
    pub timestamp: String,
    pub object_type: String,
    pub latitude: f64,
    pub longitude: f64,
    pub camera_id: String,
    pub image_ref: String,
}

/// The row written to the record store
#[derive(Debug, PartialEq, Deserialize, Serialize, Clone)]
pub struct AlertDocument {
    #[serde(flatten)]
    pub alert: AlertMessage,
    pub status: AlertStatus,
}

#[cfg(test)]
pub(crate) mod test {
    use chrono::{TimeZone, Utc};
    use uuid::Uuid;

    use super::{AlertDocument, AlertRecord, AlertStatus, ImageRef};
    use crate::detection::{BoundingBox, DetectionEvent};

    pub fn sample_event(camera_id: &str, object_type: &str) -> DetectionEvent {
        DetectionEvent {
            object_type: object_type.into(),
            confidence: 0.91,
            bbox: BoundingBox {
                x1: 10,
                y1: 20,
                x2: 110,
                y2: 220,
            },
            camera_id: camera_id.into(),
            latitude: 17.5987567,
            longitude: 78.4172736,
            image: vec![0xff, 0xd8, 0xff, 0xe0],
            captured_at: Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap(),
        }
    }

    pub fn sample_record() -> AlertRecord {
        AlertRecord::new(
            Uuid::parse_str("5b1f7c2e-8a0d-4a39-9c59-0e3f2f6a1d11").unwrap(),
            sample_event("cam_01", "person"),
            Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 1).unwrap(),
        )
    }

    #[test]
    fn test_new_record() {
        let record = sample_record();
        assert_eq!(record.status, AlertStatus::New);
        assert_eq!(record.attempt_count, 0);
        assert_eq!(record.next_retry_at, Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 1).unwrap());
        assert_eq!(record.image_ref, ImageRef::Local(vec![0xff, 0xd8, 0xff, 0xe0]));
        assert_eq!(
            record.blob_key(),
            "alerts/5b1f7c2e-8a0d-4a39-9c59-0e3f2f6a1d11.jpeg"
        );
    }

    #[test]
    fn test_message_requires_upload() {
        let mut record = sample_record();
        assert!(record.message().is_none());

        record.image_ref = ImageRef::Remote("https://bucket/alerts/x.jpeg".into());
        let payload = serde_json::to_string(&record.message().unwrap()).unwrap();
        insta::assert_snapshot!(payload, @r###"{"id":"5b1f7c2e-8a0d-4a39-9c59-0e3f2f6a1d11","timestamp":"2024-05-01T12:00:00.000Z","object_type":"person","latitude":17.5987567,"longitude":78.4172736,"camera_id":"cam_01","image_ref":"https://bucket/alerts/x.jpeg"}"###);
    }

    #[test]
    fn test_document_carries_status() {
        let mut record = sample_record();
        record.image_ref = ImageRef::Remote("https://bucket/alerts/x.jpeg".into());
        let document = AlertDocument {
            alert: record.message().unwrap(),
            status: AlertStatus::Recorded,
        };
        let value = serde_json::to_value(&document).unwrap();
        assert_eq!(value["status"], "Recorded");
        assert_eq!(value["camera_id"], "cam_01");
        let back: AlertDocument = serde_json::from_value(value).unwrap();
        assert_eq!(back, document);
    }

    #[test]
    fn test_status_strings() {
        assert_eq!(AlertStatus::RetryPending.as_ref(), "RetryPending");
        assert_eq!("Publishing".parse::<AlertStatus>(), Ok(AlertStatus::Publishing));
        assert!("Bogus".parse::<AlertStatus>().is_err());
    }
}
