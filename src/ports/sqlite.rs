use std::{
    path::Path,
    sync::{Arc, Mutex},
};

use async_trait::async_trait;
use chrono::Utc;
use rusqlite::{params, Connection};
use uuid::Uuid;

use super::{PortError, RecordStore};
use crate::pipeline::AlertDocument;

/// Local record store: one row per alert id in an `alert_records` table
#[derive(Clone)]
pub struct SqliteRecordStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteRecordStore {
    pub fn open(path: impl AsRef<Path>) -> rusqlite::Result<Self> {
        Self::with_connection(Connection::open(path)?)
    }

    #[cfg(test)]
    pub fn open_in_memory() -> rusqlite::Result<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> rusqlite::Result<Self> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS alert_records (
                id TEXT PRIMARY KEY,
                timestamp TEXT NOT NULL,
                object_type TEXT NOT NULL,
                latitude REAL NOT NULL,
                longitude REAL NOT NULL,
                camera_id TEXT NOT NULL,
                image_ref TEXT NOT NULL,
                status TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );",
        )?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    #[cfg(test)]
    pub fn count(&self) -> usize {
        let conn = self.conn.lock().unwrap();
        conn.query_row("SELECT COUNT(*) FROM alert_records", [], |row| {
            row.get::<_, i64>(0)
        })
        .unwrap() as usize
    }
}

#[async_trait]
impl RecordStore for SqliteRecordStore {
    async fn upsert(&self, id: Uuid, record: &AlertDocument) -> Result<(), PortError> {
        let conn = self.conn.clone();
        let record = record.clone();
        tokio::task::spawn_blocking(move || {
            let conn = conn
                .lock()
                .map_err(|_| PortError::Transient("record store lock poisoned".into()))?;
            conn.execute(
                "INSERT INTO alert_records (id, timestamp, object_type, latitude, longitude, camera_id, image_ref, status, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
                 ON CONFLICT(id) DO UPDATE SET
                    timestamp = excluded.timestamp,
                    object_type = excluded.object_type,
                    latitude = excluded.latitude,
                    longitude = excluded.longitude,
                    camera_id = excluded.camera_id,
                    image_ref = excluded.image_ref,
                    status = excluded.status,
                    updated_at = excluded.updated_at",
                params![
                    id.to_string(),
                    record.alert.timestamp,
                    record.alert.object_type,
                    record.alert.latitude,
                    record.alert.longitude,
                    record.alert.camera_id,
                    record.alert.image_ref,
                    record.status.as_ref(),
                    Utc::now().to_rfc3339(),
                ],
            )
            .map_err(|e| PortError::Transient(e.to_string()))?;
            Ok(())
        })
        .await
        .map_err(|e| PortError::Transient(format!("record store task failed: {}", e)))?
    }
}

#[cfg(test)]
mod test {
    use super::SqliteRecordStore;
    use crate::{
        pipeline::record::{test::sample_record, AlertDocument, AlertStatus, ImageRef},
        ports::RecordStore,
    };

    #[tokio::test]
    async fn test_upsert_is_idempotent() {
        let store = SqliteRecordStore::open_in_memory().unwrap();
        let mut record = sample_record();
        record.image_ref = ImageRef::Remote("https://cdn/alerts/x.jpeg".into());
        let document = AlertDocument {
            alert: record.message().unwrap(),
            status: AlertStatus::Recorded,
        };

        store.upsert(record.id, &document).await.unwrap();
        store.upsert(record.id, &document).await.unwrap();
        assert_eq!(store.count(), 1);
    }
}
