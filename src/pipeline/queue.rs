//! Crash-safe holding area for alerts awaiting delivery.
//!
//! Every mutation is committed to SQLite (WAL, `synchronous=FULL`) before the call returns.
//! A single lock serializes access; claims handed out by [`DurableQueue::next_ready`] live in
//! memory only, so a restart releases them all.

use std::{
    collections::HashSet,
    path::Path,
    sync::{Mutex, MutexGuard},
};

use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{params, Connection, Row};
use tokio::sync::Notify;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{
    backoff::Backoff,
    record::{AlertRecord, AlertStatus, ImageRef},
};

const SCHEMA_VERSION: i32 = 1;

const SCHEMA_V1: &str = "
CREATE TABLE alert_queue (
    seq INTEGER PRIMARY KEY AUTOINCREMENT,
    id TEXT NOT NULL UNIQUE,
    enqueued_at INTEGER NOT NULL,
    timestamp TEXT NOT NULL,
    object_type TEXT NOT NULL,
    camera_id TEXT NOT NULL,
    latitude REAL NOT NULL,
    longitude REAL NOT NULL,
    image BLOB,
    image_url TEXT,
    status TEXT NOT NULL,
    attempt_count INTEGER NOT NULL DEFAULT 0,
    next_retry_at INTEGER NOT NULL,
    last_error TEXT
);
CREATE INDEX alert_queue_ready ON alert_queue (next_retry_at, seq);
CREATE TABLE dead_letter (
    seq INTEGER NOT NULL,
    id TEXT PRIMARY KEY,
    enqueued_at INTEGER NOT NULL,
    timestamp TEXT NOT NULL,
    object_type TEXT NOT NULL,
    camera_id TEXT NOT NULL,
    latitude REAL NOT NULL,
    longitude REAL NOT NULL,
    image BLOB,
    image_url TEXT,
    status TEXT NOT NULL,
    attempt_count INTEGER NOT NULL,
    next_retry_at INTEGER NOT NULL,
    last_error TEXT,
    failed_at INTEGER NOT NULL
);
";

const ENTRY_COLUMNS: &str = "seq, id, enqueued_at, timestamp, object_type, camera_id, latitude, \
     longitude, image, image_url, status, attempt_count, next_retry_at, last_error";

/// Identifies one claimed or stored entry
#[derive(Debug, PartialEq, Eq, Hash, Clone, Copy)]
pub struct EntryHandle {
    seq: i64,
    id: Uuid,
}

impl EntryHandle {
    pub fn id(&self) -> Uuid {
        self.id
    }
    /// Position in enqueue order
    pub fn position(&self) -> i64 {
        self.seq
    }
}

#[derive(Debug, PartialEq, Clone)]
pub struct QueueEntry {
    pub handle: EntryHandle,
    pub enqueued_at: DateTime<Utc>,
    pub record: AlertRecord,
}

#[derive(Debug, PartialEq, Clone)]
pub struct DeadLetter {
    pub record: AlertRecord,
    pub enqueued_at: DateTime<Utc>,
    pub failed_at: DateTime<Utc>,
}

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub struct RetryScheduled {
    pub attempt_count: u32,
    pub next_retry_at: DateTime<Utc>,
}

pub struct DurableQueue {
    inner: Mutex<QueueInner>,
    capacity: usize,
    work_available: Notify,
    space_available: Notify,
}

struct QueueInner {
    conn: Connection,
    claimed: HashSet<i64>,
}

impl DurableQueue {
    pub fn open(path: impl AsRef<Path>, capacity: usize) -> Result<Self, QueueError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| QueueError::Io(parent.display().to_string(), e))?;
            }
        }
        let conn = Connection::open(path)?;
        let mode: String =
            conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
        if !mode.eq_ignore_ascii_case("wal") {
            warn!(mode=%mode, "Queue database refused WAL journal mode");
        }
        conn.pragma_update(None, "synchronous", "FULL")?;
        Self::with_connection(conn, capacity)
    }

    #[cfg(test)]
    pub fn open_in_memory(capacity: usize) -> Result<Self, QueueError> {
        Self::with_connection(Connection::open_in_memory()?, capacity)
    }

    fn with_connection(mut conn: Connection, capacity: usize) -> Result<Self, QueueError> {
        migrate(&mut conn)?;
        Ok(Self {
            inner: Mutex::new(QueueInner {
                conn,
                claimed: HashSet::new(),
            }),
            capacity,
            work_available: Notify::new(),
            space_available: Notify::new(),
        })
    }

    fn lock(&self) -> MutexGuard<'_, QueueInner> {
        // A panic while holding the lock cannot leave SQLite half-written, so the state is still usable
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Number of entries in the active queue, claimed or not
    pub fn len(&self) -> Result<usize, QueueError> {
        let inner = self.lock();
        let count: i64 = inner
            .conn
            .query_row("SELECT COUNT(*) FROM alert_queue", [], |row| row.get(0))?;
        Ok(count as usize)
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> Result<bool, QueueError> {
        Ok(self.len()? == 0)
    }

    /// Persists a new record. Fails with [`QueueError::CapacityExceeded`] rather than evicting anything.
    pub fn append(
        &self,
        record: &AlertRecord,
        now: DateTime<Utc>,
    ) -> Result<EntryHandle, QueueError> {
        let inner = self.lock();
        let count: i64 = inner
            .conn
            .query_row("SELECT COUNT(*) FROM alert_queue", [], |row| row.get(0))?;
        if count as usize >= self.capacity {
            return Err(QueueError::CapacityExceeded(self.capacity));
        }
        let (image, image_url) = image_columns(&record.image_ref);
        inner.conn.execute(
            "INSERT INTO alert_queue (id, enqueued_at, timestamp, object_type, camera_id, latitude, longitude, image, image_url, status, attempt_count, next_retry_at, last_error)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
            params![
                record.id.to_string(),
                now.timestamp_millis(),
                record.timestamp.to_rfc3339(),
                record.object_type,
                record.camera_id,
                record.latitude,
                record.longitude,
                image,
                image_url,
                record.status.as_ref(),
                record.attempt_count,
                record.next_retry_at.timestamp_millis(),
                record.last_error,
            ],
        )?;
        let handle = EntryHandle {
            seq: inner.conn.last_insert_rowid(),
            id: record.id,
        };
        drop(inner);
        self.work_available.notify_one();
        Ok(handle)
    }

    /// Claims the oldest entry that is due. The entry stays invisible to other callers until it is
    /// resolved through `ack`, `retry`, `dead_letter` or `release`.
    pub fn next_ready(&self, now: DateTime<Utc>) -> Result<Option<QueueEntry>, QueueError> {
        let mut guard = self.lock();
        let QueueInner { conn, claimed } = &mut *guard;
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {} FROM alert_queue WHERE next_retry_at <= ?1 ORDER BY seq ASC",
            ENTRY_COLUMNS
        ))?;
        let mut rows = stmt.query(params![now.timestamp_millis()])?;
        while let Some(row) = rows.next()? {
            let seq: i64 = row.get("seq")?;
            if claimed.contains(&seq) {
                continue;
            }
            let entry = entry_from_row(row)?;
            claimed.insert(seq);
            return Ok(Some(entry));
        }
        Ok(None)
    }

    /// Persists progress of a claimed entry through the delivery phases
    pub fn set_status(&self, handle: &EntryHandle, status: AlertStatus) -> Result<(), QueueError> {
        let inner = self.claimed(handle)?;
        inner.conn.execute(
            "UPDATE alert_queue SET status = ?1 WHERE seq = ?2",
            params![status.as_ref(), handle.seq],
        )?;
        Ok(())
    }

    /// Swaps the local image bytes for the uploaded URL and marks the entry `Uploaded`
    pub fn set_uploaded(&self, handle: &EntryHandle, url: &str) -> Result<(), QueueError> {
        let inner = self.claimed(handle)?;
        inner.conn.execute(
            "UPDATE alert_queue SET status = ?1, image = NULL, image_url = ?2 WHERE seq = ?3",
            params![AlertStatus::Uploaded.as_ref(), url, handle.seq],
        )?;
        Ok(())
    }

    /// Delivery succeeded; the entry leaves the queue for good
    pub fn ack(&self, handle: &EntryHandle) -> Result<(), QueueError> {
        let mut inner = self.claimed(handle)?;
        inner
            .conn
            .execute("DELETE FROM alert_queue WHERE seq = ?1", params![handle.seq])?;
        inner.claimed.remove(&handle.seq);
        drop(inner);
        self.space_available.notify_one();
        Ok(())
    }

    /// Counts a failed attempt and schedules the next one
    pub fn retry(
        &self,
        handle: &EntryHandle,
        error: &str,
        backoff: &Backoff,
        now: DateTime<Utc>,
    ) -> Result<RetryScheduled, QueueError> {
        let mut inner = self.claimed(handle)?;
        let attempts: i64 = inner.conn.query_row(
            "SELECT attempt_count FROM alert_queue WHERE seq = ?1",
            params![handle.seq],
            |row| row.get(0),
        )?;
        let attempt_count = attempts as u32 + 1;
        // A delay past what chrono can represent means "not before the end of time"
        let next_retry_at = chrono::Duration::from_std(backoff.delay(attempt_count))
            .ok()
            .and_then(|delay| now.checked_add_signed(delay))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        inner.conn.execute(
            "UPDATE alert_queue SET status = ?1, attempt_count = ?2, next_retry_at = ?3, last_error = ?4 WHERE seq = ?5",
            params![
                AlertStatus::RetryPending.as_ref(),
                attempt_count,
                next_retry_at.timestamp_millis(),
                error,
                handle.seq
            ],
        )?;
        inner.claimed.remove(&handle.seq);
        Ok(RetryScheduled {
            attempt_count,
            next_retry_at,
        })
    }

    /// Counts the final failed attempt and moves the entry to the dead-letter table
    pub fn dead_letter(
        &self,
        handle: &EntryHandle,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<(), QueueError> {
        let mut inner = self.claimed(handle)?;
        let tx = inner.conn.transaction()?;
        tx.execute(
            &format!(
                "INSERT OR REPLACE INTO dead_letter ({cols}, failed_at)
                 SELECT seq, id, enqueued_at, timestamp, object_type, camera_id, latitude, longitude, image, image_url, ?1, attempt_count + 1, next_retry_at, ?2, ?3
                 FROM alert_queue WHERE seq = ?4",
                cols = ENTRY_COLUMNS
            ),
            params![
                AlertStatus::Failed.as_ref(),
                error,
                now.timestamp_millis(),
                handle.seq
            ],
        )?;
        tx.execute("DELETE FROM alert_queue WHERE seq = ?1", params![handle.seq])?;
        tx.commit()?;
        inner.claimed.remove(&handle.seq);
        drop(inner);
        self.space_available.notify_one();
        Ok(())
    }

    /// Gives a claimed entry back untouched
    pub fn release(&self, handle: &EntryHandle) {
        self.lock().claimed.remove(&handle.seq);
        self.work_available.notify_one();
    }

    /// Called once at startup. In-flight statuses are reset to `RetryPending` and made due
    /// immediately, since the outcome of the interrupted remote call is unknown.
    pub fn recover_on_startup(&self, now: DateTime<Utc>) -> Result<Vec<EntryHandle>, QueueError> {
        let mut inner = self.lock();
        inner.claimed.clear();
        let reset = inner.conn.execute(
            "UPDATE alert_queue SET status = ?1, next_retry_at = MIN(next_retry_at, ?2)
             WHERE status IN (?3, ?4, ?5)",
            params![
                AlertStatus::RetryPending.as_ref(),
                now.timestamp_millis(),
                AlertStatus::Uploading.as_ref(),
                AlertStatus::Publishing.as_ref(),
                AlertStatus::Recording.as_ref(),
            ],
        )?;
        let mut stmt = inner
            .conn
            .prepare("SELECT seq, id FROM alert_queue ORDER BY seq ASC")?;
        let mut rows = stmt.query([])?;
        let mut handles = Vec::new();
        while let Some(row) = rows.next()? {
            let id: String = row.get("id")?;
            handles.push(EntryHandle {
                seq: row.get("seq")?,
                id: parse_uuid(&id)?,
            });
        }
        if reset > 0 {
            info!(reset, "Reset interrupted deliveries for replay");
        }
        debug!(recovered = handles.len(), "Queue recovered");
        drop(rows);
        drop(stmt);
        drop(inner);
        if !handles.is_empty() {
            self.work_available.notify_one();
        }
        Ok(handles)
    }

    /// Unclaimed view of every active entry, in enqueue order
    #[cfg(test)]
    pub fn pending(&self) -> Result<Vec<QueueEntry>, QueueError> {
        let inner = self.lock();
        let mut stmt = inner.conn.prepare(&format!(
            "SELECT {} FROM alert_queue ORDER BY seq ASC",
            ENTRY_COLUMNS
        ))?;
        let mut rows = stmt.query([])?;
        let mut entries = Vec::new();
        while let Some(row) = rows.next()? {
            entries.push(entry_from_row(row)?);
        }
        Ok(entries)
    }

    pub fn dead_letters(&self) -> Result<Vec<DeadLetter>, QueueError> {
        let inner = self.lock();
        let mut stmt = inner.conn.prepare(&format!(
            "SELECT {}, failed_at FROM dead_letter ORDER BY failed_at ASC, seq ASC",
            ENTRY_COLUMNS
        ))?;
        let mut rows = stmt.query([])?;
        let mut letters = Vec::new();
        while let Some(row) = rows.next()? {
            let entry = entry_from_row(row)?;
            letters.push(DeadLetter {
                record: entry.record,
                enqueued_at: entry.enqueued_at,
                failed_at: millis_to_datetime(row.get("failed_at")?)?,
            });
        }
        Ok(letters)
    }

    #[cfg(test)]
    pub fn dead_letter_for(&self, id: Uuid) -> Result<Option<DeadLetter>, QueueError> {
        Ok(self
            .dead_letters()?
            .into_iter()
            .find(|letter| letter.record.id == id))
    }

    /// Reads one active entry without claiming it
    #[cfg(test)]
    pub fn get(&self, id: Uuid) -> Result<Option<QueueEntry>, QueueError> {
        use rusqlite::OptionalExtension;
        let inner = self.lock();
        let mut stmt = inner.conn.prepare(&format!(
            "SELECT {} FROM alert_queue WHERE id = ?1",
            ENTRY_COLUMNS
        ))?;
        let row = stmt
            .query_row(params![id.to_string()], |row| Ok(entry_from_row(row)))
            .optional()?;
        row.transpose()
    }

    /// Resolves when an entry may have become ready
    pub async fn work_available(&self) {
        self.work_available.notified().await
    }

    /// Resolves when an entry has left the active queue
    pub async fn space_available(&self) {
        self.space_available.notified().await
    }

    fn claimed(&self, handle: &EntryHandle) -> Result<MutexGuard<'_, QueueInner>, QueueError> {
        let inner = self.lock();
        if !inner.claimed.contains(&handle.seq) {
            return Err(QueueError::NotClaimed(handle.id));
        }
        Ok(inner)
    }
}

fn migrate(conn: &mut Connection) -> Result<(), QueueError> {
    let version: i32 = conn.pragma_query_value(None, "user_version", |row| row.get(0))?;
    if version > SCHEMA_VERSION {
        return Err(QueueError::Corrupt(format!(
            "database schema version {} is newer than supported version {}",
            version, SCHEMA_VERSION
        )));
    }
    if version == SCHEMA_VERSION {
        return Ok(());
    }
    let tx = conn.transaction()?;
    tx.execute_batch(SCHEMA_V1)?;
    tx.pragma_update(None, "user_version", SCHEMA_VERSION)?;
    tx.commit()?;
    Ok(())
}

fn image_columns(image: &ImageRef) -> (Option<&[u8]>, Option<&str>) {
    match image {
        ImageRef::Local(bytes) => (Some(bytes.as_slice()), None),
        ImageRef::Remote(url) => (None, Some(url.as_str())),
    }
}

fn parse_uuid(s: &str) -> Result<Uuid, QueueError> {
    Uuid::parse_str(s).map_err(|e| QueueError::Corrupt(format!("invalid id {:?}: {}", s, e)))
}

fn millis_to_datetime(ms: i64) -> Result<DateTime<Utc>, QueueError> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .ok_or_else(|| QueueError::Corrupt(format!("timestamp {} out of range", ms)))
}

fn entry_from_row(row: &Row) -> Result<QueueEntry, QueueError> {
    let id: String = row.get("id")?;
    let id = parse_uuid(&id)?;
    let timestamp: String = row.get("timestamp")?;
    let timestamp = DateTime::parse_from_rfc3339(&timestamp)
        .map_err(|e| QueueError::Corrupt(format!("invalid timestamp {:?}: {}", timestamp, e)))?
        .with_timezone(&Utc);
    let status: String = row.get("status")?;
    let status = status
        .parse()
        .map_err(|_| QueueError::Corrupt(format!("unknown status {:?}", status)))?;
    let image: Option<Vec<u8>> = row.get("image")?;
    let image_url: Option<String> = row.get("image_url")?;
    let image_ref = match image_url {
        Some(url) => ImageRef::Remote(url),
        None => ImageRef::Local(image.unwrap_or_default()),
    };
    let attempt_count: i64 = row.get("attempt_count")?;

    Ok(QueueEntry {
        handle: EntryHandle {
            seq: row.get("seq")?,
            id,
        },
        enqueued_at: millis_to_datetime(row.get("enqueued_at")?)?,
        record: AlertRecord {
            id,
            timestamp,
            object_type: row.get("object_type")?,
            camera_id: row.get("camera_id")?,
            latitude: row.get("latitude")?,
            longitude: row.get("longitude")?,
            image_ref,
            status,
            attempt_count: attempt_count as u32,
            next_retry_at: millis_to_datetime(row.get("next_retry_at")?)?,
            last_error: row.get("last_error")?,
        },
    })
}

quick_error! {
    #[derive(Debug)]
    pub enum QueueError {
        Storage(error: rusqlite::Error) {
            display("Queue storage failure: {}", error)
            source(error)
            from()
        }
        Io(path: String, error: std::io::Error) {
            display("Unable to prepare queue directory {}: {}", path, error)
            source(error)
        }
        CapacityExceeded(capacity: usize) {
            display("Queue is full ({} entries)", capacity)
        }
        NotClaimed(id: Uuid) {
            display("Entry {} is not claimed", id)
        }
        Corrupt(detail: String) {
            display("Queue contents could not be decoded: {}", detail)
        }
    }
}
