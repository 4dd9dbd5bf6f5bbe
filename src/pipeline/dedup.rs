use std::{collections::HashMap, time::Duration};

use chrono::{DateTime, Utc};

/// Suppresses repeated alerts for the same camera and object class within a cooldown window.
///
/// State is in-memory only; a restart forgets every cooldown.
#[derive(Debug, Clone)]
pub struct Deduplicator {
    cooldown: chrono::Duration,
    last_admitted: HashMap<(String, String), DateTime<Utc>>,
}

impl Deduplicator {
    pub fn new(cooldown: Duration) -> Self {
        Self {
            cooldown: chrono::Duration::from_std(cooldown).unwrap_or(chrono::TimeDelta::MAX),
            last_admitted: HashMap::new(),
        }
    }

    /// Returns `true` and starts a new cooldown if the pair is not currently cooling down
    pub fn admit(&mut self, camera_id: &str, object_type: &str, now: DateTime<Utc>) -> bool {
        let key = (camera_id.to_string(), object_type.to_string());
        if let Some(last) = self.last_admitted.get(&key) {
            if now.signed_duration_since(*last) < self.cooldown {
                return false;
            }
        }
        self.last_admitted.insert(key, now);
        true
    }

    /// Clears the cooldown for a pair whose admitted event never made it into the queue
    pub fn forget(&mut self, camera_id: &str, object_type: &str) {
        self.last_admitted
            .remove(&(camera_id.to_string(), object_type.to_string()));
    }

    /// Drops pairs whose cooldown has elapsed. Does not change what `admit` returns.
    pub fn prune(&mut self, now: DateTime<Utc>) {
        let cooldown = self.cooldown;
        self.last_admitted
            .retain(|_, last| now.signed_duration_since(*last) < cooldown);
    }

    pub fn tracked(&self) -> usize {
        self.last_admitted.len()
    }
}
