//! Error log coalescing.
//!
//! Every failure path funnels through [`ErrorLogDeduplicator::record`]. Observations
//! that share a [`CoalesceKey`] and land within the coalescing window of the newest
//! entry bump its counter instead of writing a new row, so a failure storm costs one
//! entry per burst.

use crate::config::CoalesceStrictness;
use crate::db::{
    parse_timestamp, CoalesceKey, ErrorLogEntry, FleetStore, LogSubject, NewErrorLogEntry, StoreError,
};

use chrono::{DateTime, TimeDelta, Utc};
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// A single failure, as seen by the server or submitted by a device.
#[derive(Debug, Clone, Deserialize)]
pub struct FailureObservation {
    #[serde(default)]
    pub device_id: Option<i64>,
    /// Camera or other reporter that surfaced the failure.
    #[serde(
        default,
        alias = "camera_id",
        deserialize_with = "crate::fleet::reports::deserialize_camera_id"
    )]
    pub reporter_id: Option<String>,
    pub status_code: i32,
    pub message: String,
    /// Caller-supplied occurrence time; unparseable values fall back to server time.
    #[serde(default)]
    pub occurred_at: Option<String>,
}

impl FailureObservation {
    pub fn for_device(device_id: i64, status_code: i32, message: impl Into<String>) -> Self {
        Self {
            device_id: Some(device_id),
            reporter_id: None,
            status_code,
            message: message.into(),
            occurred_at: None,
        }
    }

    pub fn for_reporter(reporter_id: impl Into<String>, status_code: i32, message: impl Into<String>) -> Self {
        Self {
            device_id: None,
            reporter_id: Some(reporter_id.into()),
            status_code,
            message: message.into(),
            occurred_at: None,
        }
    }
}

/// Why an observation produced no log write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// The named device does not exist or is deleted.
    UnknownDevice(i64),
    /// Neither a device nor a reporter was named.
    NoSubject,
}

#[derive(Debug, Clone)]
pub enum RecordOutcome {
    Opened(ErrorLogEntry),
    Incremented(ErrorLogEntry),
    Skipped(SkipReason),
}

impl RecordOutcome {
    pub fn entry(&self) -> Option<&ErrorLogEntry> {
        match self {
            RecordOutcome::Opened(e) | RecordOutcome::Incremented(e) => Some(e),
            RecordOutcome::Skipped(_) => None,
        }
    }
}

/// Folds repeated failures into bounded error log entries.
pub struct ErrorLogDeduplicator {
    store: Arc<dyn FleetStore>,
    window: TimeDelta,
    strictness: CoalesceStrictness,
    key_locks: Mutex<HashMap<CoalesceKey, Arc<Mutex<()>>>>,
}

impl ErrorLogDeduplicator {
    pub fn new(store: Arc<dyn FleetStore>, window: TimeDelta, strictness: CoalesceStrictness) -> Self {
        Self {
            store,
            window,
            strictness,
            key_locks: Mutex::new(HashMap::new()),
        }
    }

    /// Record one observation, either opening a new entry or bumping the newest one.
    pub fn record(&self, obs: &FailureObservation, now: DateTime<Utc>) -> Result<RecordOutcome, StoreError> {
        let subject = match (obs.device_id, &obs.reporter_id) {
            (Some(id), _) => match self.store.get_device(id)? {
                Some(device) if !device.is_deleted() => LogSubject::Device(id),
                _ => {
                    tracing::debug!("Dropping failure for unknown device {}: {}", id, obs.message);
                    return Ok(RecordOutcome::Skipped(SkipReason::UnknownDevice(id)));
                }
            },
            (None, Some(reporter)) => LogSubject::Reporter(reporter.clone()),
            (None, None) => return Ok(RecordOutcome::Skipped(SkipReason::NoSubject)),
        };

        let occurred_at = obs.occurred_at.as_deref().and_then(parse_timestamp);
        if occurred_at.is_none() && obs.occurred_at.is_some() {
            tracing::debug!("Unparseable occurred_at {:?}, using server time", obs.occurred_at);
        }

        let key = CoalesceKey {
            subject,
            status_code: obs.status_code,
            message: obs.message.clone(),
        };

        match self.strictness {
            CoalesceStrictness::Relaxed => self.coalesce(key, obs.reporter_id.clone(), occurred_at, now),
            CoalesceStrictness::PerKey => {
                let lock = self.key_lock(&key)?;
                let result = {
                    let _guard = lock.lock().map_err(|_| StoreError::Poisoned)?;
                    self.coalesce(key.clone(), obs.reporter_id.clone(), occurred_at, now)
                };
                self.release_key_lock(&key, lock);
                result
            }
        }
    }

    fn coalesce(
        &self,
        key: CoalesceKey,
        reporter_id: Option<String>,
        occurred_at: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Result<RecordOutcome, StoreError> {
        let effective = occurred_at.unwrap_or(now);

        if let Some(latest) = self.store.latest_error_entry(&key)? {
            if effective - latest.last_occurred_at <= self.window {
                // Late arrivals never move the burst marker backwards.
                let marker = effective.max(latest.last_occurred_at);
                let entry = self.store.bump_error_entry(latest.entry_id, marker)?;
                return Ok(RecordOutcome::Incremented(entry));
            }
        }

        let entry = self.store.insert_error_entry(&NewErrorLogEntry {
            key,
            reporter_id,
            occurred_at,
            last_occurred_at: effective,
            created_at: now,
        })?;
        tracing::info!(
            "Opened error log entry {} ({} {})",
            entry.entry_id,
            entry.status_code,
            entry.message
        );
        Ok(RecordOutcome::Opened(entry))
    }

    fn key_lock(&self, key: &CoalesceKey) -> Result<Arc<Mutex<()>>, StoreError> {
        let mut locks = self.key_locks.lock().map_err(|_| StoreError::Poisoned)?;
        Ok(locks.entry(key.clone()).or_default().clone())
    }

    /// Drop the key's mutex once nobody else holds a handle to it.
    fn release_key_lock(&self, key: &CoalesceKey, lock: Arc<Mutex<()>>) {
        if let Ok(mut locks) = self.key_locks.lock() {
            // One handle in the map, one here. Ours goes away under the map lock so
            // two finishing callers cannot both see a count of 3.
            if Arc::strong_count(&lock) == 2 {
                locks.remove(key);
            }
            drop(lock);
        }
    }

    #[cfg(test)]
    fn tracked_keys(&self) -> usize {
        self.key_locks.lock().map(|l| l.len()).unwrap_or(0)
    }
}
