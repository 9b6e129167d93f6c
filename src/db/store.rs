//! Store interface and its SQLite implementation.

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use rusqlite::types::{Type, Value};
use rusqlite::{params, Connection, OptionalExtension, Result as SqlResult, Row};
use std::collections::HashSet;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;

use super::models::*;

/// Database error types.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("Migration error: {0}")]
    Migration(String),
    #[error("store lock poisoned")]
    Poisoned,
    #[error("Not found")]
    NotFound,
}

/// Persistent fleet state.
///
/// Every method is atomic with respect to the rows it touches. Transition methods
/// report whether a row actually changed so callers can tell a no-op from a move.
pub trait FleetStore: Send + Sync {
    // --- Devices ---

    fn insert_device(&self, profile: &DeviceProfile) -> Result<Device, StoreError>;
    /// Returns false when no such device exists.
    fn update_device_profile(&self, id: i64, profile: &DeviceProfile) -> Result<bool, StoreError>;
    fn get_device(&self, id: i64) -> Result<Option<Device>, StoreError>;
    /// All devices, deleted ones included, ordered by id.
    fn list_devices(&self) -> Result<Vec<Device>, StoreError>;
    /// Online with `last_seen_at = at`, unless the device is missing or deleted.
    fn mark_online(&self, id: i64, at: DateTime<Utc>) -> Result<bool, StoreError>;
    /// Offline if currently online. `last_seen_at` is left untouched.
    fn mark_offline(&self, id: i64) -> Result<bool, StoreError>;
    /// Soft-delete (`true`) or restore to offline (`false`).
    fn set_deleted(&self, id: i64, deleted: bool) -> Result<bool, StoreError>;

    // --- Cameras ---

    fn bind_camera(&self, camera_id: &str, device_id: i64) -> Result<(), StoreError>;
    fn camera_device(&self, camera_id: &str) -> Result<Option<i64>, StoreError>;

    // --- Error log ---

    /// Most recently created entry for the key (created_at desc, id desc).
    fn latest_error_entry(&self, key: &CoalesceKey) -> Result<Option<ErrorLogEntry>, StoreError>;
    fn insert_error_entry(&self, entry: &NewErrorLogEntry) -> Result<ErrorLogEntry, StoreError>;
    /// Increment `repeat_count` and move `last_occurred_at`.
    fn bump_error_entry(
        &self,
        entry_id: i64,
        last_occurred_at: DateTime<Utc>,
    ) -> Result<ErrorLogEntry, StoreError>;
    /// A device's history, newest first. `None` means no limit.
    fn error_entries_for_device(
        &self,
        device_id: i64,
        limit: Option<usize>,
    ) -> Result<Vec<ErrorLogEntry>, StoreError>;
    /// Devices with an entry created or last seen at or after `cutoff`.
    fn devices_with_errors_since(&self, cutoff: DateTime<Utc>) -> Result<HashSet<i64>, StoreError>;

    // --- Detections and rollups ---

    /// Persist a detection with its items and bump the daily rollups, atomically.
    fn record_detection(&self, event: &DetectionEvent, city: &str) -> Result<i64, StoreError>;
    fn rollups_between(&self, start: NaiveDate, end: NaiveDate) -> Result<Vec<DailyRollup>, StoreError>;
    /// Lifetime counters, for one device or (`None`) the whole fleet.
    fn detection_totals(&self, device_id: Option<i64>) -> Result<DetectionTotals, StoreError>;
    /// Every detected object of a device, newest first (detected_at desc, item id desc).
    fn device_detections(&self, device_id: i64) -> Result<Vec<DetectionRecord>, StoreError>;
}

const DB_TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.9f";
const DB_DATE_FORMAT: &str = "%Y-%m-%d";

const DEVICE_COLUMNS: &str =
    "id, name, city, address, capacity, current_volume, latitude, longitude, endpoint, state, last_seen_at";
const ERROR_LOG_COLUMNS: &str =
    "id, device_id, reporter_id, status_code, message, occurred_at, last_occurred_at, repeat_count, created_at";

/// Thread-safe SQLite store.
#[derive(Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Create a new store with the given database path.
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.init()?;
        Ok(store)
    }

    /// Initialize the schema.
    fn init(&self) -> Result<(), StoreError> {
        let conn = self.conn()?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        conn.execute_batch(include_str!("../../migrations/000001_init.up.sql"))
            .map_err(|e| StoreError::Migration(format!("Migration 1 failed: {}", e)))?;
        Ok(())
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.conn.lock().map_err(|_| StoreError::Poisoned)
    }

    fn fetch_error_entry(conn: &Connection, entry_id: i64) -> Result<ErrorLogEntry, StoreError> {
        conn.query_row(
            &format!("SELECT {} FROM error_log WHERE id = ?1", ERROR_LOG_COLUMNS),
            params![entry_id],
            error_entry_from_row,
        )
        .optional()?
        .ok_or(StoreError::NotFound)
    }
}

impl FleetStore for SqliteStore {
    // --- Devices ---

    fn insert_device(&self, profile: &DeviceProfile) -> Result<Device, StoreError> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO devices (name, city, address, capacity, current_volume, latitude, longitude, endpoint, state)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, 'offline')",
            params![
                profile.name,
                profile.city,
                profile.address,
                profile.capacity,
                profile.current_volume,
                profile.latitude,
                profile.longitude,
                profile.endpoint,
            ],
        )?;
        let id = conn.last_insert_rowid();
        Ok(Device {
            device_id: id,
            name: profile.name.clone(),
            city: profile.city.clone(),
            address: profile.address.clone(),
            capacity: profile.capacity,
            current_volume: profile.current_volume,
            latitude: profile.latitude,
            longitude: profile.longitude,
            endpoint: profile.endpoint.clone(),
            state: DeviceState::default(),
            last_seen_at: None,
        })
    }

    fn update_device_profile(&self, id: i64, profile: &DeviceProfile) -> Result<bool, StoreError> {
        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE devices SET name=?1, city=?2, address=?3, capacity=?4, current_volume=?5,
             latitude=?6, longitude=?7, endpoint=?8 WHERE id=?9",
            params![
                profile.name,
                profile.city,
                profile.address,
                profile.capacity,
                profile.current_volume,
                profile.latitude,
                profile.longitude,
                profile.endpoint,
                id,
            ],
        )?;
        Ok(changed > 0)
    }

    fn get_device(&self, id: i64) -> Result<Option<Device>, StoreError> {
        let conn = self.conn()?;
        let device = conn
            .query_row(
                &format!("SELECT {} FROM devices WHERE id = ?1", DEVICE_COLUMNS),
                params![id],
                device_from_row,
            )
            .optional()?;
        Ok(device)
    }

    fn list_devices(&self) -> Result<Vec<Device>, StoreError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!("SELECT {} FROM devices ORDER BY id ASC", DEVICE_COLUMNS))?;
        let devices = stmt
            .query_map([], device_from_row)?
            .collect::<SqlResult<Vec<_>>>()?;
        Ok(devices)
    }

    fn mark_online(&self, id: i64, at: DateTime<Utc>) -> Result<bool, StoreError> {
        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE devices SET state = 'online', last_seen_at = ?1 WHERE id = ?2 AND state != 'deleted'",
            params![fmt_db_time(at), id],
        )?;
        Ok(changed > 0)
    }

    fn mark_offline(&self, id: i64) -> Result<bool, StoreError> {
        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE devices SET state = 'offline' WHERE id = ?1 AND state = 'online'",
            params![id],
        )?;
        Ok(changed > 0)
    }

    fn set_deleted(&self, id: i64, deleted: bool) -> Result<bool, StoreError> {
        let conn = self.conn()?;
        let sql = if deleted {
            "UPDATE devices SET state = 'deleted' WHERE id = ?1 AND state != 'deleted'"
        } else {
            "UPDATE devices SET state = 'offline' WHERE id = ?1 AND state = 'deleted'"
        };
        let changed = conn.execute(sql, params![id])?;
        Ok(changed > 0)
    }

    // --- Cameras ---

    fn bind_camera(&self, camera_id: &str, device_id: i64) -> Result<(), StoreError> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO cameras (camera_id, device_id) VALUES (?1, ?2)
             ON CONFLICT(camera_id) DO UPDATE SET device_id = excluded.device_id",
            params![camera_id, device_id],
        )?;
        Ok(())
    }

    fn camera_device(&self, camera_id: &str) -> Result<Option<i64>, StoreError> {
        let conn = self.conn()?;
        let device_id = conn
            .query_row(
                "SELECT device_id FROM cameras WHERE camera_id = ?1",
                params![camera_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(device_id)
    }

    // --- Error log ---

    fn latest_error_entry(&self, key: &CoalesceKey) -> Result<Option<ErrorLogEntry>, StoreError> {
        let conn = self.conn()?;
        let (filter, subject_id) = match &key.subject {
            LogSubject::Device(id) => ("device_id = ?1", Value::Integer(*id)),
            LogSubject::Reporter(id) => ("device_id IS NULL AND reporter_id = ?1", Value::Text(id.clone())),
        };
        let entry = conn
            .query_row(
                &format!(
                    "SELECT {} FROM error_log WHERE {} AND status_code = ?2 AND message = ?3
                     ORDER BY created_at DESC, id DESC LIMIT 1",
                    ERROR_LOG_COLUMNS, filter
                ),
                params![subject_id, key.status_code, key.message],
                error_entry_from_row,
            )
            .optional()?;
        Ok(entry)
    }

    fn insert_error_entry(&self, entry: &NewErrorLogEntry) -> Result<ErrorLogEntry, StoreError> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO error_log (device_id, reporter_id, status_code, message, occurred_at, last_occurred_at, repeat_count, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, 1, ?7)",
            params![
                entry.device_id(),
                entry.reporter_id(),
                entry.key.status_code,
                entry.key.message,
                entry.occurred_at.map(fmt_db_time),
                fmt_db_time(entry.last_occurred_at),
                fmt_db_time(entry.created_at),
            ],
        )?;
        Ok(ErrorLogEntry {
            entry_id: conn.last_insert_rowid(),
            device_id: entry.device_id(),
            reporter_id: entry.reporter_id(),
            status_code: entry.key.status_code,
            message: entry.key.message.clone(),
            occurred_at: entry.occurred_at,
            last_occurred_at: entry.last_occurred_at,
            repeat_count: 1,
            created_at: entry.created_at,
        })
    }

    fn bump_error_entry(
        &self,
        entry_id: i64,
        last_occurred_at: DateTime<Utc>,
    ) -> Result<ErrorLogEntry, StoreError> {
        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE error_log SET repeat_count = repeat_count + 1, last_occurred_at = ?1 WHERE id = ?2",
            params![fmt_db_time(last_occurred_at), entry_id],
        )?;
        if changed == 0 {
            return Err(StoreError::NotFound);
        }
        Self::fetch_error_entry(&conn, entry_id)
    }

    fn error_entries_for_device(
        &self,
        device_id: i64,
        limit: Option<usize>,
    ) -> Result<Vec<ErrorLogEntry>, StoreError> {
        let conn = self.conn()?;
        // SQLite treats a negative LIMIT as unbounded.
        let limit = limit.map(|l| l as i64).unwrap_or(-1);
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM error_log WHERE device_id = ?1 ORDER BY created_at DESC, id DESC LIMIT ?2",
            ERROR_LOG_COLUMNS
        ))?;
        let entries = stmt
            .query_map(params![device_id, limit], error_entry_from_row)?
            .collect::<SqlResult<Vec<_>>>()?;
        Ok(entries)
    }

    fn devices_with_errors_since(&self, cutoff: DateTime<Utc>) -> Result<HashSet<i64>, StoreError> {
        let conn = self.conn()?;
        let cutoff = fmt_db_time(cutoff);
        let mut stmt = conn.prepare(
            "SELECT DISTINCT device_id FROM error_log
             WHERE device_id IS NOT NULL AND (last_occurred_at >= ?1 OR created_at >= ?1)",
        )?;
        let ids = stmt
            .query_map(params![cutoff], |row| row.get(0))?
            .collect::<SqlResult<HashSet<i64>>>()?;
        Ok(ids)
    }

    // --- Detections and rollups ---

    fn record_detection(&self, event: &DetectionEvent, city: &str) -> Result<i64, StoreError> {
        let conn = self.conn()?;
        let tx = conn.unchecked_transaction()?;

        tx.execute(
            "INSERT INTO detections (device_id, frame_id, detected_at, object_count) VALUES (?1, ?2, ?3, ?4)",
            params![
                event.device_id,
                event.frame_id,
                fmt_db_time(event.detected_at),
                event.items.len() as i64,
            ],
        )?;
        let detection_id = tx.last_insert_rowid();
        let stats_date = event.detected_at.date_naive().format(DB_DATE_FORMAT).to_string();

        {
            let mut item_stmt = tx.prepare(
                "INSERT INTO detection_items (detection_id, category, confidence, x1, y1, x2, y2)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            )?;
            let mut rollup_stmt = tx.prepare(
                "INSERT INTO daily_rollups (stats_date, city, category, count) VALUES (?1, ?2, ?3, 1)
                 ON CONFLICT(stats_date, city, category) DO UPDATE SET count = count + 1",
            )?;

            for item in &event.items {
                item_stmt.execute(params![
                    detection_id,
                    item.category.as_str(),
                    item.confidence,
                    item.bbox.x1,
                    item.bbox.y1,
                    item.bbox.x2,
                    item.bbox.y2,
                ])?;
                rollup_stmt.execute(params![stats_date, city, item.category.as_str()])?;
            }
        }

        tx.commit()?;
        Ok(detection_id)
    }

    fn rollups_between(&self, start: NaiveDate, end: NaiveDate) -> Result<Vec<DailyRollup>, StoreError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT stats_date, city, category, count FROM daily_rollups
             WHERE stats_date >= ?1 AND stats_date <= ?2
             ORDER BY stats_date ASC, city ASC, category ASC",
        )?;
        let rollups = stmt
            .query_map(
                params![
                    start.format(DB_DATE_FORMAT).to_string(),
                    end.format(DB_DATE_FORMAT).to_string(),
                ],
                |row| {
                    let date: String = row.get(0)?;
                    let category: String = row.get(2)?;
                    Ok(DailyRollup {
                        date: NaiveDate::parse_from_str(&date, DB_DATE_FORMAT)
                            .map_err(|e| conversion_error(0, e.to_string()))?,
                        city: row.get(1)?,
                        category: category.parse().map_err(|e| conversion_error(2, e))?,
                        count: row.get(3)?,
                    })
                },
            )?
            .collect::<SqlResult<Vec<_>>>()?;
        Ok(rollups)
    }

    fn detection_totals(&self, device_id: Option<i64>) -> Result<DetectionTotals, StoreError> {
        let conn = self.conn()?;
        let (total_events, total_objects): (i64, i64) = conn.query_row(
            "SELECT COUNT(*), COALESCE(SUM(object_count), 0) FROM detections
             WHERE ?1 IS NULL OR device_id = ?1",
            params![device_id],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )?;

        let mut items_by_type = WasteCategory::zeroed_counts();
        let mut stmt = conn.prepare(
            "SELECT i.category, COUNT(*) FROM detection_items i
             JOIN detections d ON d.id = i.detection_id
             WHERE ?1 IS NULL OR d.device_id = ?1
             GROUP BY i.category",
        )?;
        let rows = stmt
            .query_map(params![device_id], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))?
            .collect::<SqlResult<Vec<_>>>()?;
        for (category, count) in rows {
            if let Ok(category) = category.parse::<WasteCategory>() {
                *items_by_type.entry(category).or_insert(0) += count;
            }
        }

        Ok(DetectionTotals {
            total_events,
            total_objects,
            items_by_type,
        })
    }

    fn device_detections(&self, device_id: i64) -> Result<Vec<DetectionRecord>, StoreError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT d.id, i.category, d.frame_id, d.detected_at FROM detection_items i
             JOIN detections d ON d.id = i.detection_id
             WHERE d.device_id = ?1
             ORDER BY d.detected_at DESC, i.id DESC",
        )?;
        let records = stmt
            .query_map(params![device_id], |row| {
                let category: String = row.get(1)?;
                Ok(DetectionRecord {
                    detection_id: row.get(0)?,
                    category: category.parse().map_err(|e| conversion_error(1, e))?,
                    frame_id: row.get(2)?,
                    detected_at: time_column(row, 3)?,
                })
            })?
            .collect::<SqlResult<Vec<_>>>()?;
        Ok(records)
    }
}

fn device_from_row(row: &Row<'_>) -> SqlResult<Device> {
    let state: String = row.get(9)?;
    Ok(Device {
        device_id: row.get(0)?,
        name: row.get(1)?,
        city: row.get(2)?,
        address: row.get(3)?,
        capacity: row.get(4)?,
        current_volume: row.get(5)?,
        latitude: row.get(6)?,
        longitude: row.get(7)?,
        endpoint: row.get(8)?,
        state: state.parse().map_err(|e| conversion_error(9, e))?,
        last_seen_at: optional_time_column(row, 10)?,
    })
}

fn error_entry_from_row(row: &Row<'_>) -> SqlResult<ErrorLogEntry> {
    Ok(ErrorLogEntry {
        entry_id: row.get(0)?,
        device_id: row.get(1)?,
        reporter_id: row.get(2)?,
        status_code: row.get(3)?,
        message: row.get(4)?,
        occurred_at: optional_time_column(row, 5)?,
        last_occurred_at: time_column(row, 6)?,
        repeat_count: row.get(7)?,
        created_at: time_column(row, 8)?,
    })
}

fn time_column(row: &Row<'_>, idx: usize) -> SqlResult<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    parse_timestamp(&raw).ok_or_else(|| conversion_error(idx, format!("invalid timestamp: {}", raw)))
}

fn optional_time_column(row: &Row<'_>, idx: usize) -> SqlResult<Option<DateTime<Utc>>> {
    let raw: Option<String> = row.get(idx)?;
    match raw {
        Some(raw) => parse_timestamp(&raw)
            .map(Some)
            .ok_or_else(|| conversion_error(idx, format!("invalid timestamp: {}", raw))),
        None => Ok(None),
    }
}

fn conversion_error(idx: usize, msg: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, msg.into())
}

fn fmt_db_time(t: DateTime<Utc>) -> String {
    t.format(DB_TIME_FORMAT).to_string()
}

/// Parse a timestamp from the database or from a device payload.
///
/// Accepts RFC 3339 (with offset or `Z`) and naive forms, which are taken as UTC.
pub fn parse_timestamp(s: &str) -> Option<DateTime<Utc>> {
    let s = s.trim();
    if s.is_empty() {
        return None;
    }

    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }

    let formats = [
        "%Y-%m-%d %H:%M:%S%.9f",
        "%Y-%m-%d %H:%M:%S%.f",
        "%Y-%m-%d %H:%M:%S",
        "%Y-%m-%dT%H:%M:%S%.f",
        "%Y-%m-%dT%H:%M:%S",
    ];

    for fmt in &formats {
        if let Ok(dt) = NaiveDateTime::parse_from_str(s, fmt) {
            return Some(DateTime::from_naive_utc_and_offset(dt, Utc));
        }
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration as ChronoDuration, TimeZone};
    use tempfile::NamedTempFile;

    fn open() -> (NamedTempFile, SqliteStore) {
        let tmp = NamedTempFile::new().unwrap();
        let store = SqliteStore::new(tmp.path()).unwrap();
        (tmp, store)
    }

    fn profile(name: &str) -> DeviceProfile {
        DeviceProfile {
            name: name.to_string(),
            city: Some("Seoul".to_string()),
            capacity: Some(100),
            current_volume: Some(10),
            endpoint: Some("10.0.0.7".to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn test_device_lifecycle() {
        let (_tmp, store) = open();
        let device = store.insert_device(&profile("Station")).unwrap();
        assert!(device.device_id > 0);
        assert_eq!(device.state, DeviceState::Active(Connectivity::Offline));

        let now = Utc.with_ymd_and_hms(2024, 5, 1, 9, 0, 0).unwrap();
        assert!(store.mark_online(device.device_id, now).unwrap());
        let fetched = store.get_device(device.device_id).unwrap().unwrap();
        assert!(fetched.is_online());
        assert_eq!(fetched.last_seen_at, Some(now));

        assert!(store.mark_offline(device.device_id).unwrap());
        assert!(!store.mark_offline(device.device_id).unwrap());
        let fetched = store.get_device(device.device_id).unwrap().unwrap();
        assert_eq!(fetched.last_seen_at, Some(now));

        assert!(store.set_deleted(device.device_id, true).unwrap());
        assert!(!store.mark_online(device.device_id, now).unwrap());
        assert!(store.get_device(device.device_id).unwrap().unwrap().is_deleted());

        assert!(store.set_deleted(device.device_id, false).unwrap());
        assert_eq!(
            store.get_device(device.device_id).unwrap().unwrap().state,
            DeviceState::Active(Connectivity::Offline)
        );
        assert!(store.get_device(999).unwrap().is_none());
    }

    #[test]
    fn test_error_log_latest_and_bump() {
        let (_tmp, store) = open();
        let device = store.insert_device(&profile("Station")).unwrap();
        let t0 = Utc.with_ymd_and_hms(2024, 5, 1, 9, 0, 0).unwrap();
        let key = CoalesceKey {
            subject: LogSubject::Device(device.device_id),
            status_code: 500,
            message: "X".to_string(),
        };

        assert!(store.latest_error_entry(&key).unwrap().is_none());
        let first = store
            .insert_error_entry(&NewErrorLogEntry {
                key: key.clone(),
                reporter_id: Some("CAM_3".to_string()),
                occurred_at: None,
                last_occurred_at: t0,
                created_at: t0,
            })
            .unwrap();
        let second = store
            .insert_error_entry(&NewErrorLogEntry {
                key: key.clone(),
                reporter_id: None,
                occurred_at: None,
                last_occurred_at: t0,
                created_at: t0,
            })
            .unwrap();

        // Same created_at: the higher id wins.
        let latest = store.latest_error_entry(&key).unwrap().unwrap();
        assert_eq!(latest.entry_id, second.entry_id);

        let bumped = store
            .bump_error_entry(first.entry_id, t0 + ChronoDuration::seconds(5))
            .unwrap();
        assert_eq!(bumped.repeat_count, 2);
        assert_eq!(bumped.reporter_id.as_deref(), Some("CAM_3"));
        assert_eq!(bumped.last_occurred_at, t0 + ChronoDuration::seconds(5));

        let history = store.error_entries_for_device(device.device_id, Some(1)).unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].entry_id, second.entry_id);
        assert_eq!(store.error_entries_for_device(device.device_id, None).unwrap().len(), 2);

        let recent = store.devices_with_errors_since(t0).unwrap();
        assert!(recent.contains(&device.device_id));
        assert!(store
            .devices_with_errors_since(t0 + ChronoDuration::seconds(6))
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_reporter_entries_are_separate_from_devices() {
        let (_tmp, store) = open();
        let t0 = Utc.with_ymd_and_hms(2024, 5, 1, 9, 0, 0).unwrap();
        let reporter_key = CoalesceKey {
            subject: LogSubject::Reporter("CAM_9".to_string()),
            status_code: 400,
            message: "unknown camera".to_string(),
        };
        let entry = store
            .insert_error_entry(&NewErrorLogEntry {
                key: reporter_key.clone(),
                reporter_id: None,
                occurred_at: Some(t0),
                last_occurred_at: t0,
                created_at: t0,
            })
            .unwrap();
        assert_eq!(entry.device_id, None);
        assert_eq!(entry.reporter_id.as_deref(), Some("CAM_9"));

        let found = store.latest_error_entry(&reporter_key).unwrap().unwrap();
        assert_eq!(found.entry_id, entry.entry_id);
        assert_eq!(found.occurred_at, Some(t0));
        assert_eq!(found.message, reporter_key.message);
    }

    #[test]
    fn test_record_detection_upserts_rollups() {
        let (_tmp, store) = open();
        let device = store.insert_device(&profile("Station")).unwrap();
        let at = Utc.with_ymd_and_hms(2024, 5, 1, 9, 0, 0).unwrap();
        let bbox = BoundingBox { x1: 0.0, y1: 0.0, x2: 1.0, y2: 1.0 };
        let event = DetectionEvent {
            device_id: device.device_id,
            frame_id: Some("0_1".to_string()),
            detected_at: at,
            items: vec![
                DetectionItem { category: WasteCategory::Plastic, confidence: 0.9, bbox },
                DetectionItem { category: WasteCategory::Plastic, confidence: 0.8, bbox },
                DetectionItem { category: WasteCategory::MetalCan, confidence: 0.7, bbox },
            ],
        };
        store.record_detection(&event, "Seoul").unwrap();
        store.record_detection(&event, "Seoul").unwrap();

        let day = at.date_naive();
        let rollups = store.rollups_between(day, day).unwrap();
        assert_eq!(rollups.len(), 2);
        let plastic = rollups.iter().find(|r| r.category == WasteCategory::Plastic).unwrap();
        assert_eq!(plastic.count, 4);
        assert_eq!(plastic.city, "Seoul");

        let totals = store.detection_totals(None).unwrap();
        assert_eq!(totals.total_events, 2);
        assert_eq!(totals.total_objects, 6);
        assert_eq!(totals.items_by_type[&WasteCategory::MetalCan], 2);
        assert_eq!(totals.items_by_type[&WasteCategory::Styrofoam], 0);
    }

    #[test]
    fn test_device_detection_totals_and_listing() {
        let (_tmp, store) = open();
        let a = store.insert_device(&profile("A")).unwrap();
        let b = store.insert_device(&profile("B")).unwrap();
        let t0 = Utc.with_ymd_and_hms(2024, 5, 1, 9, 0, 0).unwrap();
        let bbox = BoundingBox { x1: 0.0, y1: 0.0, x2: 1.0, y2: 1.0 };
        let item = |category| DetectionItem { category, confidence: 0.9, bbox };

        let older = store
            .record_detection(
                &DetectionEvent {
                    device_id: a.device_id,
                    frame_id: Some("0_1".to_string()),
                    detected_at: t0,
                    items: vec![item(WasteCategory::Plastic)],
                },
                "Seoul",
            )
            .unwrap();
        let newer = store
            .record_detection(
                &DetectionEvent {
                    device_id: a.device_id,
                    frame_id: Some("0_2".to_string()),
                    detected_at: t0 + ChronoDuration::minutes(1),
                    items: vec![item(WasteCategory::MetalCan), item(WasteCategory::PetBottle)],
                },
                "Seoul",
            )
            .unwrap();
        store
            .record_detection(
                &DetectionEvent {
                    device_id: b.device_id,
                    frame_id: None,
                    detected_at: t0,
                    items: vec![item(WasteCategory::Styrofoam)],
                },
                "Busan",
            )
            .unwrap();

        let totals = store.detection_totals(Some(a.device_id)).unwrap();
        assert_eq!(totals.total_events, 2);
        assert_eq!(totals.total_objects, 3);
        assert_eq!(totals.items_by_type[&WasteCategory::Styrofoam], 0);
        assert_eq!(totals.items_by_type[&WasteCategory::MetalCan], 1);

        let records = store.device_detections(a.device_id).unwrap();
        assert_eq!(records.len(), 3);
        assert_eq!(records[0].detection_id, newer);
        assert_eq!(records[0].category, WasteCategory::PetBottle);
        assert_eq!(records[2].detection_id, older);
        assert_eq!(records[2].frame_id.as_deref(), Some("0_1"));
        assert!(store.device_detections(999).unwrap().is_empty());
    }

    #[test]
    fn test_camera_binding() {
        let (_tmp, store) = open();
        let a = store.insert_device(&profile("A")).unwrap();
        let b = store.insert_device(&profile("B")).unwrap();
        assert_eq!(store.camera_device("CAM_0").unwrap(), None);
        store.bind_camera("CAM_0", a.device_id).unwrap();
        store.bind_camera("CAM_0", b.device_id).unwrap();
        assert_eq!(store.camera_device("CAM_0").unwrap(), Some(b.device_id));
        assert_eq!(store.camera_device("cam_0").unwrap(), None);
    }

    #[test]
    fn test_parse_timestamp() {
        let expected = Utc.with_ymd_and_hms(2024, 5, 1, 9, 0, 0).unwrap();
        assert_eq!(parse_timestamp("2024-05-01T09:00:00Z"), Some(expected));
        assert_eq!(parse_timestamp("2024-05-01T18:00:00+09:00"), Some(expected));
        assert_eq!(parse_timestamp("2024-05-01 09:00:00"), Some(expected));
        assert_eq!(parse_timestamp("2024-05-01T09:00:00"), Some(expected));
        assert_eq!(parse_timestamp("not-a-date"), None);
        assert_eq!(parse_timestamp(""), None);
    }
}
