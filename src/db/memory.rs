//! In-memory store.
//!
//! Holds the whole fleet behind one mutex. Error log entries live in an append-only
//! arena with a per-key index pointing at the newest entry of each coalescing key, so
//! the latest-entry lookup is a map hit instead of a scan.

use chrono::{DateTime, NaiveDate, Utc};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};

use super::models::*;
use super::store::{FleetStore, StoreError};

#[derive(Default)]
struct Inner {
    devices: BTreeMap<i64, Device>,
    next_device_id: i64,
    cameras: HashMap<String, i64>,
    entries: Vec<ErrorLogEntry>,
    latest_by_key: HashMap<CoalesceKey, usize>,
    detections: Vec<(i64, DetectionEvent)>,
    rollups: BTreeMap<(NaiveDate, String, WasteCategory), i64>,
}

/// Fleet store kept entirely in process memory.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, Inner>, StoreError> {
        self.inner.lock().map_err(|_| StoreError::Poisoned)
    }
}

impl FleetStore for MemoryStore {
    fn insert_device(&self, profile: &DeviceProfile) -> Result<Device, StoreError> {
        let mut inner = self.lock()?;
        inner.next_device_id += 1;
        let device = Device {
            device_id: inner.next_device_id,
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
        };
        inner.devices.insert(device.device_id, device.clone());
        Ok(device)
    }

    fn update_device_profile(&self, id: i64, profile: &DeviceProfile) -> Result<bool, StoreError> {
        let mut inner = self.lock()?;
        let Some(device) = inner.devices.get_mut(&id) else {
            return Ok(false);
        };
        device.name = profile.name.clone();
        device.city = profile.city.clone();
        device.address = profile.address.clone();
        device.capacity = profile.capacity;
        device.current_volume = profile.current_volume;
        device.latitude = profile.latitude;
        device.longitude = profile.longitude;
        device.endpoint = profile.endpoint.clone();
        Ok(true)
    }

    fn get_device(&self, id: i64) -> Result<Option<Device>, StoreError> {
        Ok(self.lock()?.devices.get(&id).cloned())
    }

    fn list_devices(&self) -> Result<Vec<Device>, StoreError> {
        Ok(self.lock()?.devices.values().cloned().collect())
    }

    fn mark_online(&self, id: i64, at: DateTime<Utc>) -> Result<bool, StoreError> {
        let mut inner = self.lock()?;
        match inner.devices.get_mut(&id) {
            Some(device) if !device.is_deleted() => {
                device.state = DeviceState::Active(Connectivity::Online);
                device.last_seen_at = Some(at);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn mark_offline(&self, id: i64) -> Result<bool, StoreError> {
        let mut inner = self.lock()?;
        match inner.devices.get_mut(&id) {
            Some(device) if device.is_online() => {
                device.state = DeviceState::Active(Connectivity::Offline);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn set_deleted(&self, id: i64, deleted: bool) -> Result<bool, StoreError> {
        let mut inner = self.lock()?;
        let Some(device) = inner.devices.get_mut(&id) else {
            return Ok(false);
        };
        if device.is_deleted() == deleted {
            return Ok(false);
        }
        device.state = if deleted {
            DeviceState::Deleted
        } else {
            DeviceState::Active(Connectivity::Offline)
        };
        Ok(true)
    }

    fn bind_camera(&self, camera_id: &str, device_id: i64) -> Result<(), StoreError> {
        let mut inner = self.lock()?;
        if !inner.devices.contains_key(&device_id) {
            return Err(StoreError::NotFound);
        }
        inner.cameras.insert(camera_id.to_string(), device_id);
        Ok(())
    }

    fn camera_device(&self, camera_id: &str) -> Result<Option<i64>, StoreError> {
        Ok(self.lock()?.cameras.get(camera_id).copied())
    }

    fn latest_error_entry(&self, key: &CoalesceKey) -> Result<Option<ErrorLogEntry>, StoreError> {
        let inner = self.lock()?;
        Ok(inner
            .latest_by_key
            .get(key)
            .and_then(|idx| inner.entries.get(*idx))
            .cloned())
    }

    fn insert_error_entry(&self, entry: &NewErrorLogEntry) -> Result<ErrorLogEntry, StoreError> {
        let mut inner = self.lock()?;
        let idx = inner.entries.len();
        let stored = ErrorLogEntry {
            entry_id: idx as i64 + 1,
            device_id: entry.device_id(),
            reporter_id: entry.reporter_id(),
            status_code: entry.key.status_code,
            message: entry.key.message.clone(),
            occurred_at: entry.occurred_at,
            last_occurred_at: entry.last_occurred_at,
            repeat_count: 1,
            created_at: entry.created_at,
        };
        inner.entries.push(stored.clone());
        inner.latest_by_key.insert(entry.key.clone(), idx);
        Ok(stored)
    }

    fn bump_error_entry(
        &self,
        entry_id: i64,
        last_occurred_at: DateTime<Utc>,
    ) -> Result<ErrorLogEntry, StoreError> {
        let mut inner = self.lock()?;
        let entry = usize::try_from(entry_id - 1)
            .ok()
            .and_then(|idx| inner.entries.get_mut(idx))
            .ok_or(StoreError::NotFound)?;
        entry.repeat_count += 1;
        entry.last_occurred_at = last_occurred_at;
        Ok(entry.clone())
    }

    fn error_entries_for_device(
        &self,
        device_id: i64,
        limit: Option<usize>,
    ) -> Result<Vec<ErrorLogEntry>, StoreError> {
        let inner = self.lock()?;
        let mut entries: Vec<ErrorLogEntry> = inner
            .entries
            .iter()
            .filter(|e| e.device_id == Some(device_id))
            .cloned()
            .collect();
        entries.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| b.entry_id.cmp(&a.entry_id))
        });
        if let Some(limit) = limit {
            entries.truncate(limit);
        }
        Ok(entries)
    }

    fn devices_with_errors_since(&self, cutoff: DateTime<Utc>) -> Result<HashSet<i64>, StoreError> {
        let inner = self.lock()?;
        Ok(inner
            .entries
            .iter()
            .filter(|e| e.last_occurred_at >= cutoff || e.created_at >= cutoff)
            .filter_map(|e| e.device_id)
            .collect())
    }

    fn record_detection(&self, event: &DetectionEvent, city: &str) -> Result<i64, StoreError> {
        let mut inner = self.lock()?;
        let detection_id = inner.detections.len() as i64 + 1;
        let date = event.detected_at.date_naive();
        for item in &event.items {
            *inner
                .rollups
                .entry((date, city.to_string(), item.category))
                .or_insert(0) += 1;
        }
        inner.detections.push((detection_id, event.clone()));
        Ok(detection_id)
    }

    fn rollups_between(&self, start: NaiveDate, end: NaiveDate) -> Result<Vec<DailyRollup>, StoreError> {
        let inner = self.lock()?;
        Ok(inner
            .rollups
            .iter()
            .filter(|((date, _, _), _)| *date >= start && *date <= end)
            .map(|((date, city, category), count)| DailyRollup {
                date: *date,
                city: city.clone(),
                category: *category,
                count: *count,
            })
            .collect())
    }

    fn detection_totals(&self, device_id: Option<i64>) -> Result<DetectionTotals, StoreError> {
        let inner = self.lock()?;
        let mut items_by_type = WasteCategory::zeroed_counts();
        let mut total_events = 0;
        let mut total_objects = 0;
        for (_, event) in inner
            .detections
            .iter()
            .filter(|(_, e)| device_id.map_or(true, |id| e.device_id == id))
        {
            total_events += 1;
            for item in &event.items {
                *items_by_type.entry(item.category).or_insert(0) += 1;
                total_objects += 1;
            }
        }
        Ok(DetectionTotals {
            total_events,
            total_objects,
            items_by_type,
        })
    }

    fn device_detections(&self, device_id: i64) -> Result<Vec<DetectionRecord>, StoreError> {
        let inner = self.lock()?;
        let mut events: Vec<&(i64, DetectionEvent)> = inner
            .detections
            .iter()
            .filter(|(_, e)| e.device_id == device_id)
            .collect();
        // Later inserts carry higher ids, matching the item id tiebreak.
        events.sort_by(|(a_id, a), (b_id, b)| b.detected_at.cmp(&a.detected_at).then_with(|| b_id.cmp(a_id)));
        Ok(events
            .into_iter()
            .flat_map(|(id, event)| {
                event.items.iter().rev().map(move |item| DetectionRecord {
                    detection_id: *id,
                    category: item.category,
                    frame_id: event.frame_id.clone(),
                    detected_at: event.detected_at,
                })
            })
            .collect())
    }
}
