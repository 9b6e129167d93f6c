//! Read-side rollups for the dashboard.

use crate::db::{DetectionRecord, DetectionTotals, Device, DeviceState, FleetStore, StoreError, WasteCategory};

use chrono::{Datelike, NaiveDate};
use serde::Serialize;
use std::collections::BTreeMap;
use std::str::FromStr;
use std::sync::Arc;

/// Fill bucket of a bin. Declaration order is display order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FillStatus {
    Saturated,
    Moderate,
    Light,
}

/// Volume over capacity, when both are known and capacity is positive.
pub fn fill_rate(current_volume: Option<i64>, capacity: Option<i64>) -> Option<f64> {
    match (current_volume, capacity) {
        (Some(volume), Some(capacity)) if capacity > 0 => Some(volume as f64 / capacity as f64),
        _ => None,
    }
}

pub fn fill_bucket(rate: Option<f64>) -> FillStatus {
    match rate {
        Some(r) if r >= 0.9 => FillStatus::Saturated,
        Some(r) if r >= 0.5 => FillStatus::Moderate,
        _ => FillStatus::Light,
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct FillEntry {
    pub device_id: i64,
    pub name: String,
    pub fill_rate: Option<f64>,
    pub fill_status: FillStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ChartPeriod {
    Week,
    Month,
    Year,
}

impl ChartPeriod {
    /// First day of the period containing `today`. Weeks start on Monday.
    pub fn start(self, today: NaiveDate) -> NaiveDate {
        match self {
            ChartPeriod::Week => {
                today - chrono::Days::new(u64::from(today.weekday().num_days_from_monday()))
            }
            ChartPeriod::Month => today.with_day(1).unwrap_or(today),
            ChartPeriod::Year => today.with_ordinal(1).unwrap_or(today),
        }
    }
}

impl FromStr for ChartPeriod {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "week" => Ok(Self::Week),
            "month" => Ok(Self::Month),
            "year" => Ok(Self::Year),
            other => Err(format!("unknown chart period: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ChartSummary {
    pub period: ChartPeriod,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    pub total_count: i64,
    pub items_by_type: BTreeMap<WasteCategory, i64>,
    pub items_by_city: BTreeMap<String, i64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct MapPoint {
    pub device_id: i64,
    pub name: String,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub state: DeviceState,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct MapView {
    pub active: Vec<MapPoint>,
    pub deleted: Vec<MapPoint>,
}

/// Device detail as shown on the dashboard.
#[derive(Debug, Clone, Serialize)]
pub struct DeviceSummary {
    #[serde(flatten)]
    pub device: Device,
    /// Capacity minus current volume, unknowns counted as zero.
    pub free_capacity: i64,
    pub detections: DetectionTotals,
}

/// Every object a device has detected, grouped by category.
#[derive(Debug, Clone, Serialize)]
pub struct WasteDetail {
    pub device_id: i64,
    pub total_objects: usize,
    pub total_events: usize,
    pub items_by_type: BTreeMap<WasteCategory, Vec<DetectionRecord>>,
}

/// Read-only aggregation over the fleet store.
pub struct StatsAggregator {
    store: Arc<dyn FleetStore>,
}

impl StatsAggregator {
    pub fn new(store: Arc<dyn FleetStore>) -> Self {
        Self { store }
    }

    pub fn detection_totals(&self) -> Result<DetectionTotals, StoreError> {
        self.store.detection_totals(None)
    }

    pub fn device_summary(&self, device: Device) -> Result<DeviceSummary, StoreError> {
        let detections = self.store.detection_totals(Some(device.device_id))?;
        Ok(DeviceSummary {
            free_capacity: device.capacity.unwrap_or(0) - device.current_volume.unwrap_or(0),
            detections,
            device,
        })
    }

    /// Detections of an active device, newest first within each category.
    /// `None` when the device is missing or deleted.
    pub fn waste_detail(&self, device_id: i64) -> Result<Option<WasteDetail>, StoreError> {
        match self.store.get_device(device_id)? {
            Some(device) if !device.is_deleted() => {}
            _ => return Ok(None),
        }

        let records = self.store.device_detections(device_id)?;
        let total_objects = records.len();
        let total_events = records
            .iter()
            .map(|r| r.detection_id)
            .collect::<std::collections::HashSet<_>>()
            .len();
        let mut items_by_type: BTreeMap<WasteCategory, Vec<DetectionRecord>> =
            WasteCategory::ALL.iter().map(|c| (*c, Vec::new())).collect();
        for record in records {
            items_by_type.entry(record.category).or_default().push(record);
        }

        Ok(Some(WasteDetail {
            device_id,
            total_objects,
            total_events,
            items_by_type,
        }))
    }

    /// Active devices ordered saturated first, then by fill rate, then by id.
    pub fn fill_statuses(&self) -> Result<Vec<FillEntry>, StoreError> {
        let mut entries: Vec<FillEntry> = self
            .store
            .list_devices()?
            .into_iter()
            .filter(|d| !d.is_deleted())
            .map(|d| {
                let rate = fill_rate(d.current_volume, d.capacity);
                FillEntry {
                    device_id: d.device_id,
                    name: d.name,
                    fill_rate: rate,
                    fill_status: fill_bucket(rate),
                }
            })
            .collect();

        entries.sort_by(|a, b| {
            a.fill_status
                .cmp(&b.fill_status)
                .then_with(|| match (a.fill_rate, b.fill_rate) {
                    (Some(x), Some(y)) => y.total_cmp(&x),
                    (Some(_), None) => std::cmp::Ordering::Less,
                    (None, Some(_)) => std::cmp::Ordering::Greater,
                    (None, None) => std::cmp::Ordering::Equal,
                })
                .then_with(|| a.device_id.cmp(&b.device_id))
        });
        Ok(entries)
    }

    /// Detection counts from the start of `period` through `today`.
    pub fn charts(&self, period: ChartPeriod, today: NaiveDate) -> Result<ChartSummary, StoreError> {
        let start_date = period.start(today);
        let mut items_by_type = WasteCategory::zeroed_counts();
        let mut items_by_city = BTreeMap::new();
        let mut total_count = 0;

        for rollup in self.store.rollups_between(start_date, today)? {
            total_count += rollup.count;
            *items_by_type.entry(rollup.category).or_insert(0) += rollup.count;
            *items_by_city.entry(rollup.city).or_insert(0) += rollup.count;
        }

        Ok(ChartSummary {
            period,
            start_date,
            end_date: today,
            total_count,
            items_by_type,
            items_by_city,
        })
    }

    /// Every device with whatever coordinates it has, split by lifecycle.
    pub fn map_view(&self) -> Result<MapView, StoreError> {
        let mut view = MapView::default();
        for device in self.store.list_devices()? {
            let point = map_point(&device);
            if device.is_deleted() {
                view.deleted.push(point);
            } else {
                view.active.push(point);
            }
        }
        Ok(view)
    }
}

fn map_point(device: &Device) -> MapPoint {
    MapPoint {
        device_id: device.device_id,
        name: device.name.clone(),
        latitude: device.latitude,
        longitude: device.longitude,
        state: device.state,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{BoundingBox, DetectionEvent, DetectionItem, DeviceProfile, MemoryStore};
    use chrono::{TimeZone, Utc};

    fn profile(name: &str, capacity: Option<i64>, volume: Option<i64>) -> DeviceProfile {
        DeviceProfile {
            name: name.to_string(),
            capacity,
            current_volume: volume,
            ..Default::default()
        }
    }

    fn item(category: WasteCategory) -> DetectionItem {
        DetectionItem {
            category,
            confidence: 0.9,
            bbox: BoundingBox { x1: 0.0, y1: 0.0, x2: 1.0, y2: 1.0 },
        }
    }

    #[test]
    fn test_fill_bucket_boundaries() {
        assert_eq!(fill_bucket(Some(0.9)), FillStatus::Saturated);
        assert_eq!(fill_bucket(Some(0.89)), FillStatus::Moderate);
        assert_eq!(fill_bucket(Some(0.5)), FillStatus::Moderate);
        assert_eq!(fill_bucket(Some(0.49)), FillStatus::Light);
        assert_eq!(fill_bucket(None), FillStatus::Light);
        assert_eq!(fill_rate(Some(10), Some(0)), None);
        assert_eq!(fill_rate(None, Some(10)), None);
        assert_eq!(fill_rate(Some(5), Some(10)), Some(0.5));
    }

    #[test]
    fn test_fill_statuses_order() {
        let store: Arc<dyn FleetStore> = Arc::new(MemoryStore::new());
        store.insert_device(&profile("light", Some(100), Some(10))).unwrap();
        store.insert_device(&profile("full", Some(100), Some(95))).unwrap();
        store.insert_device(&profile("unknown", Some(0), Some(50))).unwrap();
        store.insert_device(&profile("half", Some(100), Some(50))).unwrap();
        store.insert_device(&profile("fuller", Some(100), Some(100))).unwrap();
        let gone = store.insert_device(&profile("gone", Some(1), Some(1))).unwrap();
        store.set_deleted(gone.device_id, true).unwrap();

        let stats = StatsAggregator::new(store);
        let names: Vec<String> = stats.fill_statuses().unwrap().into_iter().map(|e| e.name).collect();
        assert_eq!(names, vec!["fuller", "full", "half", "light", "unknown"]);
    }

    #[test]
    fn test_period_start() {
        // 2024-05-16 is a Thursday.
        let today = NaiveDate::from_ymd_opt(2024, 5, 16).unwrap();
        assert_eq!(ChartPeriod::Week.start(today), NaiveDate::from_ymd_opt(2024, 5, 13).unwrap());
        assert_eq!(ChartPeriod::Month.start(today), NaiveDate::from_ymd_opt(2024, 5, 1).unwrap());
        assert_eq!(ChartPeriod::Year.start(today), NaiveDate::from_ymd_opt(2024, 1, 1).unwrap());
        let monday = NaiveDate::from_ymd_opt(2024, 5, 13).unwrap();
        assert_eq!(ChartPeriod::Week.start(monday), monday);
        assert!("decade".parse::<ChartPeriod>().is_err());
        assert_eq!("MONTH".parse::<ChartPeriod>(), Ok(ChartPeriod::Month));
    }

    #[test]
    fn test_charts_and_totals() {
        let store: Arc<dyn FleetStore> = Arc::new(MemoryStore::new());
        let event = |day: u32, items: Vec<DetectionItem>| DetectionEvent {
            device_id: 1,
            frame_id: None,
            detected_at: Utc.with_ymd_and_hms(2024, 5, day, 12, 0, 0).unwrap(),
            items,
        };
        store
            .record_detection(&event(14, vec![item(WasteCategory::Plastic), item(WasteCategory::MetalCan)]), "Seoul")
            .unwrap();
        store.record_detection(&event(15, vec![item(WasteCategory::Plastic)]), "Busan").unwrap();
        // Previous week, outside the window.
        store.record_detection(&event(10, vec![item(WasteCategory::Styrofoam)]), "Seoul").unwrap();

        let stats = StatsAggregator::new(store);
        let today = NaiveDate::from_ymd_opt(2024, 5, 16).unwrap();
        let week = stats.charts(ChartPeriod::Week, today).unwrap();
        assert_eq!(week.total_count, 3);
        assert_eq!(week.items_by_type[&WasteCategory::Plastic], 2);
        assert_eq!(week.items_by_type[&WasteCategory::Styrofoam], 0);
        assert_eq!(week.items_by_city["Seoul"], 2);
        assert_eq!(week.items_by_city["Busan"], 1);

        let month = stats.charts(ChartPeriod::Month, today).unwrap();
        assert_eq!(month.total_count, 4);

        let totals = stats.detection_totals().unwrap();
        assert_eq!(totals.total_events, 3);
        assert_eq!(totals.total_objects, 4);
        assert_eq!(totals.items_by_type.len(), 4);
    }

    #[test]
    fn test_map_view() {
        let store: Arc<dyn FleetStore> = Arc::new(MemoryStore::new());
        let located = DeviceProfile {
            latitude: Some(37.5),
            longitude: Some(127.0),
            ..profile("a", None, None)
        };
        store.insert_device(&located).unwrap();
        let gone = store.insert_device(&located).unwrap();
        store.insert_device(&profile("nowhere", None, None)).unwrap();
        store.set_deleted(gone.device_id, true).unwrap();

        let view = StatsAggregator::new(store).map_view().unwrap();
        assert_eq!(view.active.len(), 2);
        assert_eq!(view.deleted.len(), 1);
        assert_eq!(view.deleted[0].device_id, gone.device_id);

        // Unlocated devices stay listed with null coordinates.
        let nowhere = &view.active[1];
        assert_eq!(nowhere.name, "nowhere");
        assert_eq!(nowhere.latitude, None);
        let json = serde_json::to_value(nowhere).unwrap();
        assert!(json["longitude"].is_null());
    }

    #[test]
    fn test_device_summary_and_waste_detail() {
        let store: Arc<dyn FleetStore> = Arc::new(MemoryStore::new());
        let bin = store.insert_device(&profile("bin", Some(100), Some(30))).unwrap();
        let other = store.insert_device(&profile("other", None, Some(5))).unwrap();
        let at = |minute| Utc.with_ymd_and_hms(2024, 5, 14, 12, minute, 0).unwrap();
        let event = |device_id, minute, items| DetectionEvent {
            device_id,
            frame_id: Some(format!("0_{}", minute)),
            detected_at: at(minute),
            items,
        };
        store
            .record_detection(
                &event(bin.device_id, 0, vec![item(WasteCategory::Plastic), item(WasteCategory::MetalCan)]),
                "Seoul",
            )
            .unwrap();
        let latest = store
            .record_detection(&event(bin.device_id, 5, vec![item(WasteCategory::Plastic)]), "Seoul")
            .unwrap();
        store
            .record_detection(&event(other.device_id, 1, vec![item(WasteCategory::Styrofoam)]), "Seoul")
            .unwrap();

        let stats = StatsAggregator::new(store.clone());
        let summary = stats.device_summary(bin.clone()).unwrap();
        assert_eq!(summary.free_capacity, 70);
        assert_eq!(summary.detections.total_events, 2);
        assert_eq!(summary.detections.total_objects, 3);
        assert_eq!(summary.detections.items_by_type[&WasteCategory::Styrofoam], 0);
        let json = serde_json::to_value(&summary).unwrap();
        assert_eq!(json["name"], "bin");
        assert_eq!(json["free_capacity"], 70);

        assert_eq!(stats.device_summary(other.clone()).unwrap().free_capacity, -5);

        let detail = stats.waste_detail(bin.device_id).unwrap().unwrap();
        assert_eq!(detail.total_objects, 3);
        assert_eq!(detail.total_events, 2);
        let plastic = &detail.items_by_type[&WasteCategory::Plastic];
        assert_eq!(plastic.len(), 2);
        assert_eq!(plastic[0].detection_id, latest);
        assert!(detail.items_by_type[&WasteCategory::PetBottle].is_empty());

        store.set_deleted(other.device_id, true).unwrap();
        assert!(stats.waste_detail(other.device_id).unwrap().is_none());
        assert!(stats.waste_detail(999).unwrap().is_none());
    }
}
