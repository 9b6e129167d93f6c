//! Database model types.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize, Serializer};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Reachability of a device that has not been deleted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Connectivity {
    Online,
    Offline,
}

/// Lifecycle state of a device.
///
/// Deleted is terminal for status purposes: a deleted device is never online, and
/// restoring it brings it back as `Active(Offline)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceState {
    Active(Connectivity),
    Deleted,
}

impl DeviceState {
    pub fn is_online(self) -> bool {
        self == DeviceState::Active(Connectivity::Online)
    }

    pub fn is_deleted(self) -> bool {
        self == DeviceState::Deleted
    }

    pub fn as_str(self) -> &'static str {
        match self {
            DeviceState::Active(Connectivity::Online) => "online",
            DeviceState::Active(Connectivity::Offline) => "offline",
            DeviceState::Deleted => "deleted",
        }
    }
}

impl Default for DeviceState {
    fn default() -> Self {
        DeviceState::Active(Connectivity::Offline)
    }
}

impl FromStr for DeviceState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "online" => Ok(DeviceState::Active(Connectivity::Online)),
            "offline" => Ok(DeviceState::Active(Connectivity::Offline)),
            "deleted" => Ok(DeviceState::Deleted),
            other => Err(format!("unknown device state: {}", other)),
        }
    }
}

impl Serialize for DeviceState {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

/// A provisioned waste-sorting device.
#[derive(Debug, Clone, Serialize)]
pub struct Device {
    pub device_id: i64,
    pub name: String,
    pub city: Option<String>,
    pub address: Option<String>,
    pub capacity: Option<i64>,
    pub current_volume: Option<i64>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    /// Network address the connectivity probe targets.
    pub endpoint: Option<String>,
    pub state: DeviceState,
    /// Last successful contact; offline transitions leave it untouched.
    pub last_seen_at: Option<DateTime<Utc>>,
}

impl Device {
    pub fn is_online(&self) -> bool {
        self.state.is_online()
    }

    pub fn is_deleted(&self) -> bool {
        self.state.is_deleted()
    }
}

/// Descriptive attributes of a device, used for provisioning and profile updates.
///
/// Status fields are absent on purpose: only the fleet status service writes them.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeviceProfile {
    pub name: String,
    #[serde(default)]
    pub city: Option<String>,
    #[serde(default)]
    pub address: Option<String>,
    #[serde(default)]
    pub capacity: Option<i64>,
    #[serde(default)]
    pub current_volume: Option<i64>,
    #[serde(default)]
    pub latitude: Option<f64>,
    #[serde(default)]
    pub longitude: Option<f64>,
    #[serde(default)]
    pub endpoint: Option<String>,
}

/// Who a failure is attributed to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum LogSubject {
    /// A known device.
    Device(i64),
    /// A reporter (camera) whose device could not be resolved yet. Camera ids are
    /// free-form text such as `CAM_0`.
    Reporter(String),
}

/// Coalescing key: failures sharing it collapse into one entry per burst.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CoalesceKey {
    pub subject: LogSubject,
    pub status_code: i32,
    pub message: String,
}

/// A recorded burst of identical failures.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorLogEntry {
    pub entry_id: i64,
    pub device_id: Option<i64>,
    pub reporter_id: Option<String>,
    pub status_code: i32,
    pub message: String,
    /// Caller-supplied time of the first occurrence, when it parsed.
    pub occurred_at: Option<DateTime<Utc>>,
    pub last_occurred_at: DateTime<Utc>,
    pub repeat_count: i64,
    pub created_at: DateTime<Utc>,
}

/// Insert payload for a fresh error log entry.
#[derive(Debug, Clone)]
pub struct NewErrorLogEntry {
    pub key: CoalesceKey,
    pub reporter_id: Option<String>,
    pub occurred_at: Option<DateTime<Utc>>,
    pub last_occurred_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

impl NewErrorLogEntry {
    pub fn device_id(&self) -> Option<i64> {
        match self.key.subject {
            LogSubject::Device(id) => Some(id),
            LogSubject::Reporter(_) => None,
        }
    }

    pub fn reporter_id(&self) -> Option<String> {
        match &self.key.subject {
            LogSubject::Reporter(id) => Some(id.clone()),
            LogSubject::Device(_) => self.reporter_id.clone(),
        }
    }
}

/// Waste categories the detector distinguishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum WasteCategory {
    MetalCan,
    PetBottle,
    Plastic,
    Styrofoam,
}

impl WasteCategory {
    pub const ALL: [WasteCategory; 4] = [
        WasteCategory::MetalCan,
        WasteCategory::PetBottle,
        WasteCategory::Plastic,
        WasteCategory::Styrofoam,
    ];

    /// Map a detector class id to its category.
    pub fn from_class_id(class_id: i64) -> Option<Self> {
        match class_id {
            0 => Some(WasteCategory::MetalCan),
            1 => Some(WasteCategory::PetBottle),
            2 => Some(WasteCategory::Plastic),
            3 => Some(WasteCategory::Styrofoam),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            WasteCategory::MetalCan => "MetalCan",
            WasteCategory::PetBottle => "PetBottle",
            WasteCategory::Plastic => "Plastic",
            WasteCategory::Styrofoam => "Styrofoam",
        }
    }

    /// A per-category counter map with every category present.
    pub fn zeroed_counts() -> BTreeMap<WasteCategory, i64> {
        Self::ALL.iter().map(|c| (*c, 0)).collect()
    }
}

impl fmt::Display for WasteCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WasteCategory {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        WasteCategory::ALL
            .iter()
            .copied()
            .find(|c| c.as_str() == s)
            .ok_or_else(|| format!("unknown waste category: {}", s))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x1: f64,
    pub y1: f64,
    pub x2: f64,
    pub y2: f64,
}

/// One classified object inside a detection event.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DetectionItem {
    pub category: WasteCategory,
    pub confidence: f64,
    pub bbox: BoundingBox,
}

/// An accepted detection report.
#[derive(Debug, Clone, Serialize)]
pub struct DetectionEvent {
    pub device_id: i64,
    pub frame_id: Option<String>,
    pub detected_at: DateTime<Utc>,
    pub items: Vec<DetectionItem>,
}

/// Detections per (day, city, category).
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DailyRollup {
    pub date: NaiveDate,
    pub city: String,
    pub category: WasteCategory,
    pub count: i64,
}

/// Lifetime detection counters.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DetectionTotals {
    pub total_events: i64,
    pub total_objects: i64,
    pub items_by_type: BTreeMap<WasteCategory, i64>,
}

/// One detected object as listed in a device's waste detail.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DetectionRecord {
    pub detection_id: i64,
    #[serde(skip)]
    pub category: WasteCategory,
    pub frame_id: Option<String>,
    pub detected_at: DateTime<Utc>,
}
