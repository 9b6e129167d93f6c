//! Device detection reports.

use crate::db::{BoundingBox, DetectionItem, WasteCategory};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer};
use serde_json::Value;

/// One object as reported by a device's detector.
#[derive(Debug, Clone, Deserialize)]
pub struct ReportedDetection {
    pub class_id: i64,
    /// `[x1, y1, x2, y2]`
    pub bbox: [f64; 4],
    #[serde(alias = "confidence")]
    pub score: f64,
}

/// A detection report pushed by a device.
#[derive(Debug, Clone, Deserialize)]
pub struct DeviceReport {
    #[serde(default)]
    pub device_id: Option<i64>,
    /// Camera ids are text (`CAM_0`); older firmware sends bare integers.
    #[serde(default, deserialize_with = "deserialize_camera_id")]
    pub camera_id: Option<String>,
    #[serde(default)]
    pub frame_id: Option<String>,
    #[serde(default)]
    pub image_name: Option<String>,
    #[serde(default, alias = "detected_at")]
    pub timestamp: Option<String>,
    #[serde(default)]
    pub detections: Vec<ReportedDetection>,
}

/// A report body that failed to parse, with whatever identity could be salvaged.
#[derive(Debug, Clone, PartialEq)]
pub struct MalformedReport {
    pub detail: String,
    pub device_id: Option<i64>,
    pub camera_id: Option<String>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawCameraId {
    Int(i64),
    Text(String),
}

/// Accept a camera id given as a string or an integer. Blank strings count as absent.
pub fn deserialize_camera_id<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<RawCameraId>::deserialize(deserializer)?;
    Ok(raw.and_then(|raw| match raw {
        RawCameraId::Int(id) => Some(id.to_string()),
        RawCameraId::Text(text) => normalize_camera_id(&text),
    }))
}

fn normalize_camera_id(text: &str) -> Option<String> {
    let text = text.trim();
    (!text.is_empty()).then(|| text.to_string())
}

fn camera_id_value(value: &Value) -> Option<String> {
    match value {
        Value::Number(n) => n.as_i64().map(|id| id.to_string()),
        Value::String(s) => normalize_camera_id(s),
        _ => None,
    }
}

/// Parse a device-submitted JSON body. On failure the body may still be valid JSON
/// with one bad field, so whatever identity it names is kept.
pub fn parse_body<T: DeserializeOwned>(body: &[u8]) -> Result<T, MalformedReport> {
    serde_json::from_slice(body).map_err(|e| {
        let value: Option<Value> = serde_json::from_slice(body).ok();
        let field = |name: &str| value.as_ref().and_then(|v| v.get(name));
        MalformedReport {
            detail: e.to_string(),
            device_id: field("device_id").and_then(Value::as_i64),
            camera_id: field("camera_id")
                .or_else(|| field("reporter_id"))
                .and_then(camera_id_value),
        }
    })
}

impl DeviceReport {
    pub fn parse(body: &[u8]) -> Result<Self, MalformedReport> {
        parse_body(body)
    }

    /// Detections mapped to known categories. Unknown class ids are dropped.
    pub fn items(&self) -> Vec<DetectionItem> {
        self.detections
            .iter()
            .filter_map(|d| match WasteCategory::from_class_id(d.class_id) {
                Some(category) => Some(DetectionItem {
                    category,
                    confidence: d.score,
                    bbox: BoundingBox {
                        x1: d.bbox[0],
                        y1: d.bbox[1],
                        x2: d.bbox[2],
                        y2: d.bbox[3],
                    },
                }),
                None => {
                    tracing::warn!("Dropping detection with unknown class id {}", d.class_id);
                    None
                }
            })
            .collect()
    }

    /// Frame identifier, falling back to the image name some devices send instead.
    pub fn frame(&self) -> Option<String> {
        self.frame_id.clone().or_else(|| self.image_name.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full_report() {
        let body = br#"{
            "camera_id": 3,
            "image_name": "frame_0001.jpg",
            "timestamp": "2024-05-01 09:00:00",
            "detections": [
                {"class_id": 1, "bbox": [0.1, 0.2, 0.3, 0.4], "score": 0.91},
                {"class_id": 0, "bbox": [0.0, 0.0, 1.0, 1.0], "confidence": 0.5},
                {"class_id": 7, "bbox": [0.0, 0.0, 1.0, 1.0], "score": 0.99}
            ]
        }"#;
        let report = DeviceReport::parse(body).unwrap();
        assert_eq!(report.camera_id.as_deref(), Some("3"));
        assert_eq!(report.device_id, None);
        assert_eq!(report.frame().as_deref(), Some("frame_0001.jpg"));

        let items = report.items();
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].category, WasteCategory::PetBottle);
        assert_eq!(items[0].bbox.y2, 0.4);
        assert_eq!(items[1].category, WasteCategory::MetalCan);
        assert_eq!(items[1].confidence, 0.5);
    }

    #[test]
    fn test_empty_report_is_valid() {
        let report = DeviceReport::parse(br#"{"device_id": 7}"#).unwrap();
        assert_eq!(report.device_id, Some(7));
        assert!(report.items().is_empty());
        assert!(report.frame().is_none());
    }

    #[test]
    fn test_malformed_report_salvages_identity() {
        let bad = DeviceReport::parse(br#"{"device_id": 7, "detections": "lots"}"#).unwrap_err();
        assert_eq!(bad.device_id, Some(7));
        assert_eq!(bad.camera_id, None);

        let bad = DeviceReport::parse(br#"{"camera_id": 2, "detections": [{"class_id": 1}]}"#).unwrap_err();
        assert_eq!(bad.camera_id.as_deref(), Some("2"));

        let bad = DeviceReport::parse(br#"{"camera_id": "CAM_1", "detections": 5}"#).unwrap_err();
        assert_eq!(bad.camera_id.as_deref(), Some("CAM_1"));

        let bad = DeviceReport::parse(b"not json at all").unwrap_err();
        assert_eq!(bad.device_id, None);
        assert_eq!(bad.camera_id, None);
        assert!(!bad.detail.is_empty());
    }

    #[test]
    fn test_text_camera_id_from_sender() {
        // Shape the camera sender posts in its `metadata` form field.
        let body = br#"{
            "camera_id": "CAM_0",
            "frame_id": "0_1714554000",
            "detections": [{"class_id": 2, "bbox": [1, 2, 3, 4], "score": 0.7}],
            "timestamp": ""
        }"#;
        let report = DeviceReport::parse(body).unwrap();
        assert_eq!(report.camera_id.as_deref(), Some("CAM_0"));
        assert_eq!(report.timestamp.as_deref(), Some(""));
        assert_eq!(report.items()[0].category, WasteCategory::Plastic);

        let blank = DeviceReport::parse(br#"{"camera_id": "  "}"#).unwrap();
        assert_eq!(blank.camera_id, None);
        let null = DeviceReport::parse(br#"{"camera_id": null}"#).unwrap();
        assert_eq!(null.camera_id, None);
        assert!(DeviceReport::parse(br#"{"camera_id": [1]}"#).is_err());
    }
}
