//! HTTP request handlers.

use super::AppState;
use crate::db::DeviceProfile;
use crate::fleet::{FleetError, RecordOutcome};
use crate::stats::ChartPeriod;

use axum::{
    body::Bytes,
    extract::{FromRequest, Multipart, Path, Query, Request, State},
    http::{header, StatusCode},
    response::{IntoResponse, Json, Response},
};
use chrono::Utc;
use serde::Deserialize;
use serde_json::json;

/// Error log rows returned when the caller gives no limit.
const DEFAULT_ERROR_LIMIT: i64 = 50;

impl IntoResponse for FleetError {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

pub async fn handle_liveness() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

// ============================================================================
// Device-facing
// ============================================================================

/// Accepts either raw JSON or the camera uploader's multipart form, where the report
/// rides in a `metadata` field next to the frame image.
pub async fn handle_report(State(state): State<AppState>, request: Request) -> impl IntoResponse {
    let body = match report_body(&state, request).await {
        Ok(body) => body,
        Err(e) => {
            tracing::warn!("Report rejected: {}", e);
            return e.into_response();
        }
    };
    match state.fleet.ingest_report(&body, Utc::now()) {
        Ok(receipt) => (StatusCode::CREATED, Json(receipt)).into_response(),
        Err(e) => {
            tracing::warn!("Report rejected: {}", e);
            e.into_response()
        }
    }
}

async fn report_body(state: &AppState, request: Request) -> Result<Bytes, FleetError> {
    let is_multipart = request
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.to_ascii_lowercase().starts_with("multipart/form-data"));
    if !is_multipart {
        return Bytes::from_request(request, state)
            .await
            .map_err(|e| FleetError::Validation(format!("unreadable body: {}", e)));
    }

    let bad_form = |e: axum::extract::multipart::MultipartError| {
        FleetError::Validation(format!("bad multipart body: {}", e))
    };
    let mut multipart = Multipart::from_request(request, state)
        .await
        .map_err(|e| FleetError::Validation(format!("bad multipart body: {}", e)))?;
    let mut metadata = None;
    while let Some(field) = multipart.next_field().await.map_err(bad_form)? {
        let name = field.name().map(str::to_string);
        // The image part is drained and discarded.
        let data = field.bytes().await.map_err(bad_form)?;
        if name.as_deref() == Some("metadata") {
            metadata = Some(data);
        }
    }
    metadata.ok_or_else(|| FleetError::Validation("multipart report has no metadata field".to_string()))
}

pub async fn handle_failure(State(state): State<AppState>, body: Bytes) -> impl IntoResponse {
    match state.fleet.ingest_failure(&body, Utc::now()) {
        Ok(RecordOutcome::Opened(entry)) => (StatusCode::CREATED, Json(entry)).into_response(),
        Ok(outcome) => match outcome.entry() {
            Some(entry) => Json(entry.clone()).into_response(),
            None => StatusCode::NO_CONTENT.into_response(),
        },
        Err(e) => e.into_response(),
    }
}

pub async fn handle_sweep(State(state): State<AppState>) -> impl IntoResponse {
    match state.fleet.sweep_stale(Utc::now()) {
        Ok(swept) => Json(json!({ "marked_offline": swept })).into_response(),
        Err(e) => e.into_response(),
    }
}

// ============================================================================
// API: Devices
// ============================================================================

pub async fn handle_list_devices(State(state): State<AppState>) -> impl IntoResponse {
    match state.fleet.list_devices(false) {
        Ok(devices) => Json(devices).into_response(),
        Err(e) => e.into_response(),
    }
}

pub async fn handle_list_deleted(State(state): State<AppState>) -> impl IntoResponse {
    match state.fleet.list_devices(true) {
        Ok(devices) => Json(devices).into_response(),
        Err(e) => e.into_response(),
    }
}

pub async fn handle_create_device(
    State(state): State<AppState>,
    Json(profile): Json<DeviceProfile>,
) -> impl IntoResponse {
    match state.fleet.provision(&profile) {
        Ok(device) => (StatusCode::CREATED, Json(device)).into_response(),
        Err(e) => e.into_response(),
    }
}

pub async fn handle_get_device(State(state): State<AppState>, Path(id): Path<i64>) -> impl IntoResponse {
    let device = match state.fleet.device_detail(id, Utc::now()) {
        Ok(device) => device,
        Err(e) => return e.into_response(),
    };
    match state.stats.device_summary(device) {
        Ok(summary) => Json(summary).into_response(),
        Err(e) => FleetError::from(e).into_response(),
    }
}

pub async fn handle_waste_detail(State(state): State<AppState>, Path(id): Path<i64>) -> impl IntoResponse {
    match state.stats.waste_detail(id) {
        Ok(Some(detail)) => Json(detail).into_response(),
        Ok(None) => FleetError::NotFound(id).into_response(),
        Err(e) => FleetError::from(e).into_response(),
    }
}

pub async fn handle_update_device(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(profile): Json<DeviceProfile>,
) -> impl IntoResponse {
    match state.fleet.update_profile(id, &profile) {
        Ok(device) => Json(device).into_response(),
        Err(e) => e.into_response(),
    }
}

pub async fn handle_delete_device(State(state): State<AppState>, Path(id): Path<i64>) -> impl IntoResponse {
    match state.fleet.soft_delete(id) {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => e.into_response(),
    }
}

pub async fn handle_restore_device(State(state): State<AppState>, Path(id): Path<i64>) -> impl IntoResponse {
    match state.fleet.restore(id) {
        Ok(device) => Json(device).into_response(),
        Err(e) => e.into_response(),
    }
}

pub async fn handle_health_check(State(state): State<AppState>, Path(id): Path<i64>) -> impl IntoResponse {
    match state.fleet.check_health(id, Utc::now()).await {
        Ok(check) => Json(check).into_response(),
        Err(e) => e.into_response(),
    }
}

pub async fn handle_is_online(State(state): State<AppState>, Path(id): Path<i64>) -> impl IntoResponse {
    match state.fleet.is_online(id) {
        Ok(online) => Json(json!({ "device_id": id, "online": online })).into_response(),
        Err(e) => e.into_response(),
    }
}

#[derive(Debug, Deserialize)]
pub struct ErrorLogQuery {
    pub limit: Option<i64>,
}

pub async fn handle_error_log(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Query(query): Query<ErrorLogQuery>,
) -> impl IntoResponse {
    match state.fleet.error_log(id, error_limit(query.limit)) {
        Ok(entries) => Json(entries).into_response(),
        Err(e) => e.into_response(),
    }
}

/// Zero or negative means no limit.
fn error_limit(requested: Option<i64>) -> Option<usize> {
    let limit = requested.unwrap_or(DEFAULT_ERROR_LIMIT);
    usize::try_from(limit).ok().filter(|l| *l > 0)
}

#[derive(Debug, Deserialize)]
pub struct BindCameraRequest {
    pub device_id: i64,
}

pub async fn handle_bind_camera(
    State(state): State<AppState>,
    Path(camera_id): Path<String>,
    Json(req): Json<BindCameraRequest>,
) -> impl IntoResponse {
    match state.fleet.bind_camera(&camera_id, req.device_id) {
        Ok(()) => Json(json!({ "camera_id": camera_id, "device_id": req.device_id })).into_response(),
        Err(e) => e.into_response(),
    }
}

// ============================================================================
// API: Dashboard
// ============================================================================

pub async fn handle_unhealthy(State(state): State<AppState>) -> impl IntoResponse {
    let now = Utc::now();
    if let Err(e) = state.fleet.sweep_stale(now) {
        return e.into_response();
    }
    match state.fleet.list_unhealthy(now) {
        Ok(devices) => Json(devices).into_response(),
        Err(e) => e.into_response(),
    }
}

pub async fn handle_detection_totals(State(state): State<AppState>) -> impl IntoResponse {
    match state.stats.detection_totals() {
        Ok(totals) => Json(totals).into_response(),
        Err(e) => FleetError::from(e).into_response(),
    }
}

pub async fn handle_fill_statuses(State(state): State<AppState>) -> impl IntoResponse {
    match state.stats.fill_statuses() {
        Ok(entries) => Json(entries).into_response(),
        Err(e) => FleetError::from(e).into_response(),
    }
}

#[derive(Debug, Deserialize)]
pub struct ChartsQuery {
    pub period: Option<String>,
}

pub async fn handle_charts(State(state): State<AppState>, Query(query): Query<ChartsQuery>) -> impl IntoResponse {
    // Anything unrecognized falls back to the weekly view.
    let period = query
        .period
        .as_deref()
        .and_then(|p| p.parse::<ChartPeriod>().ok())
        .unwrap_or(ChartPeriod::Week);

    match state.stats.charts(period, Utc::now().date_naive()) {
        Ok(summary) => Json(summary).into_response(),
        Err(e) => FleetError::from(e).into_response(),
    }
}

pub async fn handle_map(State(state): State<AppState>) -> impl IntoResponse {
    match state.stats.map_view() {
        Ok(view) => Json(view).into_response(),
        Err(e) => FleetError::from(e).into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerConfig;
    use crate::db::{FleetStore, MemoryStore};
    use crate::fleet::{FailureObservation, FleetStatusService};
    use crate::probe::NetworkProbe;
    use crate::stats::StatsAggregator;
    use axum::body::Body;
    use std::sync::Arc;

    fn state() -> AppState {
        let config = ServerConfig::default();
        let store: Arc<dyn FleetStore> = Arc::new(MemoryStore::new());
        let fleet = FleetStatusService::new(
            store.clone(),
            NetworkProbe::new(config.fleet.probe_kind),
            config.fleet.clone(),
        );
        AppState {
            config,
            fleet: Arc::new(fleet),
            stats: Arc::new(StatsAggregator::new(store)),
        }
    }

    fn profile(name: &str) -> DeviceProfile {
        DeviceProfile { name: name.to_string(), ..Default::default() }
    }

    fn json_request(body: impl Into<Body>) -> Request {
        axum::http::Request::builder()
            .header(header::CONTENT_TYPE, "application/json")
            .body(body.into())
            .unwrap()
    }

    /// Multipart upload shaped like the camera sender's: a `metadata` JSON field and
    /// a JPEG `file` part.
    fn multipart_request(metadata: Option<&str>) -> Request {
        let boundary = "binwatch-test-boundary";
        let mut body: Vec<u8> = Vec::new();
        if let Some(metadata) = metadata {
            body.extend_from_slice(
                format!(
                    "--{b}\r\nContent-Disposition: form-data; name=\"metadata\"\r\n\r\n{m}\r\n",
                    b = boundary,
                    m = metadata
                )
                .as_bytes(),
            );
        }
        body.extend_from_slice(
            format!(
                "--{b}\r\nContent-Disposition: form-data; name=\"file\"; filename=\"0_1.jpg\"\r\nContent-Type: image/jpeg\r\n\r\n",
                b = boundary
            )
            .as_bytes(),
        );
        body.extend_from_slice(&[0xFF, 0xD8, 0xFF, 0xE0, 0x00, 0x10, 0xFF, 0xD9]);
        body.extend_from_slice(format!("\r\n--{}--\r\n", boundary).as_bytes());

        axum::http::Request::builder()
            .header(
                header::CONTENT_TYPE,
                format!("multipart/form-data; boundary={}", boundary),
            )
            .body(Body::from(body))
            .unwrap()
    }

    #[test]
    fn test_error_status_mapping() {
        assert_eq!(FleetError::NotFound(1).into_response().status(), StatusCode::NOT_FOUND);
        assert_eq!(
            FleetError::Validation("x".to_string()).into_response().status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            FleetError::Unreachable("x".to_string()).into_response().status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
    }

    #[tokio::test]
    async fn test_report_endpoint_statuses() {
        let state = state();
        let device = state.fleet.provision(&profile("bin")).unwrap();

        let ok = handle_report(
            State(state.clone()),
            json_request(format!(r#"{{"device_id": {}}}"#, device.device_id)),
        )
        .await
        .into_response();
        assert_eq!(ok.status(), StatusCode::CREATED);

        let missing = handle_report(State(state.clone()), json_request(r#"{"device_id": 404}"#))
            .await
            .into_response();
        assert_eq!(missing.status(), StatusCode::NOT_FOUND);

        let garbage = handle_report(State(state), json_request("{")).await.into_response();
        assert_eq!(garbage.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_multipart_report_from_camera() {
        let state = state();
        let device = state.fleet.provision(&profile("bin")).unwrap();
        state.fleet.bind_camera("CAM_0", device.device_id).unwrap();

        let metadata = r#"{"camera_id": "CAM_0", "frame_id": "0_1", "detections": [{"class_id": 1, "bbox": [1, 2, 3, 4], "score": 0.9}], "timestamp": ""}"#;
        let response = handle_report(State(state.clone()), multipart_request(Some(metadata)))
            .await
            .into_response();
        assert_eq!(response.status(), StatusCode::CREATED);
        assert!(state.fleet.is_online(device.device_id).unwrap());
        assert_eq!(state.stats.detection_totals().unwrap().total_objects, 1);

        let no_metadata = handle_report(State(state), multipart_request(None)).await.into_response();
        assert_eq!(no_metadata.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_malformed_failure_body_gets_json_error() {
        let state = state();
        let device = state.fleet.provision(&profile("bin")).unwrap();

        let body = format!(r#"{{"device_id": {}, "message": 7}}"#, device.device_id);
        let response = handle_failure(State(state.clone()), Bytes::from(body)).await.into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let json: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert!(json["error"].as_str().is_some());
        assert_eq!(state.fleet.error_log(device.device_id, None).unwrap().len(), 1);

        let good = format!(r#"{{"device_id": {}, "status_code": 500, "message": "X"}}"#, device.device_id);
        let created = handle_failure(State(state), Bytes::from(good)).await.into_response();
        assert_eq!(created.status(), StatusCode::CREATED);
    }

    #[tokio::test]
    async fn test_device_summary_and_waste_endpoints() {
        let state = state();
        let device = state
            .fleet
            .provision(&DeviceProfile { capacity: Some(50), current_volume: Some(20), ..profile("bin") })
            .unwrap();
        let report = format!(
            r#"{{"device_id": {}, "detections": [{{"class_id": 3, "bbox": [0, 0, 1, 1], "score": 0.6}}]}}"#,
            device.device_id
        );
        state.fleet.ingest_report(report.as_bytes(), Utc::now()).unwrap();

        let response = handle_get_device(State(state.clone()), Path(device.device_id)).await.into_response();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let json: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(json["free_capacity"], 30);
        assert_eq!(json["detections"]["total_objects"], 1);
        assert_eq!(json["detections"]["items_by_type"]["Styrofoam"], 1);

        let waste = handle_waste_detail(State(state.clone()), Path(device.device_id)).await.into_response();
        assert_eq!(waste.status(), StatusCode::OK);
        let missing = handle_waste_detail(State(state), Path(999)).await.into_response();
        assert_eq!(missing.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_health_check_without_endpoint() {
        let state = state();
        let device = state.fleet.provision(&profile("bin")).unwrap();
        let response = handle_health_check(State(state), Path(device.device_id)).await.into_response();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_error_log_limits() {
        let state = state();
        let device = state.fleet.provision(&profile("bin")).unwrap();
        for code in 0..3 {
            let obs = FailureObservation::for_device(device.device_id, 500 + code, "fault");
            state.fleet.record_failure(&obs, Utc::now()).unwrap();
        }

        assert_eq!(error_limit(None), Some(50));
        assert_eq!(error_limit(Some(0)), None);
        assert_eq!(error_limit(Some(-1)), None);
        for (limit, expected) in [(Some(2), 2), (Some(0), 3), (None, 3)] {
            let entries = state.fleet.error_log(device.device_id, error_limit(limit)).unwrap();
            assert_eq!(entries.len(), expected);
        }

        let response = handle_error_log(State(state), Path(999), Query(ErrorLogQuery { limit: None }))
            .await
            .into_response();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_device_lifecycle_endpoints() {
        let state = state();
        let created = handle_create_device(State(state.clone()), Json(profile("bin"))).await.into_response();
        assert_eq!(created.status(), StatusCode::CREATED);

        let deleted = handle_delete_device(State(state.clone()), Path(1)).await.into_response();
        assert_eq!(deleted.status(), StatusCode::NO_CONTENT);

        let online = handle_is_online(State(state.clone()), Path(1)).await.into_response();
        assert_eq!(online.status(), StatusCode::NOT_FOUND);

        let restored = handle_restore_device(State(state.clone()), Path(1)).await.into_response();
        assert_eq!(restored.status(), StatusCode::OK);

        let bind = handle_bind_camera(State(state), Path("CAM_3".to_string()), Json(BindCameraRequest { device_id: 1 }))
            .await
            .into_response();
        assert_eq!(bind.status(), StatusCode::OK);
    }
}
