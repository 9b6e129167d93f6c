//! Fleet status service: device state transitions, the query surface and the
//! device lifecycle.

use super::{as_delta, ErrorLogDeduplicator, FailureObservation, FleetError, RecordOutcome, SkipReason};
use super::{parse_body, DeviceReport, MalformedReport, StalenessEvaluator};
use crate::config::FleetConfig;
use crate::db::{DetectionEvent, Device, DeviceProfile, ErrorLogEntry, FleetStore, StoreError};
use crate::probe::{ConnectivityProbe, ProbeOutcome};

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;

/// City bucket for devices without one.
pub const UNKNOWN_CITY: &str = "unknown";

pub const MSG_HEALTHY: &str = "Server is healthy";
pub const MSG_NO_ENDPOINT: &str = "Server URL not found";
pub const MSG_CONNECT_FAILED: &str = "Failed to connect to server";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Ok,
    Error,
}

/// Result of an on-demand health check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HealthCheck {
    pub device_id: i64,
    pub status: HealthStatus,
    pub message: String,
}

impl HealthCheck {
    fn ok(device_id: i64) -> Self {
        Self { device_id, status: HealthStatus::Ok, message: MSG_HEALTHY.to_string() }
    }

    fn error(device_id: i64, message: &str) -> Self {
        Self { device_id, status: HealthStatus::Error, message: message.to_string() }
    }

    pub fn is_ok(&self) -> bool {
        self.status == HealthStatus::Ok
    }
}

/// Acknowledgement for an accepted report.
#[derive(Debug, Clone, Serialize)]
pub struct ReportReceipt {
    pub device_id: i64,
    pub detection_id: i64,
    pub object_count: usize,
}

/// Sole writer of device status and of the error log.
///
/// Status transitions always happen before the matching log write. A failed log write
/// is warned about and never undoes or masks the transition.
pub struct FleetStatusService<P> {
    store: Arc<dyn FleetStore>,
    probe: P,
    errors: ErrorLogDeduplicator,
    staleness: StalenessEvaluator,
    config: FleetConfig,
}

impl<P: ConnectivityProbe> FleetStatusService<P> {
    pub fn new(store: Arc<dyn FleetStore>, probe: P, config: FleetConfig) -> Self {
        let errors = ErrorLogDeduplicator::new(
            store.clone(),
            as_delta(config.coalesce_window),
            config.strictness,
        );
        let staleness = StalenessEvaluator::new(as_delta(config.stale_after));
        Self { store, probe, errors, staleness, config }
    }

    // ---- failure recording ----

    /// Best-effort log write for a failure the service itself observed.
    fn log_failure(&self, obs: &FailureObservation, now: DateTime<Utc>) -> Option<RecordOutcome> {
        match self.errors.record(obs, now) {
            Ok(outcome) => Some(outcome),
            Err(e) => {
                tracing::warn!("Failed to write error log for {:?}: {}", obs, e);
                None
            }
        }
    }

    /// Log an unexpected store fault and hand it back for the caller.
    fn internal(
        &self,
        device_id: Option<i64>,
        reporter_id: Option<String>,
        context: &str,
        err: StoreError,
        now: DateTime<Utc>,
    ) -> FleetError {
        tracing::error!("{}: {}", context, err);
        let obs = FailureObservation {
            device_id,
            reporter_id,
            status_code: 500,
            message: context.to_string(),
            occurred_at: None,
        };
        self.log_failure(&obs, now);
        FleetError::Internal(err)
    }

    /// Record a failure submitted by a device or camera.
    pub fn record_failure(&self, obs: &FailureObservation, now: DateTime<Utc>) -> Result<RecordOutcome, FleetError> {
        if obs.message.trim().is_empty() {
            return Err(FleetError::Validation("message must not be empty".to_string()));
        }
        let outcome = self
            .errors
            .record(obs, now)
            .map_err(|e| {
                self.internal(obs.device_id, obs.reporter_id.clone(), "Failed to record device failure", e, now)
            })?;
        match outcome {
            RecordOutcome::Skipped(SkipReason::UnknownDevice(id)) => Err(FleetError::NotFound(id)),
            RecordOutcome::Skipped(SkipReason::NoSubject) => Err(FleetError::Validation(
                "either device_id or reporter_id is required".to_string(),
            )),
            outcome => Ok(outcome),
        }
    }

    /// Accept a raw failure body from a device or camera.
    pub fn ingest_failure(&self, body: &[u8], now: DateTime<Utc>) -> Result<RecordOutcome, FleetError> {
        match parse_body::<FailureObservation>(body) {
            Ok(obs) => self.record_failure(&obs, now),
            Err(bad) => Err(self.reject_malformed("Malformed failure report", bad, now)),
        }
    }

    /// Log a body that failed to parse against whatever key it still names.
    fn reject_malformed(&self, message: &str, bad: MalformedReport, now: DateTime<Utc>) -> FleetError {
        tracing::warn!("{}: {}", message, bad.detail);
        let obs = FailureObservation {
            device_id: bad.device_id,
            reporter_id: bad.camera_id,
            status_code: 400,
            message: message.to_string(),
            occurred_at: None,
        };
        if obs.device_id.is_some() || obs.reporter_id.is_some() {
            self.log_failure(&obs, now);
        }
        FleetError::Validation(format!("{}: {}", message.to_lowercase(), bad.detail))
    }

    // ---- reports ----

    /// Accept a raw report body from a device.
    pub fn ingest_report(&self, body: &[u8], now: DateTime<Utc>) -> Result<ReportReceipt, FleetError> {
        let report = match DeviceReport::parse(body) {
            Ok(report) => report,
            Err(bad) => return Err(self.reject_malformed("Malformed report", bad, now)),
        };
        self.accept_report(&report, now)
    }

    pub fn accept_report(&self, report: &DeviceReport, now: DateTime<Utc>) -> Result<ReportReceipt, FleetError> {
        let device = self.resolve_reporter(report, now)?;
        let id = device.device_id;

        let detected_at = report
            .timestamp
            .as_deref()
            .and_then(crate::db::parse_timestamp)
            .unwrap_or(now);
        let items = report.items();

        self.store
            .mark_online(id, now)
            .map_err(|e| self.internal(Some(id), report.camera_id.clone(), "Failed to update device status", e, now))?;

        let event = DetectionEvent {
            device_id: id,
            frame_id: report.frame(),
            detected_at,
            items,
        };
        let city = device.city.as_deref().unwrap_or(UNKNOWN_CITY);
        let detection_id = self
            .store
            .record_detection(&event, city)
            .map_err(|e| self.internal(Some(id), report.camera_id.clone(), "Failed to store detection", e, now))?;

        tracing::debug!("Accepted report from device {} with {} objects", id, event.items.len());
        Ok(ReportReceipt {
            device_id: id,
            detection_id,
            object_count: event.items.len(),
        })
    }

    fn resolve_reporter(&self, report: &DeviceReport, now: DateTime<Utc>) -> Result<Device, FleetError> {
        let lookup_failed =
            |e| self.internal(report.device_id, report.camera_id.clone(), "Failed to resolve reporting device", e, now);

        match (report.device_id, report.camera_id.as_deref()) {
            (Some(id), _) => match self.store.get_device(id).map_err(lookup_failed)? {
                Some(device) if !device.is_deleted() => Ok(device),
                _ => Err(FleetError::NotFound(id)),
            },
            (None, Some(camera)) => {
                let device = match self.store.camera_device(camera).map_err(lookup_failed)? {
                    Some(id) => self.store.get_device(id).map_err(lookup_failed)?,
                    None => None,
                };
                match device {
                    Some(device) if !device.is_deleted() => Ok(device),
                    _ => {
                        self.log_failure(&FailureObservation::for_reporter(camera, 400, "Unknown camera"), now);
                        Err(FleetError::Validation(format!(
                            "camera {} is not bound to an active device",
                            camera
                        )))
                    }
                }
            }
            (None, None) => Err(FleetError::Validation(
                "report names neither device_id nor camera_id".to_string(),
            )),
        }
    }

    // ---- probing ----

    /// Probe a device's endpoint and apply the resulting transition.
    pub async fn check_health(&self, device_id: i64, now: DateTime<Utc>) -> Result<HealthCheck, FleetError> {
        let device = match self.store.get_device(device_id) {
            Ok(Some(device)) if !device.is_deleted() => device,
            Ok(_) => return Ok(HealthCheck::error(device_id, MSG_NO_ENDPOINT)),
            Err(e) => return Err(self.internal(Some(device_id), None, "Failed to load device", e, now)),
        };

        let Some(endpoint) = device.endpoint.as_deref().filter(|e| !e.trim().is_empty()) else {
            self.log_failure(&FailureObservation::for_device(device_id, 400, MSG_NO_ENDPOINT), now);
            return Ok(HealthCheck::error(device_id, MSG_NO_ENDPOINT));
        };

        let outcome = self.probe.probe(endpoint, self.config.probe_timeout).await;
        self.apply_probe_outcome(device_id, outcome, now)
    }

    fn apply_probe_outcome(
        &self,
        device_id: i64,
        outcome: ProbeOutcome,
        now: DateTime<Utc>,
    ) -> Result<HealthCheck, FleetError> {
        match outcome {
            ProbeOutcome::Reachable => {
                self.store
                    .mark_online(device_id, now)
                    .map_err(|e| self.internal(Some(device_id), None, "Failed to update device status", e, now))?;
                Ok(HealthCheck::ok(device_id))
            }
            ProbeOutcome::Unreachable(detail) => {
                let failure = FleetError::Unreachable(detail);
                tracing::warn!("Device {}: {}", device_id, failure);
                self.store
                    .mark_offline(device_id)
                    .map_err(|e| self.internal(Some(device_id), None, "Failed to update device status", e, now))?;
                let status = i32::from(failure.status_code());
                self.log_failure(&FailureObservation::for_device(device_id, status, MSG_CONNECT_FAILED), now);
                Ok(HealthCheck::error(device_id, MSG_CONNECT_FAILED))
            }
        }
    }

    /// Ids of active devices that have an endpoint to probe.
    pub fn probe_targets(&self) -> Result<Vec<i64>, FleetError> {
        Ok(self
            .store
            .list_devices()?
            .into_iter()
            .filter(|d| !d.is_deleted() && d.endpoint.as_deref().is_some_and(|e| !e.trim().is_empty()))
            .map(|d| d.device_id)
            .collect())
    }

    // ---- staleness ----

    /// Force offline every online device silent for longer than the threshold.
    /// Returns the ids that actually changed.
    pub fn sweep_stale(&self, now: DateTime<Utc>) -> Result<Vec<i64>, FleetError> {
        let devices = self.store.list_devices()?;
        let mut swept = Vec::new();
        for id in self.staleness.stale_devices(&devices, now) {
            if self.store.mark_offline(id)? {
                swept.push(id);
            }
        }
        if !swept.is_empty() {
            tracing::info!("Staleness sweep marked {} device(s) offline: {:?}", swept.len(), swept);
        }
        Ok(swept)
    }

    // ---- queries ----

    fn active_device(&self, device_id: i64) -> Result<Device, FleetError> {
        match self.store.get_device(device_id)? {
            Some(device) if !device.is_deleted() => Ok(device),
            _ => Err(FleetError::NotFound(device_id)),
        }
    }

    pub fn is_online(&self, device_id: i64) -> Result<bool, FleetError> {
        Ok(self.active_device(device_id)?.is_online())
    }

    /// Offline devices plus online ones with a recent error, most recently seen first.
    pub fn list_unhealthy(&self, now: DateTime<Utc>) -> Result<Vec<Device>, FleetError> {
        // An oversized window reaches back to the beginning of time.
        let cutoff = now
            .checked_sub_signed(as_delta(self.config.unhealthy_recency))
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        let recent = self.store.devices_with_errors_since(cutoff)?;
        let mut devices: Vec<Device> = self
            .store
            .list_devices()?
            .into_iter()
            .filter(|d| !d.is_deleted() && (!d.is_online() || recent.contains(&d.device_id)))
            .collect();
        devices.sort_by(|a, b| {
            b.last_seen_at
                .cmp(&a.last_seen_at)
                .then_with(|| a.device_id.cmp(&b.device_id))
        });
        Ok(devices)
    }

    /// Newest-first error history; `None` returns everything.
    pub fn error_log(&self, device_id: i64, limit: Option<usize>) -> Result<Vec<ErrorLogEntry>, FleetError> {
        self.active_device(device_id)?;
        Ok(self.store.error_entries_for_device(device_id, limit)?)
    }

    // ---- lifecycle ----

    fn validate_profile(profile: &DeviceProfile) -> Result<(), FleetError> {
        if profile.name.trim().is_empty() {
            return Err(FleetError::Validation("name must not be empty".to_string()));
        }
        if profile.capacity.is_some_and(|c| c < 0) || profile.current_volume.is_some_and(|v| v < 0) {
            return Err(FleetError::Validation("capacity and volume must not be negative".to_string()));
        }
        Ok(())
    }

    pub fn provision(&self, profile: &DeviceProfile) -> Result<Device, FleetError> {
        Self::validate_profile(profile)?;
        let device = self.store.insert_device(profile)?;
        tracing::info!("Provisioned device {} ({})", device.device_id, device.name);
        Ok(device)
    }

    pub fn update_profile(&self, device_id: i64, profile: &DeviceProfile) -> Result<Device, FleetError> {
        Self::validate_profile(profile)?;
        if !self.store.update_device_profile(device_id, profile)? {
            return Err(FleetError::NotFound(device_id));
        }
        self.store
            .get_device(device_id)?
            .ok_or(FleetError::NotFound(device_id))
    }

    pub fn soft_delete(&self, device_id: i64) -> Result<(), FleetError> {
        self.active_device(device_id)?;
        self.store.set_deleted(device_id, true)?;
        tracing::info!("Deleted device {}", device_id);
        Ok(())
    }

    /// Bring a deleted device back. It returns offline until it next makes contact.
    pub fn restore(&self, device_id: i64) -> Result<Device, FleetError> {
        match self.store.get_device(device_id)? {
            Some(device) if device.is_deleted() => {
                self.store.set_deleted(device_id, false)?;
                tracing::info!("Restored device {}", device_id);
                self.store
                    .get_device(device_id)?
                    .ok_or(FleetError::NotFound(device_id))
            }
            Some(device) => Ok(device),
            None => Err(FleetError::NotFound(device_id)),
        }
    }

    pub fn bind_camera(&self, camera_id: &str, device_id: i64) -> Result<(), FleetError> {
        let camera_id = camera_id.trim();
        if camera_id.is_empty() {
            return Err(FleetError::Validation("camera id must not be empty".to_string()));
        }
        self.active_device(device_id)?;
        self.store.bind_camera(camera_id, device_id).map_err(|e| match e {
            StoreError::NotFound => FleetError::NotFound(device_id),
            other => FleetError::Internal(other),
        })
    }

    /// Device detail. Sweeps first so the state shown is current.
    pub fn device_detail(&self, device_id: i64, now: DateTime<Utc>) -> Result<Device, FleetError> {
        self.sweep_stale(now)?;
        self.active_device(device_id)
    }

    pub fn list_devices(&self, deleted: bool) -> Result<Vec<Device>, FleetError> {
        Ok(self
            .store
            .list_devices()?
            .into_iter()
            .filter(|d| d.is_deleted() == deleted)
            .collect())
    }
}
