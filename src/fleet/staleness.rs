//! Staleness rule for devices that went silent.

use crate::db::Device;

use chrono::{DateTime, TimeDelta, Utc};

/// Whether a device last seen at `last_seen_at` has been silent for longer than
/// `threshold`. The boundary is exclusive, and a device never seen is never stale.
pub fn is_stale(last_seen_at: Option<DateTime<Utc>>, now: DateTime<Utc>, threshold: TimeDelta) -> bool {
    match last_seen_at {
        Some(seen) => now - seen > threshold,
        None => false,
    }
}

/// Picks the online devices that must be forced offline.
#[derive(Debug, Clone, Copy)]
pub struct StalenessEvaluator {
    threshold: TimeDelta,
}

impl StalenessEvaluator {
    pub fn new(threshold: TimeDelta) -> Self {
        Self { threshold }
    }

    pub fn is_stale(&self, last_seen_at: Option<DateTime<Utc>>, now: DateTime<Utc>) -> bool {
        is_stale(last_seen_at, now, self.threshold)
    }

    /// Ids of online devices whose last contact is older than the threshold.
    pub fn stale_devices<'a, I>(&self, devices: I, now: DateTime<Utc>) -> Vec<i64>
    where
        I: IntoIterator<Item = &'a Device>,
    {
        devices
            .into_iter()
            .filter(|d| d.is_online() && self.is_stale(d.last_seen_at, now))
            .map(|d| d.device_id)
            .collect()
    }
}
