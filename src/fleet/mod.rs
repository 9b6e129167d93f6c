//! Fleet status tracking.
//!
//! [`FleetStatusService`] is the single writer of device status and of the error log.
//! It leans on [`StalenessEvaluator`] for silent devices and on
//! [`ErrorLogDeduplicator`] to fold repeated failures into bounded entries.

mod errorlog;
mod reports;
mod staleness;
mod status;

pub use errorlog::*;
pub use reports::*;
pub use staleness::*;
pub use status::*;

use crate::db::StoreError;

use thiserror::Error;

/// Fleet operation error types.
#[derive(Error, Debug)]
pub enum FleetError {
    #[error("invalid input: {0}")]
    Validation(String),
    #[error("device {0} not found")]
    NotFound(i64),
    #[error("device unreachable: {0}")]
    Unreachable(String),
    #[error("internal error: {0}")]
    Internal(#[from] StoreError),
}

impl FleetError {
    /// HTTP-style status code, also used as the error log status.
    pub fn status_code(&self) -> u16 {
        match self {
            FleetError::Validation(_) => 400,
            FleetError::NotFound(_) => 404,
            FleetError::Unreachable(_) => 503,
            FleetError::Internal(_) => 500,
        }
    }
}

/// Convert a configured duration to a chrono delta, saturating on overflow.
pub(crate) fn as_delta(d: std::time::Duration) -> chrono::TimeDelta {
    chrono::TimeDelta::from_std(d).unwrap_or(chrono::TimeDelta::MAX)
}
