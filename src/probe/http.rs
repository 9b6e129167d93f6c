//! HTTP reachability check.

use reqwest::Url;
use std::time::{Duration, Instant};

use super::ProbeError;

/// Issue a GET against the endpoint and return the time to the response headers.
///
/// Any HTTP response counts as reachable, error statuses included: the device's
/// server answered, which is all this check establishes.
pub async fn run_http_probe(url: &Url, timeout: Duration) -> Result<Duration, ProbeError> {
    let client = reqwest::Client::builder()
        .timeout(timeout)
        .connect_timeout(timeout)
        .build()
        .map_err(|e| ProbeError::Network(e.to_string()))?;

    let start = Instant::now();

    let response = client.get(url.clone()).send().await.map_err(|e| {
        if e.is_timeout() {
            ProbeError::Timeout(timeout)
        } else if e.is_connect() {
            ProbeError::Network(format!("failed to connect to {}", url))
        } else {
            ProbeError::Network(e.to_string())
        }
    })?;

    let elapsed = start.elapsed();
    tracing::trace!("HTTP probe {} answered {}", url, response.status());
    Ok(elapsed)
}
