//! Connectivity probe for registered device endpoints.
//!
//! A probe never fails: every error, including a malformed endpoint or a timeout,
//! comes back as [`ProbeOutcome::Unreachable`] with a readable detail.

mod http;
mod ping;

pub use http::*;
pub use ping::*;

use crate::config::ProbeKind;

use reqwest::Url;
use std::future::Future;
use std::time::Duration;
use thiserror::Error;

/// Probe error types.
#[derive(Error, Debug)]
pub enum ProbeError {
    #[error("probe timed out after {0:?}")]
    Timeout(Duration),
    #[error("network error: {0}")]
    Network(String),
    #[error("invalid endpoint: {0}")]
    Config(String),
    #[error("command failed: {0}")]
    Command(String),
}

/// Result of a reachability check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeOutcome {
    Reachable,
    Unreachable(String),
}

/// Bounded-time reachability check against a device endpoint.
pub trait ConnectivityProbe: Send + Sync {
    /// Must resolve within `timeout` and must not touch any fleet state.
    fn probe(&self, endpoint: &str, timeout: Duration) -> impl Future<Output = ProbeOutcome> + Send;
}

/// A parsed device endpoint.
#[derive(Debug, Clone, PartialEq)]
pub struct ProbeTarget {
    /// Bare host (domain or IP literal) for ICMP.
    pub host: String,
    /// Full URL for HTTP checks; `http://` is assumed when no scheme is given.
    pub url: Url,
}

/// Parse an endpoint such as `10.0.0.7`, `cam.local:8000` or `http://host/path`.
pub fn parse_endpoint(raw: &str) -> Result<ProbeTarget, ProbeError> {
    let value = raw.trim();
    if value.is_empty() {
        return Err(ProbeError::Config("endpoint is empty".to_string()));
    }

    let with_scheme = if value.contains("://") {
        value.to_string()
    } else {
        format!("http://{}", value)
    };

    let url = Url::parse(&with_scheme)
        .map_err(|e| ProbeError::Config(format!("{}: {}", value, e)))?;
    // IPv6 literals come back bracketed.
    let host = url
        .host_str()
        .map(|h| h.trim_start_matches('[').trim_end_matches(']'))
        .filter(|h| !h.is_empty())
        .ok_or_else(|| ProbeError::Config(format!("{}: no host", value)))?
        .to_string();

    Ok(ProbeTarget { host, url })
}

/// Probe backed by real network I/O.
#[derive(Debug, Clone)]
pub struct NetworkProbe {
    kind: ProbeKind,
}

impl NetworkProbe {
    pub fn new(kind: ProbeKind) -> Self {
        Self { kind }
    }
}

impl ConnectivityProbe for NetworkProbe {
    async fn probe(&self, endpoint: &str, timeout: Duration) -> ProbeOutcome {
        let target = match parse_endpoint(endpoint) {
            Ok(t) => t,
            Err(e) => return ProbeOutcome::Unreachable(e.to_string()),
        };

        let check = async {
            match self.kind {
                ProbeKind::Ping => run_ping_probe(&target.host, timeout).await,
                ProbeKind::Http => run_http_probe(&target.url, timeout).await,
            }
        };

        // The individual checks honor the timeout too; this is the hard ceiling.
        match tokio::time::timeout(timeout, check).await {
            Ok(Ok(latency)) => {
                tracing::debug!("Probe of {} succeeded in {:?}", target.host, latency);
                ProbeOutcome::Reachable
            }
            Ok(Err(e)) => ProbeOutcome::Unreachable(e.to_string()),
            Err(_) => ProbeOutcome::Unreachable(ProbeError::Timeout(timeout).to_string()),
        }
    }
}
