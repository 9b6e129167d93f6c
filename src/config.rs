//! Configuration module for binwatch.
//!
//! Loads configuration from environment variables with sensible defaults.

use std::env;
use std::str::FromStr;
use std::time::Duration;

/// Which backing store to open at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreBackend {
    Sqlite,
    Memory,
}

impl FromStr for StoreBackend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "sqlite" => Ok(Self::Sqlite),
            "memory" => Ok(Self::Memory),
            other => Err(format!("unknown store backend: {}", other)),
        }
    }
}

/// Which reachability check the connectivity probe performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeKind {
    Ping,
    Http,
}

impl FromStr for ProbeKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "ping" => Ok(Self::Ping),
            "http" => Ok(Self::Http),
            other => Err(format!("unknown probe kind: {}", other)),
        }
    }
}

/// How concurrent failure observations for the same coalescing key are handled.
///
/// `Relaxed` lets two observations race between the lookup and the write, which can
/// yield a lost increment or a duplicate entry. `PerKey` serializes observations that
/// share a key behind a key-partitioned mutex.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoalesceStrictness {
    Relaxed,
    PerKey,
}

impl FromStr for CoalesceStrictness {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "relaxed" => Ok(Self::Relaxed),
            "per-key" | "per_key" | "perkey" => Ok(Self::PerKey),
            other => Err(format!("unknown coalesce strictness: {}", other)),
        }
    }
}

/// Tunables for fleet status tracking.
#[derive(Debug, Clone)]
pub struct FleetConfig {
    /// A device silent for longer than this is swept offline (default: 5m)
    pub stale_after: Duration,
    /// Failures closer together than this share one log entry (default: 1m)
    pub coalesce_window: Duration,
    /// Online devices with an error this recent still count as unhealthy (default: 1m)
    pub unhealthy_recency: Duration,
    /// Upper bound on a single connectivity probe (default: 3s)
    pub probe_timeout: Duration,
    pub probe_kind: ProbeKind,
    pub strictness: CoalesceStrictness,
}

impl Default for FleetConfig {
    fn default() -> Self {
        Self {
            stale_after: Duration::from_secs(5 * 60),
            coalesce_window: Duration::from_secs(60),
            unhealthy_recency: Duration::from_secs(60),
            probe_timeout: Duration::from_secs(3),
            probe_kind: ProbeKind::Ping,
            strictness: CoalesceStrictness::PerKey,
        }
    }
}

/// Server configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// HTTP port for the web server (default: 8080)
    pub http_port: u16,
    /// Path to the SQLite database file (default: "binwatch.db")
    pub db_path: String,
    pub store: StoreBackend,
    /// Period of the background staleness sweep; zero disables it (default: 60s)
    pub sweep_interval: Duration,
    /// Period of the background probe sweep; zero disables it (default: disabled)
    pub probe_sweep_interval: Duration,
    pub fleet: FleetConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_port: 8080,
            db_path: "binwatch.db".to_string(),
            store: StoreBackend::Sqlite,
            sweep_interval: Duration::from_secs(60),
            probe_sweep_interval: Duration::ZERO,
            fleet: FleetConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Load configuration from environment variables.
    ///
    /// Environment variables:
    /// - `BINWATCH_HTTP_PORT`: HTTP port (default: 8080)
    /// - `BINWATCH_DB_PATH`: Database file path (default: "binwatch.db")
    /// - `BINWATCH_STORE`: `sqlite` or `memory` (default: sqlite)
    /// - `BINWATCH_STALE_AFTER_SECS`: staleness threshold (default: 300)
    /// - `BINWATCH_COALESCE_WINDOW_SECS`: error coalescing window (default: 60)
    /// - `BINWATCH_UNHEALTHY_RECENCY_SECS`: recent-error window (default: 60)
    /// - `BINWATCH_PROBE_TIMEOUT_SECS`: probe timeout (default: 3)
    /// - `BINWATCH_PROBE_KIND`: `ping` or `http` (default: ping)
    /// - `BINWATCH_SWEEP_INTERVAL_SECS`: staleness sweep period (default: 60)
    /// - `BINWATCH_PROBE_SWEEP_INTERVAL_SECS`: probe sweep period (default: 0, off)
    /// - `BINWATCH_COALESCE_STRICTNESS`: `relaxed` or `per-key` (default: per-key)
    ///
    /// Values that fail to parse are ignored with a warning.
    pub fn load() -> Self {
        let mut cfg = Self::default();

        if let Some(port) = parse_var("BINWATCH_HTTP_PORT") {
            cfg.http_port = port;
        }
        if let Ok(db_path) = env::var("BINWATCH_DB_PATH") {
            cfg.db_path = db_path;
        }
        if let Some(store) = parse_var("BINWATCH_STORE") {
            cfg.store = store;
        }
        if let Some(secs) = parse_var::<u64>("BINWATCH_SWEEP_INTERVAL_SECS") {
            cfg.sweep_interval = Duration::from_secs(secs);
        }
        if let Some(secs) = parse_var::<u64>("BINWATCH_PROBE_SWEEP_INTERVAL_SECS") {
            cfg.probe_sweep_interval = Duration::from_secs(secs);
        }

        let fleet = &mut cfg.fleet;
        if let Some(secs) = parse_var::<u64>("BINWATCH_STALE_AFTER_SECS") {
            fleet.stale_after = Duration::from_secs(secs);
        }
        if let Some(secs) = parse_var::<u64>("BINWATCH_COALESCE_WINDOW_SECS") {
            fleet.coalesce_window = Duration::from_secs(secs);
        }
        if let Some(secs) = parse_var::<u64>("BINWATCH_UNHEALTHY_RECENCY_SECS") {
            fleet.unhealthy_recency = Duration::from_secs(secs);
        }
        if let Some(secs) = parse_var::<u64>("BINWATCH_PROBE_TIMEOUT_SECS") {
            fleet.probe_timeout = Duration::from_secs(secs.max(1));
        }
        if let Some(kind) = parse_var("BINWATCH_PROBE_KIND") {
            fleet.probe_kind = kind;
        }
        if let Some(strictness) = parse_var("BINWATCH_COALESCE_STRICTNESS") {
            fleet.strictness = strictness;
        }

        cfg
    }
}

fn parse_var<T>(name: &str) -> Option<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    let raw = env::var(name).ok()?;
    match raw.parse() {
        Ok(v) => Some(v),
        Err(e) => {
            tracing::warn!("Ignoring {}={:?}: {}", name, raw, e);
            None
        }
    }
}
