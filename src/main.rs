//! binwatch - fleet status service for smart waste bins.
//!
//! Tracks device connectivity, coalesces device failures into a bounded error log
//! and serves detection statistics over HTTP.

mod config;
mod db;
mod fleet;
mod probe;
mod scheduler;
mod stats;
mod web;

use config::{ServerConfig, StoreBackend};
use db::{FleetStore, MemoryStore, SqliteStore};
use fleet::FleetStatusService;
use probe::NetworkProbe;
use scheduler::Scheduler;
use stats::StatsAggregator;
use web::Server;

use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_subscriber::EnvFilter::from_default_env()
            .add_directive("binwatch=info".parse()?))
        .init();

    // Load configuration
    let cfg = ServerConfig::load();
    tracing::info!("Starting binwatch on port {}...", cfg.http_port);

    let store: Arc<dyn FleetStore> = match cfg.store {
        StoreBackend::Sqlite => {
            tracing::info!("Using database at {}", cfg.db_path);
            Arc::new(SqliteStore::new(&cfg.db_path)?)
        }
        StoreBackend::Memory => {
            tracing::warn!("Using in-memory store, nothing will be persisted");
            Arc::new(MemoryStore::new())
        }
    };
    tracing::info!("Store initialized successfully");

    let probe = NetworkProbe::new(cfg.fleet.probe_kind);
    let fleet = Arc::new(FleetStatusService::new(store.clone(), probe, cfg.fleet.clone()));
    let stats = Arc::new(StatsAggregator::new(store));

    // Start background sweeps
    let scheduler = Scheduler::new(fleet.clone(), &cfg);
    scheduler.start().await;

    // Start web server
    let server = Server::new(cfg, fleet, stats);
    let result = server.start().await;

    scheduler.stop().await;
    result
}
