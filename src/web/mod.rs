//! Web server module.

mod handlers;

use crate::config::ServerConfig;
use crate::fleet::FleetStatusService;
use crate::probe::NetworkProbe;
use crate::stats::StatsAggregator;

use axum::{
    extract::DefaultBodyLimit,
    routing::{get, post, put},
    Router,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

/// Fleet service as wired into the server.
pub type Fleet = FleetStatusService<NetworkProbe>;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: ServerConfig,
    pub fleet: Arc<Fleet>,
    pub stats: Arc<StatsAggregator>,
}

/// HTTP front end for the fleet.
pub struct Server {
    state: AppState,
}

impl Server {
    pub fn new(config: ServerConfig, fleet: Arc<Fleet>, stats: Arc<StatsAggregator>) -> Self {
        Self {
            state: AppState { config, fleet, stats },
        }
    }

    /// Build the router with all routes.
    fn routes(&self) -> Router {
        let cors = CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any);

        Router::new()
            .route("/health", get(handlers::handle_liveness))
            // Device-facing
            .route("/api/reports", post(handlers::handle_report))
            .route("/api/errors", post(handlers::handle_failure))
            .route("/api/sweep", post(handlers::handle_sweep))
            // Devices
            .route("/api/devices", get(handlers::handle_list_devices).post(handlers::handle_create_device))
            .route("/api/devices/deleted", get(handlers::handle_list_deleted))
            .route(
                "/api/devices/{id}",
                get(handlers::handle_get_device)
                    .put(handlers::handle_update_device)
                    .delete(handlers::handle_delete_device),
            )
            .route("/api/devices/{id}/restore", put(handlers::handle_restore_device))
            .route("/api/devices/{id}/health", get(handlers::handle_health_check))
            .route("/api/devices/{id}/online", get(handlers::handle_is_online))
            .route("/api/devices/{id}/errors", get(handlers::handle_error_log))
            .route("/api/devices/{id}/waste", get(handlers::handle_waste_detail))
            .route("/api/cameras/{camera_id}", put(handlers::handle_bind_camera))
            // Dashboard
            .route("/api/dashboard/unhealthy", get(handlers::handle_unhealthy))
            .route("/api/dashboard/detections", get(handlers::handle_detection_totals))
            .route("/api/dashboard/fill", get(handlers::handle_fill_statuses))
            .route("/api/dashboard/charts", get(handlers::handle_charts))
            .route("/api/map", get(handlers::handle_map))
            .layer(cors)
            .layer(TraceLayer::new_for_http())
            .layer(DefaultBodyLimit::max(8 * 1024 * 1024)) // 8MB, room for a camera frame
            .with_state(self.state.clone())
    }

    /// Start the server on the configured port.
    pub async fn start(&self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let addr = SocketAddr::from(([0, 0, 0, 0], self.state.config.http_port));
        let router = self.routes();

        tracing::info!("Web server listening on {}", addr);

        let listener = tokio::net::TcpListener::bind(addr).await?;
        axum::serve(listener, router).await?;

        Ok(())
    }
}
