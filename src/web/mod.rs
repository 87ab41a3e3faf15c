//! Web server module.

mod handlers;

pub use handlers::*;

use crate::config::ServerConfig;
use crate::selector::ProxySelector;
use crate::venue::VenueDiagnostics;

use axum::{
    routing::{get, post},
    Router,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: ServerConfig,
    pub selector: Arc<ProxySelector>,
    pub venue: Arc<VenueDiagnostics>,
}

/// Web server for egresswatch.
pub struct Server {
    state: AppState,
}

impl Server {
    pub fn new(
        config: ServerConfig,
        selector: Arc<ProxySelector>,
        venue: Arc<VenueDiagnostics>,
    ) -> Self {
        Self {
            state: AppState {
                config,
                selector,
                venue,
            },
        }
    }

    /// Build the router with all routes.
    fn routes(&self) -> Router {
        let cors = CorsLayer::new().allow_origin(Any).allow_methods(Any);

        Router::new()
            .route("/healthz", get(handlers::handle_healthz))
            // Egress profiles
            .route("/api/egress/health", get(handlers::handle_health))
            .route("/api/egress/selection", get(handlers::handle_selection))
            .route("/api/egress/profiles", get(handlers::handle_profiles))
            .route("/api/egress/profiles/{name}/history", get(handlers::handle_profile_history))
            .route("/api/egress/profiles/{name}/check", post(handlers::handle_check_profile))
            // Venue
            .route("/api/venue/diagnostics", get(handlers::handle_venue_diagnostics))
            .layer(cors)
            .layer(TraceLayer::new_for_http())
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
