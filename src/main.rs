//! egresswatch - Egress profile health checks and selection
//!
//! Probes a direct route and a set of HTTP/SOCKS proxies against a venue
//! endpoint, keeps per-profile health with cooldowns, and serves the best
//! usable profile over HTTP.

mod config;
mod probe;
mod profile;
mod selector;
mod venue;
mod web;

use config::ServerConfig;
use probe::NetworkProber;
use profile::ProfileRegistry;
use selector::{ProxySelector, RefreshManager, SelectorSettings};
use venue::VenueDiagnostics;
use web::Server;

use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_subscriber::EnvFilter::from_default_env()
            .add_directive("egresswatch=info".parse()?))
        .init();

    // Load configuration
    let cfg = ServerConfig::load()?;
    tracing::info!("Starting egresswatch on port {}...", cfg.http_port);
    tracing::info!(
        "Probe target {} (timeout {:?}, cooldown {:?})",
        cfg.target_url,
        cfg.probe_timeout,
        cfg.cooldown
    );

    let registry = ProfileRegistry::from_config(&cfg)?;
    for profile in registry.all() {
        tracing::info!(
            "Profile {} ({}){}{}",
            profile.name,
            profile.kind,
            profile.masked_descriptor().map(|d| format!(" via {}", d)).unwrap_or_default(),
            if profile.enabled { "" } else { " [disabled]" }
        );
    }

    let settings = SelectorSettings::from_config(&cfg)?;
    let prober = Arc::new(NetworkProber::new());
    let selector = Arc::new(ProxySelector::new(registry, prober, settings));
    let venue = Arc::new(VenueDiagnostics::new(selector.clone(), &cfg.venue)?);

    // Optional background refresh
    let refresh = cfg.refresh_interval.map(|interval| {
        let manager = RefreshManager::new(selector.clone(), interval);
        manager.start();
        manager
    });

    // Start web server
    let server = Server::new(cfg, selector, venue);
    let served = server.start().await;

    if let Some(manager) = refresh {
        manager.stop().await;
    }

    served
}
