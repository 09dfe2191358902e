use std::sync::Arc;

use tower_http::cors::CorsLayer;

use blipmap::config::{Config, StaticConfig};
use blipmap::overlay::catalog::MarkerCatalog;
use blipmap::overlay::surface::RecordingSurface;
use blipmap::overlay::{Overlay, OverlaySettings};
use blipmap::session::{Session, SessionOptions};
use blipmap::synchronizer::{LogNotifier, Synchronizer};
use blipmap::transport::{HttpSnapshotSource, WsFeedConnector};
use blipmap::{api, metrics};

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt::init();
    metrics::register_metrics();

    let config = Config::load();
    let static_config =
        StaticConfig::from_file(&config.static_config).expect("Failed to load static config");
    let catalog = MarkerCatalog::from_file(&config.catalog).expect("Failed to load marker catalog");
    tracing::info!(
        servers = static_config.servers.len(),
        marker_types = catalog.len(),
        "configuration loaded"
    );

    let initial_server = config
        .initial_server
        .clone()
        .or_else(|| static_config.servers.keys().next().cloned());

    let overlay = Overlay::new(
        RecordingSurface::new(),
        Arc::new(catalog),
        OverlaySettings {
            group_players: static_config.group_players,
            ..OverlaySettings::default()
        },
    );
    let sync = Synchronizer::new(static_config.servers, Arc::new(LogNotifier));
    let (session, handle) = Session::new(
        overlay,
        sync,
        Arc::new(HttpSnapshotSource::default()),
        Arc::new(WsFeedConnector),
        SessionOptions {
            refresh_interval: config.refresh_interval,
        },
    );
    tokio::spawn(session.run());

    if let Some(name) = initial_server {
        if let Err(e) = handle.switch_server(&name).await {
            tracing::error!("Failed to select initial server: {e}");
        }
    }

    let app = api::router(handle).layer(CorsLayer::permissive());

    let addr = format!("0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .unwrap_or_else(|e| panic!("Failed to bind to {addr}: {e}"));

    tracing::info!("blipmap listening on {addr}");
    axum::serve(listener, app)
        .await
        .expect("Failed to start server");
}
