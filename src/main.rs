use std::sync::Arc;

use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use gtfs_live_overlay::config::OverlayConfig;
use gtfs_live_overlay::engine::{self, run_engine};
use gtfs_live_overlay::models::{EntityKind, LngLat};
use gtfs_live_overlay::overlay::Overlay;
use gtfs_live_overlay::poller::{poll_vehicles, sync_static_geometry};
use gtfs_live_overlay::render::{SceneRenderer, Viewport};
use gtfs_live_overlay::server::{build_server, AppState};
use gtfs_live_overlay::session::MapSession;
use gtfs_live_overlay::source::{
    ArchiveSnapshotSource, GtfsRtSource, HttpSnapshotSource, SnapshotSource, SourceRouter, ValidationClient,
};

// ============================================================================
// Sources
// ============================================================================

/// Blocking HTTP clients must be built before the runtime starts.
fn build_sources(config: &OverlayConfig) -> Result<(Arc<dyn SnapshotSource>, Arc<ValidationClient>), reqwest::Error> {
    let timeout = config.request_timeout();
    let backend: Arc<dyn SnapshotSource> = Arc::new(HttpSnapshotSource::new(config.api_base_url.clone(), timeout)?);

    let vehicles: Arc<dyn SnapshotSource> = match &config.gtfs_rt {
        Some(feeds) => {
            info!(url = %feeds.vehicle_positions_url, "main.vehicles_from_gtfs_rt");
            Arc::new(GtfsRtSource::new(feeds.clone(), timeout)?)
        }
        None => backend.clone(),
    };

    let geometry: Arc<dyn SnapshotSource> = match &config.static_archive_path {
        Some(path) => {
            info!(path = %path.display(), "main.geometry_from_archive");
            Arc::new(ArchiveSnapshotSource::new(path.clone()))
        }
        None => backend,
    };

    let router = SourceRouter::new()
        .with(EntityKind::Vehicle, vehicles)
        .with(EntityKind::Route, geometry.clone())
        .with(EntityKind::Stop, geometry);

    let validation = Arc::new(ValidationClient::new(config.api_base_url.clone(), timeout)?);
    Ok((Arc::new(router), validation))
}

fn build_overlay(config: &OverlayConfig) -> Overlay<SceneRenderer> {
    let [lng, lat] = config.initial_viewport.center;
    let session = MapSession::new(
        SceneRenderer::new(),
        config.map_access_token.clone(),
        Viewport {
            center: LngLat::new(lng, lat),
            zoom: config.initial_viewport.zoom,
        },
    );
    let mut overlay = Overlay::new(session, config);

    // A failed session stays Errored and discards every snapshot; the API
    // still reports its status.
    if let Err(e) = overlay.initialize() {
        error!(error = %e, "main.session_init_failed");
    } else if let Err(e) = overlay.on_style_loaded() {
        error!(error = %e, "main.style_load_failed");
    }
    overlay
}

// ============================================================================
// Server Setup
// ============================================================================

async fn run(
    config: OverlayConfig,
    overlay: Overlay<SceneRenderer>,
    source: Arc<dyn SnapshotSource>,
    validation: Arc<ValidationClient>,
) -> std::io::Result<()> {
    let (handle, rx) = engine::channel();
    let engine_task = tokio::spawn(run_engine(overlay, rx));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (generation_tx, generation_rx) = watch::channel(0u64);

    let vehicle_task = tokio::spawn(poll_vehicles(
        source.clone(),
        handle.clone(),
        config.vehicle_poll_interval(),
        shutdown_rx.clone(),
    ));
    let static_task = tokio::spawn(sync_static_geometry(
        source,
        handle.clone(),
        generation_rx,
        shutdown_rx,
    ));

    let state = AppState {
        overlay: handle.clone(),
        validation,
        generation: Arc::new(generation_tx),
    };

    println!("\n╔════════════════════════════════════════════════════════════╗");
    println!("║   🚀 GTFS Live Overlay Server                              ║");
    println!("╚════════════════════════════════════════════════════════════╝\n");
    println!("🌐 Server running on: http://{}", config.bind_address);
    println!("📡 Backend API: {}", config.api_base_url);
    println!("🔄 Vehicle refresh: every {} ms\n", config.vehicle_poll_interval_ms);

    println!("📍 Available Routes:");
    println!("┌─────────────────────────────────────────────────────────────┐");
    println!("│ Overlay:                                                    │");
    println!("│   GET  /api/overlay/scene          - Rendered scene         │");
    println!("│   GET  /api/overlay/status         - Session & layer status │");
    println!("│   POST /api/overlay/layers/:kind/visibility - Toggle layer  │");
    println!("│   POST /api/overlay/viewport       - Move the map           │");
    println!("│   POST /api/overlay/events         - Click / hover          │");
    println!("│   POST /api/overlay/popup/close    - Close the popup        │");
    println!("├─────────────────────────────────────────────────────────────┤");
    println!("│ Feed:                                                       │");
    println!("│   POST /api/feed/validate?filename= - Validate a GTFS zip   │");
    println!("│   GET  /api/feed/report?format=     - Export the report     │");
    println!("│   GET  /health                      - Health check          │");
    println!("└─────────────────────────────────────────────────────────────┘\n");

    let server = build_server(state, &config.bind_address)?;
    let server_handle = server.handle();
    let mut server_task = actix_web::rt::spawn(server);

    let served = tokio::select! {
        joined = &mut server_task => match joined {
            Ok(result) => result,
            Err(e) => Err(std::io::Error::other(e.to_string())),
        },
        _ = tokio::signal::ctrl_c() => {
            info!("main.shutdown_requested");
            server_handle.stop(true).await;
            Ok(())
        }
    };

    let _ = shutdown_tx.send(true);
    if let Err(e) = handle.shutdown().await {
        warn!(error = %e, "main.engine_already_stopped");
    }
    let _ = vehicle_task.await;
    let _ = static_task.await;
    let _ = engine_task.await;
    info!("main.stopped");
    served
}

// ============================================================================
// Main Entry Point
// ============================================================================

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    println!("\n╔════════════════════════════════════════════════════════════╗");
    println!("║                                                            ║");
    println!("║    🚀 GTFS Live Overlay                                    ║");
    println!("║       vehicles, routes and stops on a live map             ║");
    println!("║                                                            ║");
    println!("║    Version: {:<47}║", env!("CARGO_PKG_VERSION"));
    println!("║                                                            ║");
    println!("╚════════════════════════════════════════════════════════════╝\n");

    let config = OverlayConfig::load_from_env();

    let (source, validation) = match build_sources(&config) {
        Ok(built) => built,
        Err(e) => {
            eprintln!("\n╔════════════════════════════════════════════════════════════╗");
            eprintln!("║  ❌ INITIALIZATION FAILED                                  ║");
            eprintln!("╚════════════════════════════════════════════════════════════╝");
            eprintln!("\n❌ Failed to build HTTP clients: {}", e);
            std::process::exit(1);
        }
    };

    let overlay = build_overlay(&config);

    // The main clones outlive the async tasks so the blocking clients are
    // never dropped on an async thread.
    let system = actix_web::rt::System::new();
    let result = system.block_on(run(config, overlay, source.clone(), validation.clone()));

    // Dropping the runtime would wait for any fetch abandoned at shutdown to
    // hit its request timeout; everything else has already stopped.
    match result {
        Ok(()) => std::process::exit(0),
        Err(e) => {
            eprintln!("\n❌ Server error: {}", e);
            std::process::exit(1);
        }
    }
}
