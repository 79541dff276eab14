use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

mod api;
mod config;
mod context;
mod coordination;
mod errors;
mod hls_writer;
mod ingest;
mod lifecycle;
mod media;
mod reconnect;
mod registry;
mod rtsp_source;
mod utils;
mod watchdog;
mod watcher;

#[cfg(test)]
mod testing;

use config::Config;
use coordination::{DrainCoordinator, StreamStates};
use hls_writer::FfmpegHlsWriterFactory;
use ingest::IngestDeps;
use reconnect::ReconnectPolicy;
use registry::StreamRegistry;
use rtsp_source::RetinaSource;
use watchdog::Watchdog;

/// Extra time granted to tasks after `stop_all` before giving up on the drain.
const DRAIN_GRACE: Duration = Duration::from_secs(2);

#[derive(Parser, Debug)]
#[command(name = "hls-ingest-server", about = "Ingest RTSP cameras into HLS segments")]
pub struct Args {
    /// Path to the main configuration file (TOML, JSON or YAML)
    #[arg(short, long, default_value = "config.toml")]
    pub config: String,
}

#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<StreamRegistry>,
    pub states: Arc<StreamStates>,
    pub coordinator: Arc<DrainCoordinator>,
    pub watchdog: Arc<Watchdog>,
    pub streams_directory: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("hls_ingest_server=debug,info")),
        )
        .init();

    let args = Args::parse();
    let config = Config::load(&args.config).unwrap_or_else(|e| {
        warn!("Could not load {} ({}), using default configuration", args.config, e);
        let mut config = Config::default();
        match Config::load_streams_from_directory(config.streams_directory()) {
            Ok(streams) => config.streams = streams,
            Err(e) => error!("Failed to load stream configurations: {}", e),
        }
        config
    });

    info!(
        "Starting HLS ingest server on {}:{} ({} stream(s) configured)",
        config.server.host,
        config.server.port,
        config.streams.len()
    );

    let coordinator = Arc::new(DrainCoordinator::new());
    let states = Arc::new(StreamStates::new());
    let deps = IngestDeps {
        source: Arc::new(RetinaSource::new()),
        writers: Arc::new(FfmpegHlsWriterFactory::new(&config.ingest)),
        shutdown: coordinator.clone(),
        states: states.clone(),
    };
    let registry = Arc::new(StreamRegistry::new(
        config.ingest.clone(),
        ReconnectPolicy::from(&config.reconnect),
        deps,
    ));
    let watchdog = Arc::new(Watchdog::new(registry.clone(), config.watchdog.clone()));

    let app_state = AppState {
        registry: registry.clone(),
        states: states.clone(),
        coordinator: coordinator.clone(),
        watchdog: watchdog.clone(),
        streams_directory: config.streams_directory().to_string(),
    };

    let mut names: Vec<&String> = config.streams.keys().collect();
    names.sort();
    for name in names {
        let stream_config = &config.streams[name];
        if !stream_config.is_enabled() {
            info!("Stream '{}' is disabled, not starting", name);
            states.set_disabled(name, true);
            continue;
        }
        if let Err(e) = registry.start(name, stream_config.clone()).await {
            error!("Failed to start stream '{}': {}", name, e);
        }
    }

    tokio::spawn(watchdog.clone().run(coordinator.shutdown_token()));

    if let Err(e) = watcher::start_stream_config_watcher(app_state.clone()).await {
        error!("Failed to start streams directory watcher: {}", e);
    }

    let cors_layer = if let Some(origin) = &config.server.cors_allow_origin {
        if origin == "*" {
            tower_http::cors::CorsLayer::permissive()
        } else {
            match origin.parse::<axum::http::HeaderValue>() {
                Ok(origin_header) => tower_http::cors::CorsLayer::new()
                    .allow_origin(origin_header)
                    .allow_methods(tower_http::cors::Any)
                    .allow_headers(tower_http::cors::Any),
                Err(_) => {
                    warn!("Invalid CORS origin '{}', falling back to permissive", origin);
                    tower_http::cors::CorsLayer::permissive()
                }
            }
        }
    } else {
        tower_http::cors::CorsLayer::permissive()
    };

    let app = api::router(app_state).layer(cors_layer);

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("HTTP server listening on http://{}", addr);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Shutting down...");
    coordinator.initiate_shutdown();
    registry.stop_all().await;
    if !coordinator.wait_for_drain(DRAIN_GRACE).await {
        warn!("Some components did not report stopped: {:?}", coordinator.running_components());
    }
    info!("Shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for Ctrl-C: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Received Ctrl-C");
}
