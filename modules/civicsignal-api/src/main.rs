use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{
    extract::DefaultBodyLimit,
    http::{header, HeaderValue, Method},
    routing::{get, patch, post},
    Router,
};
use clap::Parser;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::set_header::SetResponseHeaderLayer;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use civicsignal_common::config::load_config_or_default;
use civicsignal_common::{Config, ServerConfig};
use civicsignal_engine::{ClusteringEngine, EngineConfig};
use civicsignal_store::{MemoryStore, PgStore, SpatialStore};

mod rest;

/// Reports may carry an inline base64 photo.
const MAX_BODY_BYTES: usize = 10 * 1024 * 1024;

#[derive(Parser)]
#[command(name = "civicsignal-api", about = "Civic incident report clustering API")]
struct Cli {
    /// Path to config TOML file
    #[arg(long, default_value = "./config/civicsignal.toml")]
    config: PathBuf,
}

pub struct AppState {
    pub engine: ClusteringEngine,
}

pub fn router(state: Arc<AppState>, cors: CorsLayer) -> Router {
    Router::new()
        // Health check
        .route("/", get(|| async { "ok" }))
        // Triage API
        .route("/api/reports", post(rest::api_submit_report))
        .route("/api/clusters", get(rest::api_clusters))
        .route("/api/clusters/{id}", patch(rest::api_update_cluster))
        .with_state(state)
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        .layer(cors)
        // Operator views must always be fresh
        .layer(SetResponseHeaderLayer::overriding(
            header::CACHE_CONTROL,
            HeaderValue::from_static("no-store"),
        ))
        // Logging layer: method + path only (no query params, no IP)
        .layer(
            tower_http::trace::TraceLayer::new_for_http().make_span_with(
                |request: &axum::http::Request<_>| {
                    tracing::info_span!(
                        "http_request",
                        method = %request.method(),
                        path = %request.uri().path(),
                    )
                },
            ),
        )
}

/// CORS from `[server].allowed_origins`. An empty list allows any origin.
fn cors_layer(server: &ServerConfig) -> Result<CorsLayer> {
    let origin = if server.allowed_origins.is_empty() {
        AllowOrigin::from(Any)
    } else {
        let origins = server
            .allowed_origins
            .iter()
            .map(|o| {
                HeaderValue::from_str(o).with_context(|| format!("Invalid allowed origin: {o}"))
            })
            .collect::<Result<Vec<_>>>()?;
        AllowOrigin::list(origins)
    };
    Ok(CorsLayer::new()
        .allow_origin(origin)
        .allow_methods([Method::GET, Method::POST, Method::PATCH])
        .allow_headers([header::CONTENT_TYPE]))
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;

    let filter = EnvFilter::from_default_env().add_directive("civicsignal=info".parse()?);
    if config.log_json {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    let cli = Cli::parse();
    let file_config = load_config_or_default(&cli.config)?;
    info!(config = %cli.config.display(), "Config loaded");

    let store: Arc<dyn SpatialStore> = match &config.database_url {
        Some(url) => {
            let store = PgStore::connect(url, file_config.clustering.store_timeout())
                .await
                .context("Failed to connect to Postgres")?;
            store.migrate().await.context("Failed to run migrations")?;
            info!("Connected to Postgres, migrations complete");
            Arc::new(store)
        }
        None => {
            warn!("DATABASE_URL not set, using in-memory store (data is lost on restart)");
            Arc::new(MemoryStore::new())
        }
    };

    let engine = ClusteringEngine::new(store, EngineConfig::from(&file_config));
    let state = Arc::new(AppState { engine });
    let app = router(state, cors_layer(&file_config.server)?);

    let addr = format!("{}:{}", config.web_host, config.web_port);
    info!("CivicSignal API starting on {addr}");

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
