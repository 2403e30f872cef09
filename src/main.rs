//! Scan gateway HTTP entrypoint.
//!
//! Launches the Axum server that fronts the paid scan API:
//!
//! - `POST /v1/scan/content`, `POST /v1/scan/output` — paid scans
//! - `POST /v1/register`, account, deposit, usage and balance endpoints
//! - `POST /webhooks/stripe` — deposit funding events
//! - `GET /health[/live|/ready]` — per-dependency health
//!
//! Configuration is environment-only (`.env` honored); startup
//! misconfiguration exits non-zero. A background task retries pending
//! settlements until shutdown.

use axum::Router;
use axum::http::Method;
use dotenvy::dotenv;
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::cors;
use tower_http::trace::TraceLayer;

use scangate::config::Config;
use scangate::handlers;
use scangate::request_id::RequestIdLayer;
use scangate::services::Services;
use scangate::shutdown::Shutdown;
use scangate::store::PgStore;
use scangate::telemetry::Telemetry;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv().ok();

    let config = Config::load();

    let _telemetry = Telemetry::register(&config);

    let store = PgStore::connect(&config.database_url, config.db_max_connections)
        .await
        .unwrap_or_else(|err| {
            tracing::error!(error = %err, "failed to connect to the database");
            std::process::exit(1);
        });

    let (services, retrier) = Services::build(&config, store).unwrap_or_else(|err| {
        tracing::error!(error = %err, "invalid facilitator configuration");
        std::process::exit(1);
    });
    let services = Arc::new(services);

    let shutdown = Shutdown::try_new()?;
    shutdown.spawn_worker(retrier.run(shutdown.token()));

    let http_endpoints = Router::new()
        .merge(handlers::routes())
        .with_state(services)
        .layer(RequestIdLayer)
        .layer(TraceLayer::new_for_http())
        .layer(
            cors::CorsLayer::new()
                .allow_origin(cors::Any)
                .allow_methods([Method::GET, Method::POST, Method::PUT, Method::DELETE])
                .allow_headers(cors::Any),
        );

    let addr = SocketAddr::new(config.host, config.port);
    tracing::info!("Starting server at http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .unwrap_or_else(|e| {
            tracing::error!("Failed to bind to {}: {}", addr, e);
            std::process::exit(1);
        });

    let axum_cancellation_token = shutdown.token();
    let axum_graceful_shutdown = async move { axum_cancellation_token.cancelled().await };
    axum::serve(listener, http_endpoints)
        .with_graceful_shutdown(axum_graceful_shutdown)
        .await?;

    // Let an in-flight settle sweep finish before the process exits.
    shutdown.drain(std::time::Duration::from_secs(30)).await;

    Ok(())
}
