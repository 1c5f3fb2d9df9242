use anyhow::Result;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    middleware,
    response::Json,
    routing::{delete, get},
    Router,
};
use serde_json::json;
use std::{net::SocketAddr, sync::Arc};
use tokio::{net::TcpListener, signal};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use rate_guard::{
    config::GuardConfig, guard::admission_guard, limiter::RateLimiter, metrics::Metrics,
    AdmissionGuard,
};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "rate_guard=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting rate guard");

    let config_path = std::env::var("CONFIG_PATH").ok();
    let config = GuardConfig::load(config_path.as_deref())?;

    // The one limiter for this process; every request shares it through the guard
    let limiter = Arc::new(RateLimiter::from_config(&config).await?);
    let metrics = Arc::new(Metrics::new()?);
    let guard = AdmissionGuard::new(limiter, metrics);

    let addr = config.listen_addr.parse::<SocketAddr>()?;
    let listener = TcpListener::bind(addr).await?;
    info!("HTTP server listening on {}", addr);

    axum::serve(
        listener,
        app(guard).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    info!("Service stopped");
    Ok(())
}

fn app(guard: AdmissionGuard) -> Router {
    let guarded = Router::new()
        .route("/test", get(hello))
        .route_layer(middleware::from_fn_with_state(guard.clone(), admission_guard));

    Router::new()
        .route("/healthcheck", get(health_check))
        .route("/metrics", get(metrics_handler))
        .route("/admin/limits/:identity", delete(reset_identity))
        .merge(guarded)
        .with_state(guard)
}

async fn shutdown_signal() {
    if let Err(e) = signal::ctrl_c().await {
        warn!("Failed to listen for Ctrl+C: {}", e);
        return;
    }
    info!("Received Ctrl+C, shutting down");
}

async fn hello() -> Json<serde_json::Value> {
    info!("request received");
    Json(json!({ "message": "Hello!" }))
}

async fn health_check(State(guard): State<AdmissionGuard>) -> Result<Json<serde_json::Value>, StatusCode> {
    match guard.limiter().health_check().await {
        Ok(()) => Ok(Json(json!({
            "status": "healthy",
            "timestamp": chrono::Utc::now().to_rfc3339()
        }))),
        Err(e) => {
            warn!("Health check failed: {}", e);
            Err(StatusCode::SERVICE_UNAVAILABLE)
        }
    }
}

async fn metrics_handler(State(guard): State<AdmissionGuard>) -> Result<String, StatusCode> {
    guard
        .metrics()
        .render()
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)
}

async fn reset_identity(
    State(guard): State<AdmissionGuard>,
    Path(identity): Path<String>,
) -> StatusCode {
    match guard.limiter().reset(&identity).await {
        Ok(()) => StatusCode::NO_CONTENT,
        Err(e) => {
            warn!("Reset failed for '{}': {}", identity, e);
            StatusCode::SERVICE_UNAVAILABLE
        }
    }
}
