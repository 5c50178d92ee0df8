//! ==============================================================================
//! server.rs - http surface
//! ==============================================================================
//!
//! routes:
//!     GET /         302 -> /sensors
//!     GET /sensors  json array of SensorSnapshot, one per configured sensor
//!
//! every request builds a fresh snapshot from the cache; nothing here waits
//! on bluetooth.
//!
//! ==============================================================================

use crate::collector::Collector;

use anyhow::{Context, Result};
use axum::{
    extract::State,
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use chrono::Utc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;

pub fn router(collector: Collector) -> Router {
    Router::new()
        .route("/", get(redirect_handler))
        .route("/sensors", get(sensors_handler))
        .layer(CorsLayer::permissive())
        .with_state(collector)
}

/// bind the listen address up front so a taken port fails startup
pub async fn bind(listen_addr: &str) -> Result<TcpListener> {
    TcpListener::bind(listen_addr)
        .await
        .with_context(|| format!("Error binding {}", listen_addr))
}

/// serve on an already bound listener until `cancel` fires
pub async fn run_server(
    listener: TcpListener,
    collector: Collector,
    cancel: CancellationToken,
) -> Result<()> {
    tracing::info!("Listen on {}...", listener.local_addr()?);

    axum::serve(listener, router(collector))
        .with_graceful_shutdown(cancel.cancelled_owned())
        .await?;
    Ok(())
}

async fn redirect_handler() -> impl IntoResponse {
    (StatusCode::FOUND, [(header::LOCATION, "/sensors")])
}

/// current snapshot of every sensor as json
async fn sensors_handler(State(collector): State<Collector>) -> Response {
    let data = collector.snapshot(Utc::now()).await;

    match serde_json::to_vec(&data) {
        Ok(body) => ([(header::CONTENT_TYPE, "application/json")], body).into_response(),
        Err(e) => {
            tracing::error!("Failed to marshal data to JSON: {}", e);
            (StatusCode::INTERNAL_SERVER_ERROR, "Failed to marshal data to JSON").into_response()
        }
    }
}
