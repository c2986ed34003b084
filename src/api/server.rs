//! Router and request handlers.
//!
//! Path captures in axum are whole segments, so `/api/{id}.{ext}` and
//! friends arrive as one `{file}` segment and are split here; the URL
//! surface stays exactly:
//!
//! - `GET /api/{id}.{ext}`: the image, cache-first for scheduled configs
//! - `GET /api/{id}.{ext}.crc32`: current checksum, 8 hex chars
//! - `GET /api/{id}/fresh.{ext}`: regenerate, bypassing the cache
//! - `GET /api/{id}/crc32-history`: ledger entries plus stats
//! - `GET /api/{id}/meta`: cached metadata
//! - `DELETE /api/{id}/cache`: drop the cached artifact
//! - `GET /api/status`: scheduled configs and their next runs
//! - `GET /health`

use std::sync::Arc;

use axum::Json;
use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use serde_json::json;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::dispatch::{CacheStatus, Dispatcher, ImageResponse};
use crate::scheduler::Scheduler;

use super::error::ApiError;

/// Shared state for HTTP handlers.
#[derive(Debug, Clone)]
pub struct AppState {
    /// Read-side operations.
    pub dispatcher: Arc<Dispatcher>,
    /// Timer set, for the status endpoint.
    pub scheduler: Arc<Scheduler>,
}

/// Build the router with all routes and layers.
pub fn create_router(state: AppState) -> Router {
    let cors = CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any);

    Router::new()
        .route("/health", get(health))
        .route("/api/status", get(scheduler_status))
        .route("/api/{file}", get(get_file))
        .route(
            "/api/{id}/{action}",
            get(get_action).delete(delete_action),
        )
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(cors)
}

/// Bind and serve until shutdown; timers are stopped on the way out.
///
/// # Errors
///
/// Returns an error when the listener cannot bind or the server fails.
pub async fn run_server(state: AppState, bind_addr: &str, port: u16) -> anyhow::Result<()> {
    let scheduler = Arc::clone(&state.scheduler);
    let app = create_router(state);

    let addr: std::net::SocketAddr = format!("{bind_addr}:{port}").parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(addr = %addr, "HTTP server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    scheduler.stop_all();
    tracing::info!("HTTP server stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };
    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => tracing::info!("Received Ctrl-C, shutting down"),
        () = terminate => tracing::info!("Received SIGTERM, shutting down"),
    }
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({ "status": "healthy" }))
}

async fn scheduler_status(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({ "scheduled": state.scheduler.status() }))
}

/// `/api/{file}`: either `{id}.{ext}` or `{id}.{ext}.crc32`.
async fn get_file(
    State(state): State<AppState>,
    Path(file): Path<String>,
) -> Result<Response, ApiError> {
    if let Some(stem) = file.strip_suffix(".crc32") {
        let (id, ext) = split_name(stem)?;
        let crc = state.dispatcher.get_checksum(id, ext).await?;
        return Ok(([(header::CONTENT_TYPE, "text/plain")], crc).into_response());
    }

    let (id, ext) = split_name(&file)?;
    let image = state.dispatcher.get_image(id, ext).await?;
    Ok(image_response(&image))
}

/// `/api/{id}/{action}`: `fresh.{ext}`, `crc32-history`, or `meta`.
async fn get_action(
    State(state): State<AppState>,
    Path((id, action)): Path<(String, String)>,
) -> Result<Response, ApiError> {
    if let Some(ext) = action.strip_prefix("fresh.") {
        let image = state.dispatcher.get_fresh_image(&id, ext).await?;
        return Ok(image_response(&image));
    }

    match action.as_str() {
        "crc32-history" => {
            let report = state.dispatcher.get_history(&id).await?.ok_or_else(|| {
                ApiError::not_found("HistoryNotFound", format!("No history for config {id}"))
            })?;
            Ok(Json(report).into_response())
        }
        "meta" => {
            let meta = state.dispatcher.get_meta(&id).await?.ok_or_else(|| {
                ApiError::not_found("ArtifactNotFound", format!("No cached image for config {id}"))
            })?;
            Ok(Json(meta).into_response())
        }
        other => Err(ApiError::bad_request(format!("Unknown operation '{other}'"))),
    }
}

/// `DELETE /api/{id}/cache`.
async fn delete_action(
    State(state): State<AppState>,
    Path((id, action)): Path<(String, String)>,
) -> Result<Response, ApiError> {
    if action != "cache" {
        return Err(ApiError::bad_request(format!("Unknown operation '{action}'")));
    }
    state.dispatcher.delete_cache(&id).await?;
    Ok((StatusCode::NO_CONTENT, ()).into_response())
}

/// Split `name.ext`; both halves must be non-empty.
fn split_name(file: &str) -> Result<(&str, &str), ApiError> {
    match file.rsplit_once('.') {
        Some((id, ext)) if !id.is_empty() && !ext.is_empty() => Ok((id, ext)),
        _ => Err(ApiError::bad_request(format!(
            "Expected '<id>.<ext>', got '{file}'"
        ))),
    }
}

/// Image bytes with the cache headers.
fn image_response(image: &ImageResponse) -> Response {
    let mut builder = Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, &image.content_type)
        .header(header::CONTENT_LENGTH, image.bytes.len())
        .header("X-Cache", image.cache_status.as_str())
        .header("X-CRC32", &image.crc32);
    if image.cache_status == CacheStatus::Hit {
        if let Some(generated_at) = image.generated_at {
            builder = builder.header("X-Generated-At", generated_at.to_rfc3339());
        }
    }
    builder
        .body(Body::from(image.bytes.as_ref().clone()))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}
