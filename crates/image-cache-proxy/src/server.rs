//! HTTP server for the image cache
//!
//! Provides /health, /image and the /admin maintenance endpoints.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{Query, State},
    http::{header, HeaderName, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::{delete, get, post},
    Router,
};
use chrono::{DateTime, Utc};
use remote_image_cache::{decode, ImageLoader, LoadError, TrimReport};
use serde::Serialize;
use tower_http::cors::CorsLayer;
use tracing::{info, warn};
use url::Url;

use crate::types::{CacheStatus, ClearedResponse, HealthResponse, ImageQuery};

const X_CACHE: HeaderName = HeaderName::from_static("x-cache");

/// Shared state for the HTTP server
pub struct ServerState {
    pub loader: ImageLoader,
    pub background_window: Duration,
    pub started_at: DateTime<Utc>,
}

impl ServerState {
    pub fn new(loader: ImageLoader, background_window: Duration) -> Self {
        Self {
            loader,
            background_window,
            started_at: Utc::now(),
        }
    }
}

pub type SharedState = Arc<ServerState>;

/// Error response
#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

fn error_response(status: StatusCode, message: impl Into<String>) -> Response {
    (
        status,
        Json(ErrorResponse {
            error: message.into(),
        }),
    )
        .into_response()
}

/// Create the HTTP router
pub fn create_router(state: SharedState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/image", get(get_image).delete(delete_image))
        .route("/admin/memory-pressure", post(memory_pressure))
        .route("/admin/trim", post(trim))
        .route("/admin/disk", delete(clear_disk))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Serve until `shutdown` resolves, then let in-flight requests finish
pub async fn start_server(
    state: SharedState,
    port: u16,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> std::io::Result<()> {
    let router = create_router(state);
    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], port));
    info!("Starting HTTP server on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown)
        .await
}

/// Health check endpoint
async fn health(State(state): State<SharedState>) -> Json<HealthResponse> {
    let cache = state.loader.cache();
    let uptime_secs = (Utc::now() - state.started_at).num_seconds().max(0) as u64;

    Json(HealthResponse {
        status: "ok".to_string(),
        uptime_secs,
        cache: CacheStatus {
            memory_entries: cache.memory().len(),
            disk_bytes: cache.disk().total_size().await,
            stats: state.loader.stats(),
        },
    })
}

/// Only absolute http(s) URLs are fetched
fn parse_image_url(raw: &str) -> Option<Url> {
    Url::parse(raw)
        .ok()
        .filter(|url| matches!(url.scheme(), "http" | "https"))
}

/// Get an image through the cache
async fn get_image(
    State(state): State<SharedState>,
    Query(query): Query<ImageQuery>,
) -> Response {
    let Some(url) = parse_image_url(&query.url) else {
        return error_response(StatusCode::BAD_REQUEST, "Invalid image URL");
    };

    match state.loader.load_with_source(url.as_str()).await {
        Ok((data, source)) => {
            let content_type = decode::probe(&data)
                .map(|info| info.mime_type())
                .unwrap_or("application/octet-stream");
            let cache_header = if source.is_cache_hit() { "HIT" } else { "MISS" };

            (
                StatusCode::OK,
                [
                    (header::CONTENT_TYPE, content_type),
                    (header::CACHE_CONTROL, "public, max-age=86400"),
                    (X_CACHE, cache_header),
                ],
                data,
            )
                .into_response()
        }
        Err(LoadError::Status(404)) => {
            error_response(StatusCode::NOT_FOUND, "Image not found upstream")
        }
        Err(e) => {
            warn!(url = %url, error = %e, "Failed to load image");
            error_response(StatusCode::BAD_GATEWAY, e.to_string())
        }
    }
}

/// Drop an image from both tiers
async fn delete_image(
    State(state): State<SharedState>,
    Query(query): Query<ImageQuery>,
) -> Response {
    let Some(url) = parse_image_url(&query.url) else {
        return error_response(StatusCode::BAD_REQUEST, "Invalid image URL");
    };

    state.loader.invalidate(url.as_str()).await;
    StatusCode::NO_CONTENT.into_response()
}

async fn memory_pressure(State(state): State<SharedState>) -> Json<ClearedResponse> {
    Json(ClearedResponse {
        removed: state.loader.on_memory_pressure(),
    })
}

/// Expire and trim the disk tier within the configured window
async fn trim(State(state): State<SharedState>) -> Json<TrimReport> {
    Json(state.loader.on_enter_background(state.background_window).await)
}

async fn clear_disk(State(state): State<SharedState>) -> Json<ClearedResponse> {
    let removed = state.loader.clear_disk().await;
    info!(removed, "Cleared disk cache");
    Json(ClearedResponse { removed })
}
