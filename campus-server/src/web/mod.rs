//! HTTP JSON API.
//!
//! Every route lives under `/api`; uploaded files are served read-only from
//! `/uploads`. Handlers return `Result<_, ApiError>` and render failures as
//! `{"error": "..."}`.

use std::sync::{Arc, OnceLock};
use std::time::Instant;

use axum::extract::State;
use axum::http::{header, HeaderValue, Method};
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::services::ServeDir;

use crate::server::SharedState;

mod accounts;
mod ai;
mod messaging;
mod notifications;
mod posts;
mod uploads;

/// Room for multipart framing on top of the largest accepted upload.
const BODY_LIMIT_SLACK: usize = 1024 * 1024;

static START_TIME: OnceLock<Instant> = OnceLock::new();

pub fn router(state: Arc<SharedState>) -> Router {
    START_TIME.get_or_init(Instant::now);

    let body_limit = state.config.max_upload_bytes + BODY_LIMIT_SLACK;
    let uploads = ServeDir::new(state.uploads.root());
    let cors = cors_layer(&state.config.cors_origins);

    Router::new()
        .route("/api/health", get(api_health))
        .merge(accounts::routes())
        .merge(posts::routes())
        .merge(messaging::routes())
        .merge(notifications::routes())
        .merge(uploads::routes())
        .merge(ai::routes())
        .nest_service("/uploads", uploads)
        .layer(axum::extract::DefaultBodyLimit::max(body_limit))
        .layer(cors)
        .with_state(state)
        .layer(axum::middleware::from_fn(security_headers))
}

fn cors_layer(origins: &[String]) -> CorsLayer {
    let methods = [Method::GET, Method::POST, Method::PATCH, Method::DELETE, Method::OPTIONS];
    let parsed: Vec<HeaderValue> = origins
        .iter()
        .map(|o| o.trim())
        .filter(|o| !o.is_empty())
        .filter_map(|o| o.parse().ok())
        .collect();
    if parsed.is_empty() {
        return CorsLayer::new().allow_origin(Any).allow_methods(methods).allow_headers(Any);
    }
    CorsLayer::new()
        .allow_origin(AllowOrigin::list(parsed))
        .allow_methods(methods)
        .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION])
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
    uptime_secs: u64,
    deepseek_configured: bool,
    openai_configured: bool,
    scheduler_running: bool,
}

async fn api_health(State(state): State<Arc<SharedState>>) -> Json<HealthResponse> {
    let uptime = START_TIME.get().map(|t| t.elapsed().as_secs()).unwrap_or(0);
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        uptime_secs: uptime,
        deepseek_configured: state.deepseek.is_some(),
        openai_configured: state.openai.is_some(),
        scheduler_running: state.scheduler.is_running(),
    })
}

/// Security headers on every response, uploads included.
async fn security_headers(req: axum::extract::Request, next: axum::middleware::Next) -> axum::response::Response {
    let mut resp = next.run(req).await;
    let headers = resp.headers_mut();
    headers.insert(header::X_CONTENT_TYPE_OPTIONS, HeaderValue::from_static("nosniff"));
    headers.insert(header::X_FRAME_OPTIONS, HeaderValue::from_static("DENY"));
    headers.insert(header::REFERRER_POLICY, HeaderValue::from_static("strict-origin-when-cross-origin"));
    if !headers.contains_key(header::CONTENT_SECURITY_POLICY) {
        headers.insert(
            header::CONTENT_SECURITY_POLICY,
            HeaderValue::from_static("default-src 'none'; img-src 'self'; frame-ancestors 'none'"),
        );
    }
    resp
}

/// Clamp an optional `limit` query parameter.
pub(crate) fn page_limit(limit: Option<usize>, default: usize, max: usize) -> usize {
    limit.unwrap_or(default).clamp(1, max)
}
