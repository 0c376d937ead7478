use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};

use campus_sdk::models::Notification;

use crate::auth::AuthUser;
use crate::error::{ApiError, ApiResult};
use crate::server::SharedState;
use crate::web::page_limit;

pub fn routes() -> Router<Arc<SharedState>> {
    Router::new()
        .route("/api/notifications", get(list))
        .route("/api/notifications/read-all", post(read_all))
        .route("/api/notifications/{id}/read", post(read_one))
}

#[derive(Debug, Deserialize)]
struct NotificationQuery {
    #[serde(default)]
    unread: bool,
    limit: Option<usize>,
}

async fn list(
    State(state): State<Arc<SharedState>>,
    user: AuthUser,
    Query(q): Query<NotificationQuery>,
) -> ApiResult<Json<Vec<Notification>>> {
    let limit = page_limit(q.limit, 50, 200);
    Ok(Json(state.with_db(|db| db.list_notifications(user.uid(), q.unread, limit))?))
}

async fn read_one(
    State(state): State<Arc<SharedState>>,
    user: AuthUser,
    Path(id): Path<String>,
) -> ApiResult<StatusCode> {
    if !state.with_db(|db| db.mark_notification_read(&id, user.uid()))? {
        return Err(ApiError::not_found("notification"));
    }
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Serialize)]
struct ReadAllResponse {
    updated: usize,
}

async fn read_all(State(state): State<Arc<SharedState>>, user: AuthUser) -> ApiResult<Json<ReadAllResponse>> {
    let updated = state.with_db(|db| db.mark_all_notifications_read(user.uid()))?;
    Ok(Json(ReadAllResponse { updated }))
}
