use std::sync::Arc;

use axum::extract::{Multipart, State};
use axum::http::StatusCode;
use axum::routing::post;
use axum::{Json, Router};

use campus_sdk::models::UploadResponse;

use crate::auth::AuthUser;
use crate::error::{ApiError, ApiResult};
use crate::server::SharedState;

pub fn routes() -> Router<Arc<SharedState>> {
    Router::new().route("/api/uploads", post(upload))
}

/// Multipart upload with a single `file` field. Other fields are ignored.
async fn upload(
    State(state): State<Arc<SharedState>>,
    user: AuthUser,
    mut multipart: Multipart,
) -> ApiResult<(StatusCode, Json<UploadResponse>)> {
    let mut file: Option<(Vec<u8>, Option<String>)> = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::bad_request(format!("multipart error: {e}")))?
    {
        if field.name() != Some("file") {
            continue;
        }
        let content_type = field.content_type().map(|s| s.to_string());
        let bytes = field.bytes().await.map_err(|e| {
            if e.status() == StatusCode::PAYLOAD_TOO_LARGE {
                ApiError::PayloadTooLarge(format!("file too large (max {} bytes)", state.uploads.max_bytes()))
            } else {
                ApiError::bad_request(format!("file read error: {e}"))
            }
        })?;
        file = Some((bytes.to_vec(), content_type));
    }

    let (bytes, content_type) = file.ok_or_else(|| ApiError::bad_request("no file provided"))?;
    let resp = state.uploads.save(user.uid(), &bytes, content_type.as_deref()).await?;
    Ok((StatusCode::CREATED, Json(resp)))
}
