//! Direct conversations and messages.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;

use campus_sdk::models::{Conversation, Message, NewConversation, NewMessage, NotificationKind, AI_ASSISTANT_UID};

use crate::auth::AuthUser;
use crate::error::{ApiError, ApiResult};
use crate::server::SharedState;
use crate::web::page_limit;

const MAX_MESSAGE: usize = 4_000;

pub fn routes() -> Router<Arc<SharedState>> {
    Router::new()
        .route("/api/conversations", get(list_conversations).post(open_conversation))
        .route("/api/conversations/{id}/messages", get(list_messages).post(send_message))
        .route("/api/conversations/{id}/read", post(mark_read))
}

/// 404 for unknown conversations, 403 for ones the caller is not part of.
pub(crate) fn require_participant(state: &SharedState, conversation_id: &str, uid: &str) -> ApiResult<Vec<String>> {
    let participants = state.with_db(|db| db.participants(conversation_id))?;
    if participants.is_empty() {
        return Err(ApiError::not_found("conversation"));
    }
    if !participants.iter().any(|p| p == uid) {
        return Err(ApiError::forbidden("not a participant of this conversation"));
    }
    Ok(participants)
}

#[derive(Debug, Deserialize)]
struct ListQuery {
    limit: Option<usize>,
}

async fn list_conversations(
    State(state): State<Arc<SharedState>>,
    user: AuthUser,
    Query(q): Query<ListQuery>,
) -> ApiResult<Json<Vec<Conversation>>> {
    let limit = page_limit(q.limit, 50, 200);
    Ok(Json(state.with_db(|db| db.list_conversations(user.uid(), limit))?))
}

async fn open_conversation(
    State(state): State<Arc<SharedState>>,
    user: AuthUser,
    Json(req): Json<NewConversation>,
) -> ApiResult<(StatusCode, Json<Conversation>)> {
    let other = req.participant.trim();
    if other.is_empty() || other == user.uid() {
        return Err(ApiError::bad_request("participant must be another user"));
    }
    let (conversation, created) = state.with_db(|db| {
        if db.get_user(other)?.is_none() {
            return Ok(None);
        }
        db.find_or_create_direct(user.uid(), other).map(Some)
    })?
    .ok_or_else(|| ApiError::not_found("user"))?;
    let status = if created { StatusCode::CREATED } else { StatusCode::OK };
    Ok((status, Json(conversation)))
}

#[derive(Debug, Deserialize)]
struct MessageQuery {
    limit: Option<usize>,
    before: Option<String>,
}

async fn list_messages(
    State(state): State<Arc<SharedState>>,
    user: AuthUser,
    Path(id): Path<String>,
    Query(q): Query<MessageQuery>,
) -> ApiResult<Json<Vec<Message>>> {
    require_participant(&state, &id, user.uid())?;
    let limit = page_limit(q.limit, 50, 200);
    let before = q.before.as_deref().filter(|s| !s.is_empty());
    Ok(Json(state.with_db(|db| db.list_messages(&id, limit, before))?))
}

async fn send_message(
    State(state): State<Arc<SharedState>>,
    user: AuthUser,
    Path(id): Path<String>,
    Json(req): Json<NewMessage>,
) -> ApiResult<(StatusCode, Json<Message>)> {
    let participants = require_participant(&state, &id, user.uid())?;
    let content = req.content.trim();
    let image_url = req.image_url.as_deref().map(str::trim).filter(|u| !u.is_empty());
    if content.is_empty() && image_url.is_none() {
        return Err(ApiError::bad_request("message needs content or an image"));
    }
    if content.chars().count() > MAX_MESSAGE {
        return Err(ApiError::bad_request(format!("message must be at most {MAX_MESSAGE} characters")));
    }

    let wants_ai = participants.iter().any(|p| p == AI_ASSISTANT_UID) && user.uid() != AI_ASSISTANT_UID;
    // One transaction, so a message never lands without its AI task.
    let message = state.with_db(|db| {
        db.atomically(|db| {
            let msg = db.insert_message(&id, user.uid(), content, image_url)?;
            for uid in participants.iter().filter(|p| *p != user.uid() && *p != AI_ASSISTANT_UID) {
                let preview: String = if content.is_empty() {
                    "sent an image".to_string()
                } else {
                    content.chars().take(80).collect()
                };
                let text = format!("{}: {preview}", user.profile.display_name);
                db.create_notification(uid, NotificationKind::Message, Some(user.uid()), Some(&id), &text)?;
            }
            if wants_ai {
                db.enqueue_ai_task(&id, Some(&msg.id))?;
            }
            Ok(msg)
        })
    })?;
    if wants_ai {
        tracing::debug!(conversation = %id, "Queued AI reply");
    }
    Ok((StatusCode::CREATED, Json(message)))
}

async fn mark_read(
    State(state): State<Arc<SharedState>>,
    user: AuthUser,
    Path(id): Path<String>,
) -> ApiResult<StatusCode> {
    require_participant(&state, &id, user.uid())?;
    state.with_db(|db| db.mark_read(&id, user.uid()))?;
    Ok(StatusCode::NO_CONTENT)
}
