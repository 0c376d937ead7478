//! AI endpoints: chat proxy, conversation replies, content generation, and
//! scheduler control. All require a signed-in user; starting, stopping, and
//! triggering the scheduler require an admin.

use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};

use campus_sdk::llm::ChatRequest;
use campus_sdk::models::{
    ChatProxyRequest, ChatProxyResponse, ChatResponseRequest, GenerateContentRequest, GeneratedContent, Message,
    SchedulerAction, SchedulerRequest, SchedulerResponse, SchedulerStatus,
};

use crate::auth::AuthUser;
use crate::chat_service;
use crate::content;
use crate::error::{ApiError, ApiResult};
use crate::scheduler::TriggerOutcome;
use crate::server::SharedState;
use crate::web::messaging::require_participant;

const VALID_ROLES: &[&str] = &["system", "user", "assistant"];
const MAX_PROXY_MESSAGES: usize = 100;

pub fn routes() -> Router<Arc<SharedState>> {
    Router::new()
        .route("/api/ai/chat", post(chat))
        .route("/api/ai/chat-response", post(chat_response))
        .route("/api/ai/generate-content-gpt", post(generate_content))
        .route("/api/ai/scheduler", get(scheduler_status).post(scheduler_action))
}

/// Forward a chat completion to DeepSeek.
async fn chat(
    State(state): State<Arc<SharedState>>,
    _user: AuthUser,
    Json(req): Json<ChatProxyRequest>,
) -> ApiResult<Json<ChatProxyResponse>> {
    if req.messages.is_empty() {
        return Err(ApiError::bad_request("messages must not be empty"));
    }
    if req.messages.len() > MAX_PROXY_MESSAGES {
        return Err(ApiError::bad_request(format!("at most {MAX_PROXY_MESSAGES} messages")));
    }
    if let Some(m) = req.messages.iter().find(|m| !VALID_ROLES.contains(&m.role.as_str())) {
        return Err(ApiError::bad_request(format!("invalid role: {}", m.role)));
    }
    if req.temperature.is_some_and(|t| !(0.0..=2.0).contains(&t)) {
        return Err(ApiError::bad_request("temperature must be between 0 and 2"));
    }

    let client = state
        .deepseek
        .as_ref()
        .ok_or_else(|| ApiError::Unavailable("DeepSeek API key is not configured".to_string()))?;
    let resp = client
        .chat(&ChatRequest {
            messages: req.messages,
            model: req.model,
            temperature: req.temperature,
            max_tokens: req.max_tokens,
        })
        .await?;
    Ok(Json(ChatProxyResponse { content: resp.content, model: resp.model, usage: resp.usage }))
}

/// Answer a conversation with the AI assistant now. Pending tasks for the
/// conversation are claimed first so the scheduler does not answer twice.
async fn chat_response(
    State(state): State<Arc<SharedState>>,
    user: AuthUser,
    Json(req): Json<ChatResponseRequest>,
) -> ApiResult<(StatusCode, Json<Message>)> {
    require_participant(&state, &req.conversation_id, user.uid())?;
    // Leave queued tasks pending when no provider is configured, as the
    // scheduler does.
    if state.deepseek.is_none() {
        return Err(ApiError::Unavailable("DeepSeek API key is not configured".to_string()));
    }
    let tasks = state.with_db(|db| db.claim_conversation_ai_tasks(&req.conversation_id))?;
    let outcome = chat_service::respond_to_conversation(&state, &req.conversation_id).await;
    chat_service::settle_tasks(&state, &tasks, &outcome)?;
    Ok((StatusCode::CREATED, Json(outcome?)))
}

async fn generate_content(
    State(state): State<Arc<SharedState>>,
    user: AuthUser,
    Json(req): Json<GenerateContentRequest>,
) -> ApiResult<Json<GeneratedContent>> {
    if req.publish {
        user.require_admin()?;
    }
    Ok(Json(content::generate(&state, &req).await?))
}

fn current_status(state: &SharedState) -> ApiResult<SchedulerStatus> {
    let pending = state.with_db(|db| db.ai_task_counts())?.pending;
    Ok(state.scheduler.status(pending))
}

async fn scheduler_status(State(state): State<Arc<SharedState>>, _user: AuthUser) -> ApiResult<Json<SchedulerStatus>> {
    Ok(Json(current_status(&state)?))
}

async fn scheduler_action(
    State(state): State<Arc<SharedState>>,
    user: AuthUser,
    Json(req): Json<SchedulerRequest>,
) -> ApiResult<Json<SchedulerResponse>> {
    if req.action != SchedulerAction::Status {
        user.require_admin()?;
    }
    let (success, message, report) = match req.action {
        SchedulerAction::Start => {
            let started = state.scheduler.start(Arc::clone(&state));
            let msg = if started { "scheduler started" } else { "scheduler already running" };
            (started, msg.to_string(), None)
        }
        SchedulerAction::Stop => {
            let stopped = state.scheduler.stop();
            let msg = if stopped { "scheduler stopped" } else { "scheduler was not running" };
            (stopped, msg.to_string(), None)
        }
        SchedulerAction::Trigger => match state.scheduler.trigger(&state).await? {
            TriggerOutcome::Ran(report) => (true, "processed pending AI tasks".to_string(), Some(report)),
            TriggerOutcome::Busy => (false, "a processing pass is already running".to_string(), None),
        },
        SchedulerAction::Status => (true, "ok".to_string(), None),
    };
    tracing::info!(action = ?req.action, by = %user.uid(), success, "Scheduler action");
    Ok(Json(SchedulerResponse { success, message, report, status: current_status(&state)? }))
}
