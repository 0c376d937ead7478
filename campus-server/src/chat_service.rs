//! AI assistant replies in direct conversations.
//!
//! A message sent into a conversation that includes the assistant enqueues
//! an AI task. Tasks are answered either on demand (`/api/ai/chat-response`)
//! or by the scheduler through [`process_pending`].

use std::collections::BTreeMap;

use campus_sdk::llm::{ChatMessage, ChatRequest};
use campus_sdk::models::{Message, NotificationKind, ProcessReport, AI_ASSISTANT_UID};

use crate::db::AiTask;
use crate::error::{ApiError, ApiResult};
use crate::server::SharedState;

pub const SYSTEM_PROMPT: &str = "You are Campus AI, a friendly assistant for international students. \
Help with studying abroad: admissions, visas, housing, coursework, part-time jobs, culture, and daily life. \
Answer concisely and practically. If you are unsure about legal or immigration rules, say so and suggest \
checking with the university's international office. Reply in the language the student writes in.";

const MAX_REPLY_TOKENS: u32 = 1024;

/// Map stored messages to chat roles: the assistant's own messages become
/// `assistant`, everyone else's become `user`. Image-only messages are
/// described rather than dropped so the turn order is kept.
pub fn build_chat_history(messages: &[Message]) -> Vec<ChatMessage> {
    let mut out = Vec::with_capacity(messages.len() + 1);
    out.push(ChatMessage::system(SYSTEM_PROMPT));
    for m in messages {
        let text = match (m.content.trim().is_empty(), m.image_url.as_deref()) {
            (true, Some(url)) => format!("[sent an image: {url}]"),
            (true, None) => continue,
            (false, _) => m.content.clone(),
        };
        if m.sender_id == AI_ASSISTANT_UID {
            out.push(ChatMessage::assistant(text));
        } else {
            out.push(ChatMessage::user(text));
        }
    }
    out
}

/// Generate and store an assistant reply for one conversation.
pub async fn respond_to_conversation(state: &SharedState, conversation_id: &str) -> ApiResult<Message> {
    let client = state
        .deepseek
        .as_ref()
        .ok_or_else(|| ApiError::Unavailable("DeepSeek API key is not configured".to_string()))?;

    let context = state.config.ai_context_messages.max(1);
    let (participants, history) = state.with_db(|db| {
        let participants = db.participants(conversation_id)?;
        let history = db.list_messages(conversation_id, context, None)?;
        Ok((participants, history))
    })?;
    if participants.is_empty() {
        return Err(ApiError::not_found("conversation"));
    }
    if !participants.iter().any(|p| p == AI_ASSISTANT_UID) {
        return Err(ApiError::bad_request("conversation does not include the AI assistant"));
    }
    if !history.iter().any(|m| m.sender_id != AI_ASSISTANT_UID) {
        return Err(ApiError::bad_request("no user messages to respond to"));
    }

    let req = ChatRequest {
        messages: build_chat_history(&history),
        max_tokens: Some(MAX_REPLY_TOKENS),
        ..Default::default()
    };
    let reply = client.chat(&req).await?;
    tracing::info!(
        conversation = conversation_id,
        model = %reply.model,
        tokens = reply.usage.as_ref().map(|u| u.total_tokens).unwrap_or(0),
        "AI reply generated"
    );

    state.with_db(|db| {
        let msg = db.insert_message(conversation_id, AI_ASSISTANT_UID, reply.content.trim(), None)?;
        for uid in participants.iter().filter(|p| *p != AI_ASSISTANT_UID) {
            db.create_notification(
                uid,
                NotificationKind::Message,
                Some(AI_ASSISTANT_UID),
                Some(conversation_id),
                "Campus AI replied to your message",
            )?;
        }
        Ok(msg)
    })
}

/// Mark every task of a conversation with the outcome of one reply attempt.
pub fn settle_tasks(state: &SharedState, tasks: &[AiTask], outcome: &ApiResult<Message>) -> ApiResult<()> {
    state.with_db(|db| {
        for task in tasks {
            match outcome {
                Ok(msg) => db.complete_ai_task(&task.id, &msg.id)?,
                Err(e) => db.fail_ai_task(&task.id, &e.to_string())?,
            }
        }
        Ok(())
    })
}

/// Claim a batch of pending tasks and answer them one conversation at a
/// time. Several tasks for the same conversation share a single reply.
/// Failed tasks are marked `failed` and not retried.
pub async fn process_pending(state: &SharedState) -> ApiResult<ProcessReport> {
    if state.deepseek.is_none() {
        tracing::warn!("Skipping AI task pass: DeepSeek API key is not configured");
        return Ok(ProcessReport::default());
    }

    let batch = state.config.scheduler_batch_size.max(1);
    let tasks = state.with_db(|db| db.claim_pending_ai_tasks(batch))?;
    let mut report = ProcessReport { claimed: tasks.len(), ..Default::default() };
    if tasks.is_empty() {
        return Ok(report);
    }

    let mut by_conversation: BTreeMap<String, Vec<AiTask>> = BTreeMap::new();
    for task in tasks {
        by_conversation.entry(task.conversation_id.clone()).or_default().push(task);
    }

    for (conversation_id, tasks) in by_conversation {
        let outcome = respond_to_conversation(state, &conversation_id).await;
        match &outcome {
            Ok(_) => report.completed += tasks.len(),
            Err(e) => {
                tracing::warn!(conversation = %conversation_id, "AI task failed: {e}");
                report.failed += tasks.len();
            }
        }
        if let Err(e) = settle_tasks(state, &tasks, &outcome) {
            // Unsettled tasks stay `processing` until the next startup requeue.
            tracing::error!(conversation = %conversation_id, "Failed to record AI task outcome: {e}");
        }
    }

    tracing::info!(
        claimed = report.claimed,
        completed = report.completed,
        failed = report.failed,
        "AI task pass finished"
    );
    Ok(report)
}
