//! AI post generation via the OpenAI chat completions API.

use campus_sdk::llm::{ChatMessage, ChatRequest};
use campus_sdk::models::{GenerateContentRequest, GeneratedContent, NewPost, AI_ASSISTANT_UID};
use serde::Deserialize;

use crate::error::{ApiError, ApiResult};
use crate::server::SharedState;

const DEFAULT_MAX_WORDS: u32 = 400;
const MAX_WORDS_CAP: u32 = 2000;
const MAX_TAGS: usize = 8;

const SYSTEM_PROMPT: &str = "You write helpful community posts for a forum of international students. \
Posts are practical, friendly, and specific. Respond with a single JSON object and nothing else: \
{\"title\": string, \"content\": string, \"tags\": [string]}. \
The content is plain text with paragraphs separated by blank lines.";

/// Build the user prompt for one generation request.
pub fn build_prompt(req: &GenerateContentRequest) -> String {
    let max_words = req.max_words.unwrap_or(DEFAULT_MAX_WORDS).clamp(50, MAX_WORDS_CAP);
    let mut prompt = format!("Write a forum post about: {}\n", req.topic.trim());
    if let Some(category) = req.category.as_deref().filter(|c| !c.is_empty()) {
        prompt.push_str(&format!("Category: {category}\n"));
    }
    let language = req.language.as_deref().filter(|l| !l.is_empty()).unwrap_or("English");
    prompt.push_str(&format!("Language: {language}\n"));
    if let Some(tone) = req.tone.as_deref().filter(|t| !t.is_empty()) {
        prompt.push_str(&format!("Tone: {tone}\n"));
    }
    prompt.push_str(&format!("Length: at most {max_words} words.\n"));
    prompt.push_str("Include 2 to 5 short lowercase tags.");
    prompt
}

#[derive(Debug, Deserialize)]
struct RawGenerated {
    #[serde(default)]
    title: String,
    #[serde(default)]
    content: String,
    #[serde(default)]
    tags: Vec<String>,
}

/// A post parsed out of a model reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedPost {
    pub title: String,
    pub content: String,
    pub tags: Vec<String>,
}

/// Strip a surrounding Markdown code fence (```json ... ```), if present.
fn strip_fence(text: &str) -> &str {
    let trimmed = text.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let body = rest.split_once('\n').map(|(_, b)| b).unwrap_or("");
    body.trim_end().strip_suffix("```").unwrap_or(body).trim()
}

/// Parse a model reply. Accepts a raw or fenced JSON object; anything else is
/// read as "first line is the title, the rest is the content".
pub fn parse_generated(text: &str) -> Option<ParsedPost> {
    let body = strip_fence(text);
    let json_slice = match (body.find('{'), body.rfind('}')) {
        (Some(start), Some(end)) if end > start => Some(&body[start..=end]),
        _ => None,
    };
    let raw = json_slice
        .and_then(|s| serde_json::from_str::<RawGenerated>(s).ok())
        .filter(|r| !r.title.trim().is_empty() && !r.content.trim().is_empty());
    if let Some(raw) = raw {
        return Some(ParsedPost {
            title: raw.title.trim().to_string(),
            content: raw.content.trim().to_string(),
            tags: clean_tags(raw.tags),
        });
    }

    let mut lines = body.lines().skip_while(|l| l.trim().is_empty());
    let title = lines.next()?.trim().trim_start_matches('#').trim();
    let content = lines.collect::<Vec<_>>().join("\n").trim().to_string();
    if title.is_empty() || content.is_empty() {
        return None;
    }
    Some(ParsedPost { title: title.to_string(), content, tags: Vec::new() })
}

fn clean_tags(tags: Vec<String>) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for tag in tags {
        let tag = tag.trim().trim_start_matches('#').to_lowercase();
        if !tag.is_empty() && !out.contains(&tag) {
            out.push(tag);
        }
        if out.len() == MAX_TAGS {
            break;
        }
    }
    out
}

/// Generate a post for `req`. When `req.publish` is set the post is stored
/// as authored by the AI assistant; the caller checks admin rights.
pub async fn generate(state: &SharedState, req: &GenerateContentRequest) -> ApiResult<GeneratedContent> {
    if req.topic.trim().is_empty() {
        return Err(ApiError::bad_request("topic is required"));
    }
    let client = state
        .openai
        .as_ref()
        .ok_or_else(|| ApiError::Unavailable("OpenAI API key is not configured".to_string()))?;

    let category_id = match req.category.as_deref().filter(|c| !c.is_empty()) {
        Some(c) if req.publish => Some(
            state
                .with_db(|db| db.get_category(c))?
                .ok_or_else(|| ApiError::bad_request(format!("unknown category: {c}")))?
                .id,
        ),
        _ => None,
    };

    let chat = ChatRequest {
        messages: vec![ChatMessage::system(SYSTEM_PROMPT), ChatMessage::user(build_prompt(req))],
        temperature: Some(0.8),
        ..Default::default()
    };
    let reply = client.chat(&chat).await?;
    let parsed = parse_generated(&reply.content).ok_or_else(|| ApiError::Upstream {
        status: axum::http::StatusCode::BAD_GATEWAY,
        message: "model reply did not contain a usable post".to_string(),
    })?;
    tracing::info!(topic = %req.topic, model = %reply.model, title = %parsed.title, "Generated content");

    let post = if req.publish {
        let new = NewPost {
            title: parsed.title.clone(),
            content: parsed.content.clone(),
            category_id,
            image_urls: Vec::new(),
            tags: parsed.tags.clone(),
        };
        Some(state.with_db(|db| db.create_post(AI_ASSISTANT_UID, &new, true))?)
    } else {
        None
    };

    Ok(GeneratedContent {
        title: parsed.title,
        content: parsed.content,
        tags: parsed.tags,
        model: reply.model,
        post,
    })
}
