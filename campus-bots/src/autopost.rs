//! Auto-poster: keeps the forum lively by publishing a generated post per
//! round, rotating through categories.
//!
//! Drafts come either from the server's `generate-content-gpt` endpoint or,
//! when the bot has its own API key, straight from the LLM.

use anyhow::{Context, Result};
use campus_sdk::client::{ApiClient, ApiClientError};
use campus_sdk::llm::LlmClient;
use campus_sdk::models::{Category, GenerateContentRequest, NewPost, Post, UserProfile};
use rand::seq::SliceRandom;

const SYSTEM_PROMPT: &str = "You write friendly, practical forum posts for international students. \
Reply with the title on the first line, a blank line, then the post body in plain text.";

const GENERAL_TOPICS: &[&str] = &[
    "making friends in a new country",
    "staying connected with family back home",
    "handling culture shock in the first semester",
];

/// Built-in topics per default category slug. Unknown slugs fall back to
/// general topics.
pub fn topics_for(slug: &str) -> &'static [&'static str] {
    match slug {
        "housing" => &[
            "what to check before signing a lease",
            "finding roommates as an international student",
            "understanding utility bills and deposits",
        ],
        "visa" => &[
            "preparing for a student visa renewal",
            "keeping your status while working part-time",
            "documents to carry when travelling abroad",
        ],
        "academics" => &[
            "how office hours work and why to use them",
            "avoiding plagiarism when citing sources",
            "planning a course load for your first year",
        ],
        "jobs" => &[
            "finding an on-campus job",
            "writing a resume for local employers",
            "preparing for internship interviews",
        ],
        "life" => &[
            "opening a bank account",
            "getting a local phone plan",
            "using public transport on a budget",
        ],
        "food" => &[
            "cooking cheap meals in a shared kitchen",
            "finding groceries from home",
            "eating well during exam season",
        ],
        "events" => &[
            "getting the most out of orientation week",
            "joining student clubs and societies",
            "celebrating holidays away from home",
        ],
        _ => GENERAL_TOPICS,
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Draft {
    pub title: String,
    pub content: String,
    pub tags: Vec<String>,
}

/// Split an LLM reply into title and body. The title is the first non-empty
/// line with any markdown heading or `Title:` prefix removed.
pub fn parse_draft(text: &str) -> Option<Draft> {
    let text = text.trim();
    let (first, rest) = text.split_once('\n').unwrap_or((text, ""));
    let title = first.trim().trim_start_matches('#').trim();
    let title = title
        .strip_prefix("Title:")
        .or_else(|| title.strip_prefix("title:"))
        .unwrap_or(title)
        .trim()
        .trim_matches('*')
        .trim();
    let content = rest.trim();
    if title.is_empty() || content.is_empty() {
        return None;
    }
    Some(Draft { title: title.to_string(), content: content.to_string(), tags: Vec::new() })
}

/// Log in, creating the account on first run.
pub async fn ensure_session(api: &mut ApiClient, email: &str, password: &str, display_name: &str) -> Result<UserProfile> {
    match api.login(email, password).await {
        Ok(user) => Ok(user),
        Err(ApiClientError::Status { status: 401, .. }) => {
            tracing::info!(%email, "No account yet, registering");
            api.register(email, password, display_name).await.context("register bot account")
        }
        Err(e) => Err(e).context("log in"),
    }
}

pub struct AutoPoster {
    api: ApiClient,
    llm: Option<LlmClient>,
    categories: Vec<String>,
    round: usize,
}

impl AutoPoster {
    /// `api` must already be logged in. An empty category list is filled
    /// from the server on the first round.
    pub fn new(api: ApiClient, llm: Option<LlmClient>, categories: Vec<String>) -> Self {
        Self { api, llm, categories, round: 0 }
    }

    pub fn categories(&self) -> &[String] {
        &self.categories
    }

    /// Fill the rotation from the server unless categories were configured.
    pub async fn load_categories(&mut self) -> Result<()> {
        if !self.categories.is_empty() {
            return Ok(());
        }
        let all: Vec<Category> = self.api.list_categories().await.context("list categories")?;
        self.categories = all.into_iter().map(|c| c.slug).collect();
        anyhow::ensure!(!self.categories.is_empty(), "server has no categories");
        Ok(())
    }

    fn next_category(&mut self) -> String {
        let slug = self.categories[self.round % self.categories.len()].clone();
        self.round += 1;
        slug
    }

    async fn draft(&self, slug: &str, topic: &str) -> Result<Draft> {
        match &self.llm {
            Some(llm) => {
                let prompt = format!("Write a forum post for the \"{slug}\" board about: {topic}. Keep it under 300 words.");
                let reply = llm.complete(SYSTEM_PROMPT, &prompt).await?;
                parse_draft(&reply).with_context(|| format!("unusable draft from {}", llm.provider()))
            }
            None => {
                let generated = self
                    .api
                    .generate_content(&GenerateContentRequest {
                        topic: topic.to_string(),
                        category: Some(slug.to_string()),
                        ..Default::default()
                    })
                    .await
                    .context("generate content")?;
                Ok(Draft { title: generated.title, content: generated.content, tags: generated.tags })
            }
        }
    }

    /// Generate and publish one post in the next category.
    pub async fn post_once(&mut self) -> Result<Post> {
        self.load_categories().await?;
        let slug = self.next_category();
        let topic = topics_for(&slug)
            .choose(&mut rand::thread_rng())
            .copied()
            .unwrap_or(GENERAL_TOPICS[0]);
        tracing::debug!(category = %slug, %topic, "Drafting post");

        let draft = self.draft(&slug, topic).await?;
        let post = self
            .api
            .create_post(&NewPost {
                title: draft.title,
                content: draft.content,
                category_id: Some(slug.clone()),
                tags: draft.tags,
                ..Default::default()
            })
            .await
            .context("publish post")?;
        tracing::info!(post_id = %post.id, category = %slug, title = %post.title, "Published post");
        Ok(post)
    }
}
