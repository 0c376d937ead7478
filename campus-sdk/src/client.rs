//! Typed HTTP client for the campus API.
//!
//! Holds the bearer token after `register`/`login`. Every non-2xx response
//! is turned into [`ApiClientError::Status`] carrying the server's
//! `{"error": ...}` message.

use percent_encoding::{utf8_percent_encode, NON_ALPHANUMERIC};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::models::*;

#[derive(Debug, thiserror::Error)]
pub enum ApiClientError {
    #[error("request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("server returned {status}: {error}")]
    Status { status: u16, error: String },
    #[error("not logged in")]
    NotLoggedIn,
}

pub type Result<T> = std::result::Result<T, ApiClientError>;

/// API client bound to one server.
#[derive(Debug, Clone)]
pub struct ApiClient {
    base_url: String,
    token: Option<String>,
    http: reqwest::Client,
}

impl ApiClient {
    pub fn new(base_url: &str) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            token: None,
            http: reqwest::Client::new(),
        }
    }

    pub fn with_token(mut self, token: String) -> Self {
        self.token = Some(token);
        self
    }

    pub fn token(&self) -> Option<&str> {
        self.token.as_deref()
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    fn authed(&self, rb: reqwest::RequestBuilder) -> Result<reqwest::RequestBuilder> {
        let token = self.token.as_deref().ok_or(ApiClientError::NotLoggedIn)?;
        Ok(rb.bearer_auth(token))
    }

    async fn send<T: DeserializeOwned>(rb: reqwest::RequestBuilder) -> Result<T> {
        let resp = rb.send().await?;
        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            let error = serde_json::from_str::<ErrorBody>(&text)
                .map(|b| b.error)
                .unwrap_or(text);
            return Err(ApiClientError::Status { status: status.as_u16(), error });
        }
        Ok(resp.json::<T>().await?)
    }

    async fn post_json<B: Serialize, T: DeserializeOwned>(&self, path: &str, body: &B) -> Result<T> {
        let rb = self.authed(self.http.post(self.url(path)))?.json(body);
        Self::send(rb).await
    }

    /// Create an account and keep its session token.
    pub async fn register(&mut self, email: &str, password: &str, display_name: &str) -> Result<UserProfile> {
        let body = RegisterRequest {
            email: email.to_string(),
            password: password.to_string(),
            display_name: display_name.to_string(),
        };
        let resp: AuthResponse = Self::send(self.http.post(self.url("/api/auth/register")).json(&body)).await?;
        self.token = Some(resp.token);
        Ok(resp.user)
    }

    pub async fn login(&mut self, email: &str, password: &str) -> Result<UserProfile> {
        let body = LoginRequest { email: email.to_string(), password: password.to_string() };
        let resp: AuthResponse = Self::send(self.http.post(self.url("/api/auth/login")).json(&body)).await?;
        self.token = Some(resp.token);
        Ok(resp.user)
    }

    pub async fn me(&self) -> Result<UserProfile> {
        Self::send(self.authed(self.http.get(self.url("/api/users/me")))?).await
    }

    pub async fn list_categories(&self) -> Result<Vec<Category>> {
        Self::send(self.http.get(self.url("/api/categories"))).await
    }

    pub async fn list_posts(&self, category: Option<&str>, limit: usize) -> Result<Vec<Post>> {
        let mut path = format!("/api/posts?limit={limit}");
        if let Some(c) = category {
            path.push_str("&category=");
            path.push_str(&utf8_percent_encode(c, NON_ALPHANUMERIC).to_string());
        }
        Self::send(self.http.get(self.url(&path))).await
    }

    pub async fn create_post(&self, post: &NewPost) -> Result<Post> {
        self.post_json("/api/posts", post).await
    }

    /// Ask the server to generate post content with its configured model.
    pub async fn generate_content(&self, req: &GenerateContentRequest) -> Result<GeneratedContent> {
        self.post_json("/api/ai/generate-content-gpt", req).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn authed_calls_require_token() {
        let client = ApiClient::new("http://127.0.0.1:9/");
        let err = client.create_post(&NewPost::default()).await.unwrap_err();
        assert!(matches!(err, ApiClientError::NotLoggedIn));
    }

    #[test]
    fn base_url_trailing_slash_trimmed() {
        let client = ApiClient::new("http://localhost:8080/");
        assert_eq!(client.url("/api/posts"), "http://localhost:8080/api/posts");
    }
}
