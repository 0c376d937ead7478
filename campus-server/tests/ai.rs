//! AI endpoint and scheduler tests against a mock chat completions provider.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::State;
use axum::http::StatusCode as MockStatus;
use axum::routing::post;
use axum::{Json, Router};
use campus_sdk::models::*;
use campus_server::config::ServerConfig;
use reqwest::StatusCode;
use serde_json::{json, Value};

const ADMIN_EMAIL: &str = "admin@uni.edu";
const PASSWORD: &str = "hunter2hunter2";

/// A provider that records every request and answers with a fixed status and
/// reply text, both adjustable mid-test.
#[derive(Default)]
struct MockProvider {
    requests: Mutex<Vec<Value>>,
    status: Mutex<u16>,
    reply: Mutex<String>,
    delay_ms: Mutex<u64>,
}

impl MockProvider {
    fn set(&self, status: u16, reply: &str) {
        *self.status.lock().unwrap() = status;
        *self.reply.lock().unwrap() = reply.to_string();
    }

    fn set_delay(&self, ms: u64) {
        *self.delay_ms.lock().unwrap() = ms;
    }

    fn requests(&self) -> Vec<Value> {
        self.requests.lock().unwrap().clone()
    }
}

async fn completions(State(mock): State<Arc<MockProvider>>, Json(body): Json<Value>) -> (MockStatus, Json<Value>) {
    mock.requests.lock().unwrap().push(body);
    let delay = *mock.delay_ms.lock().unwrap();
    if delay > 0 {
        tokio::time::sleep(Duration::from_millis(delay)).await;
    }
    let status = MockStatus::from_u16(*mock.status.lock().unwrap()).unwrap();
    if !status.is_success() {
        return (status, Json(json!({"error": {"message": "mock provider failure"}})));
    }
    let reply = mock.reply.lock().unwrap().clone();
    (
        status,
        Json(json!({
            "model": "mock-model",
            "choices": [{"message": {"role": "assistant", "content": reply}, "finish_reason": "stop"}],
            "usage": {"prompt_tokens": 10, "completion_tokens": 5, "total_tokens": 15}
        })),
    )
}

async fn spawn_mock() -> (String, Arc<MockProvider>) {
    let mock = Arc::new(MockProvider::default());
    mock.set(200, "Happy to help!");
    let app = Router::new()
        .route("/chat/completions", post(completions))
        .with_state(Arc::clone(&mock));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    (format!("http://{addr}"), mock)
}

struct TestServer {
    addr: SocketAddr,
    http: reqwest::Client,
    _uploads: tempfile::TempDir,
}

impl TestServer {
    fn url(&self, path: &str) -> String {
        format!("http://{}{path}", self.addr)
    }

    async fn register(&self, email: &str, name: &str) -> (String, UserProfile) {
        let body: AuthResponse = self
            .http
            .post(self.url("/api/auth/register"))
            .json(&json!({"email": email, "password": PASSWORD, "display_name": name}))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        (body.token, body.user)
    }

    async fn post_json(&self, token: &str, path: &str, body: Value) -> reqwest::Response {
        self.http.post(self.url(path)).bearer_auth(token).json(&body).send().await.unwrap()
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, token: &str, path: &str) -> T {
        self.http.get(self.url(path)).bearer_auth(token).send().await.unwrap().json().await.unwrap()
    }

    /// Open the user's conversation with the assistant and send one message.
    async fn ask_assistant(&self, token: &str, text: &str) -> Conversation {
        let conv: Conversation = self
            .post_json(token, "/api/conversations", json!({"participant": AI_ASSISTANT_UID}))
            .await
            .json()
            .await
            .unwrap();
        let resp = self
            .post_json(token, &format!("/api/conversations/{}/messages", conv.id), json!({"content": text}))
            .await;
        assert_eq!(resp.status(), StatusCode::CREATED);
        conv
    }
}

async fn start_server(provider_url: Option<&str>) -> TestServer {
    start_server_with(provider_url, |_| {}).await
}

async fn start_server_with(provider_url: Option<&str>, tweak: impl FnOnce(&mut ServerConfig)) -> TestServer {
    let uploads = tempfile::tempdir().unwrap();
    let mut config = ServerConfig {
        listen_addr: "127.0.0.1:0".to_string(),
        upload_dir: uploads.path().to_string_lossy().into_owned(),
        admin_emails: vec![ADMIN_EMAIL.to_string()],
        scheduler_interval_secs: 3600,
        scheduler_start_delay_secs: 3600,
        ..Default::default()
    };
    if let Some(url) = provider_url {
        config.deepseek_api_key = Some("sk-deepseek".into());
        config.deepseek_base_url = url.to_string();
        config.openai_api_key = Some("sk-openai".into());
        config.openai_base_url = url.to_string();
    }
    tweak(&mut config);
    let (addr, _handle) = campus_server::server::Server::new(config).start().await.unwrap();
    TestServer { addr, http: reqwest::Client::new(), _uploads: uploads }
}

// ── /api/ai/chat ───────────────────────────────────────────────────────

#[tokio::test]
async fn chat_proxy_forwards_payload() {
    let (url, mock) = spawn_mock().await;
    let srv = start_server(Some(&url)).await;
    let (token, _) = srv.register("a@uni.edu", "A").await;

    let resp = srv
        .post_json(
            &token,
            "/api/ai/chat",
            json!({"messages": [{"role": "user", "content": "Where do I get a SIM card?"}], "temperature": 0.3, "max_tokens": 100}),
        )
        .await;
    assert_eq!(resp.status(), StatusCode::OK);
    let body: ChatProxyResponse = resp.json().await.unwrap();
    assert_eq!(body.content, "Happy to help!");
    assert_eq!(body.model, "mock-model");
    assert_eq!(body.usage.unwrap().total_tokens, 15);

    let seen = mock.requests();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0]["model"], "deepseek-chat");
    assert_eq!(seen[0]["messages"][0]["content"], "Where do I get a SIM card?");
    assert_eq!(seen[0]["max_tokens"], 100);
}

#[tokio::test]
async fn chat_proxy_surfaces_provider_status() {
    let (url, mock) = spawn_mock().await;
    let srv = start_server(Some(&url)).await;
    let (token, _) = srv.register("a@uni.edu", "A").await;
    mock.set(429, "");

    let resp = srv
        .post_json(&token, "/api/ai/chat", json!({"messages": [{"role": "user", "content": "hi"}]}))
        .await;
    assert_eq!(resp.status(), StatusCode::TOO_MANY_REQUESTS);
    let body: ErrorBody = resp.json().await.unwrap();
    assert!(body.error.contains("mock provider failure"), "{}", body.error);
}

#[tokio::test]
async fn chat_proxy_validation_and_configuration() {
    let srv = start_server(None).await;
    let (token, _) = srv.register("a@uni.edu", "A").await;

    let resp = srv.post_json(&token, "/api/ai/chat", json!({"messages": []})).await;
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    let resp = srv
        .post_json(&token, "/api/ai/chat", json!({"messages": [{"role": "wizard", "content": "hi"}]}))
        .await;
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

    let resp = srv
        .post_json(&token, "/api/ai/chat", json!({"messages": [{"role": "user", "content": "hi"}]}))
        .await;
    assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);

    let resp = srv
        .http
        .post(srv.url("/api/ai/chat"))
        .json(&json!({"messages": [{"role": "user", "content": "hi"}]}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
}

// ── Conversation replies ───────────────────────────────────────────────

#[tokio::test]
async fn scheduler_trigger_answers_pending_conversation() {
    let (url, mock) = spawn_mock().await;
    let srv = start_server(Some(&url)).await;
    let (admin, _) = srv.register(ADMIN_EMAIL, "Admin").await;
    let (student, _) = srv.register("s@uni.edu", "Student").await;
    let conv = srv.ask_assistant(&student, "How do I renew my visa?").await;

    let status: SchedulerStatus = srv.get_json(&student, "/api/ai/scheduler").await;
    assert_eq!(status.pending_tasks, 1);
    assert!(!status.running);

    let resp = srv.post_json(&admin, "/api/ai/scheduler", json!({"action": "trigger"})).await;
    assert_eq!(resp.status(), StatusCode::OK);
    let body: SchedulerResponse = resp.json().await.unwrap();
    assert!(body.success);
    assert_eq!(body.report, Some(ProcessReport { claimed: 1, completed: 1, failed: 0 }));
    assert_eq!(body.status.pending_tasks, 0);
    assert_eq!(body.status.total_runs, 1);

    let msgs: Vec<Message> = srv.get_json(&student, &format!("/api/conversations/{}/messages", conv.id)).await;
    assert_eq!(msgs.len(), 2);
    assert_eq!(msgs[1].sender_id, AI_ASSISTANT_UID);
    assert_eq!(msgs[1].content, "Happy to help!");

    // System prompt first, then the student's message as the user role.
    let seen = mock.requests();
    let roles: Vec<&str> = seen[0]["messages"].as_array().unwrap().iter().map(|m| m["role"].as_str().unwrap()).collect();
    assert_eq!(roles, ["system", "user"]);

    let notes: Vec<Notification> = srv.get_json(&student, "/api/notifications").await;
    assert_eq!(notes.len(), 1);
    assert_eq!(notes[0].actor_id.as_deref(), Some(AI_ASSISTANT_UID));

    // Nothing left to do
    let body: SchedulerResponse = srv
        .post_json(&admin, "/api/ai/scheduler", json!({"action": "trigger"}))
        .await
        .json()
        .await
        .unwrap();
    assert_eq!(body.report, Some(ProcessReport::default()));
}

#[tokio::test]
async fn failed_tasks_are_not_retried() {
    let (url, mock) = spawn_mock().await;
    let srv = start_server(Some(&url)).await;
    let (admin, _) = srv.register(ADMIN_EMAIL, "Admin").await;
    let (student, _) = srv.register("s@uni.edu", "Student").await;
    srv.ask_assistant(&student, "Hello?").await;
    mock.set(500, "");

    let body: SchedulerResponse = srv
        .post_json(&admin, "/api/ai/scheduler", json!({"action": "trigger"}))
        .await
        .json()
        .await
        .unwrap();
    assert_eq!(body.report, Some(ProcessReport { claimed: 1, completed: 0, failed: 1 }));

    mock.set(200, "Back online");
    let body: SchedulerResponse = srv
        .post_json(&admin, "/api/ai/scheduler", json!({"action": "trigger"}))
        .await
        .json()
        .await
        .unwrap();
    assert_eq!(body.report, Some(ProcessReport::default()));
    assert_eq!(mock.requests().len(), 1);
}

#[tokio::test]
async fn chat_response_claims_pending_tasks() {
    let (url, mock) = spawn_mock().await;
    let srv = start_server(Some(&url)).await;
    let (admin, _) = srv.register(ADMIN_EMAIL, "Admin").await;
    let (student, _) = srv.register("s@uni.edu", "Student").await;
    let (outsider, _) = srv.register("o@uni.edu", "Outsider").await;
    let conv = srv.ask_assistant(&student, "Is the library open on Sunday?").await;

    let resp = srv.post_json(&outsider, "/api/ai/chat-response", json!({"conversation_id": conv.id})).await;
    assert_eq!(resp.status(), StatusCode::FORBIDDEN);

    let resp = srv.post_json(&student, "/api/ai/chat-response", json!({"conversation_id": conv.id})).await;
    assert_eq!(resp.status(), StatusCode::CREATED);
    let reply: Message = resp.json().await.unwrap();
    assert_eq!(reply.sender_id, AI_ASSISTANT_UID);

    // The scheduler must not answer the same message again.
    let body: SchedulerResponse = srv
        .post_json(&admin, "/api/ai/scheduler", json!({"action": "trigger"}))
        .await
        .json()
        .await
        .unwrap();
    assert_eq!(body.report, Some(ProcessReport::default()));
    assert_eq!(mock.requests().len(), 1);
}

#[tokio::test]
async fn chat_response_requires_assistant_conversation() {
    let (url, _mock) = spawn_mock().await;
    let srv = start_server(Some(&url)).await;
    let (alice, _) = srv.register("alice@uni.edu", "Alice").await;
    let (_, bob) = srv.register("bob@uni.edu", "Bob").await;
    let conv: Conversation = srv
        .post_json(&alice, "/api/conversations", json!({"participant": bob.uid}))
        .await
        .json()
        .await
        .unwrap();
    let resp = srv.post_json(&alice, "/api/ai/chat-response", json!({"conversation_id": conv.id})).await;
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn chat_response_without_provider_keeps_tasks_queued() {
    let srv = start_server(None).await;
    let (student, _) = srv.register("s@uni.edu", "Student").await;
    let conv = srv.ask_assistant(&student, "Anyone there?").await;

    let resp = srv.post_json(&student, "/api/ai/chat-response", json!({"conversation_id": conv.id})).await;
    assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);

    let status: SchedulerStatus = srv.get_json(&student, "/api/ai/scheduler").await;
    assert_eq!(status.pending_tasks, 1);
}

// ── Scheduler control ──────────────────────────────────────────────────

#[tokio::test]
async fn scheduler_start_stop_requires_admin() {
    let srv = start_server(None).await;
    let (admin, _) = srv.register(ADMIN_EMAIL, "Admin").await;
    let (student, _) = srv.register("s@uni.edu", "Student").await;

    let resp = srv.post_json(&student, "/api/ai/scheduler", json!({"action": "start"})).await;
    assert_eq!(resp.status(), StatusCode::FORBIDDEN);
    let resp = srv.post_json(&student, "/api/ai/scheduler", json!({"action": "status"})).await;
    assert_eq!(resp.status(), StatusCode::OK);
    let resp = srv.post_json(&admin, "/api/ai/scheduler", json!({"action": "explode"})).await;
    assert!(resp.status().is_client_error());

    let body: SchedulerResponse = srv.post_json(&admin, "/api/ai/scheduler", json!({"action": "start"})).await.json().await.unwrap();
    assert!(body.success);
    assert!(body.status.running);
    assert_eq!(body.status.interval_secs, 3600);

    let body: SchedulerResponse = srv.post_json(&admin, "/api/ai/scheduler", json!({"action": "start"})).await.json().await.unwrap();
    assert!(!body.success);
    assert!(body.status.running);

    let body: SchedulerResponse = srv.post_json(&admin, "/api/ai/scheduler", json!({"action": "stop"})).await.json().await.unwrap();
    assert!(body.success);
    assert!(!body.status.running);
}

/// Poll until the conversation holds `count` messages.
async fn wait_for_messages(srv: &TestServer, token: &str, conv: &str, count: usize) -> Vec<Message> {
    let path = format!("/api/conversations/{conv}/messages");
    for _ in 0..100 {
        let msgs: Vec<Message> = srv.get_json(token, &path).await;
        if msgs.len() >= count {
            return msgs;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    panic!("conversation {conv} never reached {count} messages");
}

#[tokio::test]
async fn autostarted_scheduler_answers_without_trigger() {
    let (url, _mock) = spawn_mock().await;
    let srv = start_server_with(Some(&url), |cfg| {
        cfg.scheduler_autostart = true;
        cfg.scheduler_interval_secs = 1;
        cfg.scheduler_start_delay_secs = 0;
    })
    .await;
    let (admin, _) = srv.register(ADMIN_EMAIL, "Admin").await;
    let (student, _) = srv.register("s@uni.edu", "Student").await;
    let conv = srv.ask_assistant(&student, "When does the semester start?").await;

    let msgs = wait_for_messages(&srv, &student, &conv.id, 2).await;
    assert_eq!(msgs[1].sender_id, AI_ASSISTANT_UID);
    assert_eq!(msgs[1].content, "Happy to help!");

    let status: SchedulerStatus = srv.get_json(&student, "/api/ai/scheduler").await;
    assert!(status.running);
    assert!(status.total_runs >= 1);
    assert!(status.last_run_at.is_some());
    assert_eq!(status.pending_tasks, 0);

    let body: SchedulerResponse = srv.post_json(&admin, "/api/ai/scheduler", json!({"action": "stop"})).await.json().await.unwrap();
    assert!(body.success);
    assert!(!body.status.running);
}

#[tokio::test]
async fn stop_lets_running_pass_finish() {
    let (url, mock) = spawn_mock().await;
    mock.set_delay(1500);
    let srv = start_server_with(Some(&url), |cfg| {
        cfg.scheduler_interval_secs = 1;
        cfg.scheduler_start_delay_secs = 0;
    })
    .await;
    let (admin, _) = srv.register(ADMIN_EMAIL, "Admin").await;
    let (student, _) = srv.register("s@uni.edu", "Student").await;
    let conv = srv.ask_assistant(&student, "Where is the visa office?").await;

    let body: SchedulerResponse = srv.post_json(&admin, "/api/ai/scheduler", json!({"action": "start"})).await.json().await.unwrap();
    assert!(body.success);

    // Wait until the provider has the request, i.e. a pass is mid-flight.
    for _ in 0..50 {
        if !mock.requests().is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert_eq!(mock.requests().len(), 1);

    let body: SchedulerResponse = srv.post_json(&admin, "/api/ai/scheduler", json!({"action": "stop"})).await.json().await.unwrap();
    assert!(body.success);
    assert!(!body.status.running);
    assert!(body.status.processing);

    let msgs = wait_for_messages(&srv, &student, &conv.id, 2).await;
    assert_eq!(msgs[1].sender_id, AI_ASSISTANT_UID);
    let status: SchedulerStatus = srv.get_json(&student, "/api/ai/scheduler").await;
    assert!(!status.running);
    assert_eq!(status.last_report, Some(ProcessReport { claimed: 1, completed: 1, failed: 0 }));
}

// ── Content generation ─────────────────────────────────────────────────

#[tokio::test]
async fn generate_content_and_publish() {
    let (url, mock) = spawn_mock().await;
    let srv = start_server(Some(&url)).await;
    let (admin, _) = srv.register(ADMIN_EMAIL, "Admin").await;
    let (student, _) = srv.register("s@uni.edu", "Student").await;
    mock.set(
        200,
        "```json\n{\"title\": \"Five cheap eats near campus\", \"content\": \"1. The noodle bar...\", \"tags\": [\"food\", \"budget\"]}\n```",
    );

    let resp = srv
        .post_json(&student, "/api/ai/generate-content-gpt", json!({"topic": "cheap food", "category": "food"}))
        .await;
    assert_eq!(resp.status(), StatusCode::OK);
    let generated: GeneratedContent = resp.json().await.unwrap();
    assert_eq!(generated.title, "Five cheap eats near campus");
    assert_eq!(generated.tags, ["food", "budget"]);
    assert!(generated.post.is_none());
    assert_eq!(mock.requests()[0]["model"], "gpt-4o-mini");

    let resp = srv
        .post_json(&student, "/api/ai/generate-content-gpt", json!({"topic": "cheap food", "publish": true}))
        .await;
    assert_eq!(resp.status(), StatusCode::FORBIDDEN);

    let generated: GeneratedContent = srv
        .post_json(&admin, "/api/ai/generate-content-gpt", json!({"topic": "cheap food", "category": "food", "publish": true}))
        .await
        .json()
        .await
        .unwrap();
    let post = generated.post.expect("published post");
    assert!(post.ai_generated);
    assert_eq!(post.author_id, AI_ASSISTANT_UID);

    let food: Vec<Post> = srv.get_json(&student, "/api/posts?category=food").await;
    assert_eq!(food.len(), 1);
    assert_eq!(food[0].id, post.id);

    let resp = srv.post_json(&student, "/api/ai/generate-content-gpt", json!({"topic": " "})).await;
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
}
