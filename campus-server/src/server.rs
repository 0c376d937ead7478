use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use parking_lot::Mutex;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

use campus_sdk::llm::{LlmClient, Provider};

use crate::config::ServerConfig;
use crate::db::Db;
use crate::error::ApiResult;
use crate::scheduler::AiScheduler;
use crate::storage::UploadStore;

/// How often expired sessions are purged.
const SESSION_PURGE_INTERVAL: Duration = Duration::from_secs(60 * 60);

/// Shared state accessible by all request handlers.
pub struct SharedState {
    pub db: Mutex<Db>,
    pub config: ServerConfig,
    pub uploads: UploadStore,
    /// Chat replies and the chat proxy. None = no API key configured.
    pub deepseek: Option<LlmClient>,
    /// Content generation. None = no API key configured.
    pub openai: Option<LlmClient>,
    pub scheduler: AiScheduler,
}

impl SharedState {
    /// Run a closure with the database. The lock is held only for the
    /// closure, so never call this across an `.await`.
    pub fn with_db<F, R>(&self, f: F) -> ApiResult<R>
    where
        F: FnOnce(&Db) -> rusqlite::Result<R>,
    {
        let db = self.db.lock();
        Ok(f(&db)?)
    }
}

fn llm_client(provider: Provider, key: Option<&str>, base_url: &str, model: &str) -> Option<LlmClient> {
    let key = key.map(str::trim).filter(|k| !k.is_empty())?;
    Some(LlmClient::new(provider, key).with_base_url(base_url).with_model(model))
}

pub struct Server {
    config: ServerConfig,
}

impl Server {
    pub fn new(config: ServerConfig) -> Self {
        Self { config }
    }

    /// Build SharedState: open the database, wire the LLM clients, and set up
    /// upload storage and the scheduler.
    pub fn build_state(&self) -> Result<Arc<SharedState>> {
        let key = self.config.message_key_bytes()?;
        if key.is_some() {
            tracing::info!("Message encryption at rest enabled");
        }
        let db = match (&self.config.db_path, key) {
            (Some(path), Some(key)) => {
                tracing::info!("Opening database: {path}");
                Db::open_encrypted(path, key)
            }
            (Some(path), None) => {
                tracing::info!("Opening database: {path}");
                Db::open(path)
            }
            (None, key) => {
                tracing::warn!("No --db-path given; using an in-memory database");
                Db::open_memory().map(|mut db| {
                    db.set_encryption_key(key);
                    db
                })
            }
        }
        .map_err(|e| anyhow::anyhow!("Failed to open database: {e}"))?;

        // A crash mid-pass leaves tasks in `processing`; give them another go.
        let requeued = db
            .requeue_processing_ai_tasks()
            .map_err(|e| anyhow::anyhow!("Failed to requeue AI tasks: {e}"))?;
        if requeued > 0 {
            tracing::info!("Requeued {requeued} interrupted AI tasks");
        }

        let cfg = &self.config;
        let deepseek = llm_client(
            Provider::DeepSeek,
            cfg.deepseek_api_key.as_deref(),
            &cfg.deepseek_base_url,
            &cfg.deepseek_model,
        );
        let openai = llm_client(
            Provider::OpenAi,
            cfg.openai_api_key.as_deref(),
            &cfg.openai_base_url,
            &cfg.openai_model,
        );
        if deepseek.is_none() {
            tracing::warn!("DEEPSEEK_API_KEY not set; AI chat endpoints will return 503");
        }
        if openai.is_none() {
            tracing::warn!("OPENAI_API_KEY not set; content generation will return 503");
        }

        Ok(Arc::new(SharedState {
            db: Mutex::new(db),
            uploads: UploadStore::new(&cfg.upload_dir, &cfg.public_url, cfg.max_upload_bytes),
            deepseek,
            openai,
            scheduler: AiScheduler::new(
                Duration::from_secs(cfg.scheduler_interval_secs),
                Duration::from_secs(cfg.scheduler_start_delay_secs),
            ),
            config: self.config.clone(),
        }))
    }

    fn spawn_background(state: &Arc<SharedState>) {
        if state.config.scheduler_autostart {
            state.scheduler.start(Arc::clone(state));
        }

        let purge_state = Arc::clone(state);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(SESSION_PURGE_INTERVAL);
            loop {
                interval.tick().await;
                let now = crate::ids::now_ms() as i64;
                match purge_state.with_db(|db| db.purge_expired_sessions(now)) {
                    Ok(0) => {}
                    Ok(n) => tracing::info!("Purged {n} expired sessions"),
                    Err(e) => tracing::error!("Session purge failed: {e}"),
                }
            }
        });
    }

    /// Run the server, blocking forever.
    pub async fn run(self) -> Result<()> {
        let state = self.build_state()?;
        let listener = TcpListener::bind(&self.config.listen_addr).await?;
        tracing::info!("HTTP listener on {}", listener.local_addr()?);
        Self::spawn_background(&state);

        let router = crate::web::router(state);
        axum::serve(listener, router).await?;
        Ok(())
    }

    /// Start the server and return the bound address + task handle (for testing).
    pub async fn start(self) -> Result<(SocketAddr, JoinHandle<Result<()>>)> {
        let state = self.build_state()?;
        self.start_with_state(state).await
    }

    /// Like [`Server::start`], but with a prepared state (tests seed data
    /// through it).
    pub async fn start_with_state(
        self,
        state: Arc<SharedState>,
    ) -> Result<(SocketAddr, JoinHandle<Result<()>>)> {
        let listener = TcpListener::bind(&self.config.listen_addr).await?;
        let addr = listener.local_addr()?;
        tracing::info!("Listening on {addr}");
        Self::spawn_background(&state);

        let router = crate::web::router(state);
        let handle = tokio::spawn(async move {
            axum::serve(listener, router).await?;
            Ok(())
        });
        Ok((addr, handle))
    }
}
