use clap::Parser;

/// Server configuration. Every flag can also be set through its environment
/// variable.
#[derive(Parser, Debug, Clone)]
#[command(name = "campus-server", about = "Campus community API server")]
pub struct ServerConfig {
    /// Address to listen on for HTTP.
    #[arg(long, env = "CAMPUS_LISTEN_ADDR", default_value = "0.0.0.0:8080")]
    pub listen_addr: String,

    /// Path to the SQLite database file. Omit for an in-memory database.
    #[arg(long, env = "CAMPUS_DB_PATH")]
    pub db_path: Option<String>,

    /// Directory uploaded images are written to.
    #[arg(long, env = "CAMPUS_UPLOAD_DIR", default_value = "./uploads")]
    pub upload_dir: String,

    /// Externally reachable base URL, used to build upload URLs.
    #[arg(long, env = "CAMPUS_PUBLIC_URL", default_value = "http://localhost:8080")]
    pub public_url: String,

    /// Largest accepted upload in bytes.
    #[arg(long, env = "CAMPUS_MAX_UPLOAD_BYTES", default_value_t = 10 * 1024 * 1024)]
    pub max_upload_bytes: usize,

    /// Session lifetime in days.
    #[arg(long, env = "CAMPUS_SESSION_TTL_DAYS", default_value_t = 30)]
    pub session_ttl_days: u64,

    /// Base64-encoded 32-byte key for encrypting message content at rest.
    #[arg(long, env = "CAMPUS_MESSAGE_KEY")]
    pub message_key: Option<String>,

    /// DeepSeek API key (chat proxy and conversation replies).
    #[arg(long, env = "DEEPSEEK_API_KEY")]
    pub deepseek_api_key: Option<String>,

    #[arg(long, env = "DEEPSEEK_BASE_URL", default_value = "https://api.deepseek.com")]
    pub deepseek_base_url: String,

    #[arg(long, env = "DEEPSEEK_MODEL", default_value = "deepseek-chat")]
    pub deepseek_model: String,

    /// OpenAI API key (content generation).
    #[arg(long, env = "OPENAI_API_KEY")]
    pub openai_api_key: Option<String>,

    #[arg(long, env = "OPENAI_BASE_URL", default_value = "https://api.openai.com/v1")]
    pub openai_base_url: String,

    #[arg(long, env = "OPENAI_MODEL", default_value = "gpt-4o-mini")]
    pub openai_model: String,

    /// Start the AI reply scheduler when the server boots.
    #[arg(long, env = "CAMPUS_SCHEDULER_AUTOSTART")]
    pub scheduler_autostart: bool,

    /// Seconds between scheduler passes.
    #[arg(long, env = "CAMPUS_SCHEDULER_INTERVAL_SECS", default_value_t = 30)]
    pub scheduler_interval_secs: u64,

    /// Seconds to wait after `start` before the first pass.
    #[arg(long, env = "CAMPUS_SCHEDULER_START_DELAY_SECS", default_value_t = 5)]
    pub scheduler_start_delay_secs: u64,

    /// Maximum tasks claimed per pass.
    #[arg(long, env = "CAMPUS_SCHEDULER_BATCH_SIZE", default_value_t = 10)]
    pub scheduler_batch_size: usize,

    /// Number of recent messages sent to the model as conversation context.
    #[arg(long, env = "CAMPUS_AI_CONTEXT_MESSAGES", default_value_t = 20)]
    pub ai_context_messages: usize,

    /// Comma-separated emails of administrator accounts.
    #[arg(long, env = "CAMPUS_ADMIN_EMAILS", value_delimiter = ',')]
    pub admin_emails: Vec<String>,

    /// Comma-separated allowed CORS origins. Empty allows any origin.
    #[arg(long, env = "CAMPUS_CORS_ORIGINS", value_delimiter = ',')]
    pub cors_origins: Vec<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:8080".to_string(),
            db_path: None,
            upload_dir: "./uploads".to_string(),
            public_url: "http://localhost:8080".to_string(),
            max_upload_bytes: 10 * 1024 * 1024,
            session_ttl_days: 30,
            message_key: None,
            deepseek_api_key: None,
            deepseek_base_url: "https://api.deepseek.com".to_string(),
            deepseek_model: "deepseek-chat".to_string(),
            openai_api_key: None,
            openai_base_url: "https://api.openai.com/v1".to_string(),
            openai_model: "gpt-4o-mini".to_string(),
            scheduler_autostart: false,
            scheduler_interval_secs: 30,
            scheduler_start_delay_secs: 5,
            scheduler_batch_size: 10,
            ai_context_messages: 20,
            admin_emails: Vec::new(),
            cors_origins: Vec::new(),
        }
    }
}

impl ServerConfig {
    pub fn is_admin_email(&self, email: &str) -> bool {
        self.admin_emails
            .iter()
            .any(|a| !a.trim().is_empty() && a.trim().eq_ignore_ascii_case(email))
    }

    /// Decode `message_key`, if set. Errors when the key is not 32 bytes of base64.
    pub fn message_key_bytes(&self) -> anyhow::Result<Option<[u8; 32]>> {
        use base64::Engine;

        let Some(encoded) = self.message_key.as_deref().filter(|k| !k.is_empty()) else {
            return Ok(None);
        };
        let raw = base64::engine::general_purpose::STANDARD
            .decode(encoded.trim())
            .map_err(|e| anyhow::anyhow!("CAMPUS_MESSAGE_KEY is not valid base64: {e}"))?;
        let key: [u8; 32] = raw
            .try_into()
            .map_err(|v: Vec<u8>| anyhow::anyhow!("CAMPUS_MESSAGE_KEY must be 32 bytes, got {}", v.len()))?;
        Ok(Some(key))
    }

    pub fn session_ttl_ms(&self) -> i64 {
        (self.session_ttl_days as i64) * 24 * 60 * 60 * 1000
    }
}
