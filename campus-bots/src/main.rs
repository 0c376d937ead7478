//! campus-bots: publishes an AI-written post on a fixed interval, rotating
//! through forum categories.
//!
//! Without `--api-key` drafts come from the server's content generator;
//! with one the bot calls the LLM provider itself.

use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use campus_sdk::client::ApiClient;
use campus_sdk::llm::{LlmClient, Provider};

use campus_bots::autopost::{self, AutoPoster};

#[derive(Parser)]
#[command(name = "campus-bots", about = "Auto-posting bot for the campus server")]
struct Args {
    /// Campus server base URL
    #[arg(long, env = "CAMPUS_SERVER_URL", default_value = "http://localhost:8080")]
    server_url: String,

    /// Bot account email
    #[arg(long, env = "CAMPUS_BOT_EMAIL", default_value = "autopost@campus.bot")]
    email: String,

    /// Bot account password
    #[arg(long, env = "CAMPUS_BOT_PASSWORD")]
    password: Option<String>,

    /// Existing session token; skips login
    #[arg(long, env = "CAMPUS_BOT_TOKEN")]
    token: Option<String>,

    /// Display name used when the account is created
    #[arg(long, default_value = "Campus Bot")]
    display_name: String,

    /// LLM provider for direct drafting (deepseek or openai)
    #[arg(long, default_value = "openai")]
    provider: Provider,

    /// Provider API key; when absent the server generates drafts
    #[arg(long, env = "CAMPUS_BOT_API_KEY")]
    api_key: Option<String>,

    /// Override the provider's model
    #[arg(long)]
    model: Option<String>,

    /// Seconds between posts
    #[arg(long, default_value_t = 3600)]
    interval_secs: u64,

    /// Category slugs to rotate through (default: all)
    #[arg(long, value_delimiter = ',')]
    categories: Vec<String>,

    /// Publish a single post and exit
    #[arg(long)]
    once: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "campus_bots=info".into()),
        )
        .init();

    let args = Args::parse();

    let mut api = ApiClient::new(&args.server_url);
    let me = match args.token.clone() {
        Some(token) => {
            api = api.with_token(token);
            api.me().await.context("session token rejected")?
        }
        None => {
            let password = args.password.as_deref().context("either --token or --password is required")?;
            autopost::ensure_session(&mut api, &args.email, password, &args.display_name).await?
        }
    };
    tracing::info!(server = %args.server_url, uid = %me.uid, "Logged in");

    let llm = args.api_key.clone().map(|key| {
        let client = LlmClient::new(args.provider, key);
        match &args.model {
            Some(model) => client.with_model(model),
            None => client,
        }
    });
    let mut bot = AutoPoster::new(api, llm, args.categories.clone());
    bot.load_categories().await?;
    tracing::info!(categories = %bot.categories().join(","), "Category rotation");

    if args.once {
        bot.post_once().await?;
        return Ok(());
    }

    tracing::info!(interval_secs = args.interval_secs, "Bot running. Ctrl+C to stop.");
    let mut ticker = tokio::time::interval(Duration::from_secs(args.interval_secs.max(1)));
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if let Err(e) = bot.post_once().await {
                    tracing::warn!("Post round failed: {e:#}");
                }
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Shutting down");
                return Ok(());
            }
        }
    }
}
