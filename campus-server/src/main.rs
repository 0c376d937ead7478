use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    // JSON logs in production (CAMPUS_LOG_JSON=1), human-readable otherwise
    let json_logs = std::env::var("CAMPUS_LOG_JSON").unwrap_or_default() == "1";
    let filter = EnvFilter::from_default_env().add_directive("campus_server=info".parse()?);
    if json_logs {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    let config = campus_server::config::ServerConfig::parse();
    tracing::info!("Starting campus server on {}", config.listen_addr);
    if let Some(ref path) = config.db_path {
        tracing::info!("Database: {path}");
    }
    tracing::info!("Uploads stored in {}", config.upload_dir);
    if config.scheduler_autostart {
        tracing::info!(
            "AI scheduler autostart: every {}s after {}s",
            config.scheduler_interval_secs,
            config.scheduler_start_delay_secs
        );
    }

    let server = campus_server::server::Server::new(config);
    server.run().await
}
