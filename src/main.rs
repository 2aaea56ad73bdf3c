use std::sync::Arc;

use rmcp::{ServiceExt, transport::stdio};

use review_on_save::config::ConfigStore;
use review_on_save::server::ReviewServer;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .init();

    // MCP servers may start with any CWD: prefer a .env next to the binary.
    match std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(|dir| dir.join(".env")))
    {
        Some(env_path) if env_path.exists() => {
            dotenvy::from_path(&env_path).ok();
        }
        _ => {
            dotenvy::dotenv().ok();
        }
    }

    tracing::info!("review-on-save starting");

    let config = Arc::new(ConfigStore::load()?);
    tracing::info!(?config, "configuration loaded");
    let server = ReviewServer::new(config)?;

    let service = server
        .serve(stdio())
        .await
        .inspect_err(|e| tracing::error!("serving error: {e:?}"))?;

    service.waiting().await?;

    tracing::info!("review-on-save shutting down");
    Ok(())
}
