//! ai-agent-server - HTTP Server Entry Point
//!
//! Loads configuration, wires the pipeline and serves the task API.

use ai_agent_server::{api, config::Config};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

fn main() -> anyhow::Result<()> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    runtime.block_on(async_main())
}

async fn async_main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "ai_agent_server=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env()?;
    info!(
        "Loaded configuration: engines={}, task_store={:?}, bus={:?}, nack_policy={:?}",
        config.engines_path.display(),
        config.task_store,
        config.bus_backend,
        config.nack_policy
    );
    if config.openai_api_key.is_none() {
        info!("OPENAI_API_KEY not set; api engines will report as inactive");
    }

    info!("Starting server on {}:{}", config.host, config.port);
    api::serve(config).await?;

    Ok(())
}
