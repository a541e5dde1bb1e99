mod config;
mod error;
mod server;

use std::sync::Arc;

use rmcp::{ServiceExt, transport::stdio};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use quip_core::clock::{Clock, SystemClock};
use quip_core::config::PipelineConfig;
use quip_core::entitlement::DailyAllowance;
use quip_core::generator::{CardGenerator, DebugArtifacts, GenerationClient};
use quip_core::orchestrator::Pipeline;
use quip_core::provider::{HttpProvider, ProviderConfig};
use quip_core::storage::{FileStore, KeyValueStore, MemoryStore, RedisStore};

use config::ServerConfig;
use server::QuipServer;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // stdout carries MCP JSON-RPC
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()),
        )
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .init();

    info!("starting quip-server MCP server");

    let config = ServerConfig::from_env()?;
    let pipeline_config = PipelineConfig::from_env();
    info!(
        batch_size = pipeline_config.settings.batch_size,
        categories = ?pipeline_config.settings.selected,
        tier = %pipeline_config.tier,
        redis = config.redis_url.is_some(),
        state_dir = config.state_dir.is_some(),
        "configuration loaded"
    );

    let provider_config = ProviderConfig::from_env();
    info!(
        provider = %provider_config.kind,
        base_url = %provider_config.base_url,
        model = %provider_config.model,
        timeout_ms = provider_config.default_timeout.as_millis(),
        max_retries = provider_config.max_retries,
        "provider configured"
    );
    if provider_config.api_key.is_none() {
        warn!(provider = %provider_config.kind, "no API key configured, generation will fail");
    }
    let provider = Arc::new(HttpProvider::new(provider_config).map_err(error::AppError::from)?);

    let mut client = GenerationClient::new(provider).with_max_output_tokens(pipeline_config.max_output_tokens);
    if let Some(dir) = &pipeline_config.debug_dir {
        info!(dir = %dir.display(), "malformed responses will be saved");
        client = client.with_artifacts(DebugArtifacts::new(dir));
    }
    let generator: Arc<dyn CardGenerator> = Arc::new(client);

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let store = open_store(&config).await;
    let allowance = Arc::new(DailyAllowance::load(store.clone(), clock.clone(), pipeline_config.tier).await);

    let pipeline = Pipeline::new(
        generator.clone(),
        allowance.clone(),
        store,
        clock,
        pipeline_config.settings,
    );

    // A failed first fetch is not fatal; clients see it in the view and retry.
    match pipeline.load().await {
        Ok(()) => info!(cards = pipeline.total_count(), index = pipeline.current_index(), "cards ready"),
        Err(e) => warn!(error = %e, "initial card load failed"),
    }

    let server = QuipServer::new(pipeline, generator, allowance);

    info!("MCP server ready, serving on stdio");
    let service = server.serve(stdio()).await.inspect_err(|e| {
        tracing::error!(error = %e, "MCP server error");
    })?;

    service.waiting().await?;
    info!("MCP server shut down");
    Ok(())
}

async fn open_store(config: &ServerConfig) -> Arc<dyn KeyValueStore> {
    let redis = RedisStore::new(config.redis_url.as_deref(), "");
    if redis.is_available().await {
        info!("redis connected, using redis storage");
        return Arc::new(redis);
    }
    if config.redis_url.is_some() {
        info!("redis unavailable, falling back");
    }
    match &config.state_dir {
        Some(dir) => {
            info!(dir = %dir.display(), "using file storage");
            Arc::new(FileStore::new(dir))
        }
        None => {
            info!("no durable storage configured, state is kept in memory");
            Arc::new(MemoryStore::new())
        }
    }
}
