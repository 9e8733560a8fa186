use gatelimit::config::loader::load_config;
use gatelimit::limiter::engine::RateLimiter;
use gatelimit::limiter::resolver::PolicyRegistry;
use gatelimit::server::ServerConfig;
use gatelimit::storage::redis::pool::create_redis_pool;
use gatelimit::storage::redis::RedisStorage;
use gatelimit::storage::Storage;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing/logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "gatelimit=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Rate Limiter Service Starting...");

    // Load and validate configuration
    let app_config = load_config()?;

    // Build the policy registry
    let registry = PolicyRegistry::new(
        app_config.limits.ip_policy,
        app_config.limits.token_policies.clone(),
    );
    let registry = Arc::new(registry);
    tracing::info!(
        "Policy registry built ({} token policies)",
        registry.token_count()
    );

    // Create Redis connection pool
    let redis_pool = create_redis_pool(&app_config.redis).await?;

    // Create Redis storage (loads the Lua script)
    let storage = RedisStorage::new(redis_pool)
        .await?
        .with_command_timeout(app_config.redis.command_timeout());
    let storage = Arc::new(storage);
    storage.health_check().await?;
    tracing::info!("Redis storage ready");

    // Create the decision engine
    let limiter = Arc::new(RateLimiter::new(storage));
    tracing::info!("Rate limiter initialized");

    // Start the HTTP server
    let server_config = ServerConfig::from_env();
    tracing::info!("Server will listen on: {}", server_config.addr());

    gatelimit::server::start_server(server_config, limiter, registry).await?;

    Ok(())
}
