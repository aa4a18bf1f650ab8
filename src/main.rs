use dotenv::dotenv;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use api_rate_limiter::cache_stats::{CacheRegistry, CacheStatisticsReporter};
use api_rate_limiter::code_cache::{
    CodeCacheService, CodeLoader, JsonFileCodeLoader, StaticCodeLoader,
};
use api_rate_limiter::config::{AppConfig, StorageKind};
use api_rate_limiter::http::{self, AppState, RateLimitingService};
use api_rate_limiter::storage::{MemoryStorage, RedisStorage, StorageBackend};
use api_rate_limiter::{init_logging, ApiRateLimiter, Result};

#[tokio::main]
async fn main() {
    dotenv().ok();
    init_logging();
    info!("Rate limiter starting up");

    if let Err(e) = start().await {
        error!(error = %e, "Rate limiter stopped with an error");
        std::process::exit(1);
    }
}

async fn start() -> Result<()> {
    let config = AppConfig::from_env()?;
    debug!(?config, "Configuration loaded");

    match config.storage {
        StorageKind::Memory => {
            let storage = MemoryStorage::new(config.memory.clone());
            run(storage, &config).await
        }
        StorageKind::Redis => {
            let storage = RedisStorage::new(config.redis.clone()).await?;
            storage.ping().await?;
            info!(url = %config.redis.url, table = %config.redis.table.table, "Connected to Redis");
            run(storage, &config).await
        }
    }
}

async fn run<S>(storage: S, config: &AppConfig) -> Result<()>
where
    S: StorageBackend + 'static,
{
    let limiter = Arc::new(ApiRateLimiter::new(storage, &config.limiter)?);

    let loader: Arc<dyn CodeLoader> = match &config.server.code_table_path {
        Some(path) => Arc::new(JsonFileCodeLoader::new(path)),
        None => {
            warn!("CODE_TABLE_PATH is not set, the code cache starts empty");
            Arc::new(StaticCodeLoader::default())
        }
    };
    let codes = Arc::new(CodeCacheService::new(loader));
    if let Err(e) = codes.ensure_loaded().await {
        warn!(error = %e, "Code table not loaded, retrying on first lookup");
    }

    let registry = Arc::new(CacheRegistry::new());
    registry.register("codes", &codes);
    registry.register("rateLimitBuckets", limiter.proxies());

    info!(
        capacity = config.limiter.capacity,
        refill_amount = config.limiter.refill_amount,
        refill_interval_ms = config.limiter.refill_interval.as_millis() as u64,
        on_storage_error = ?config.limiter.on_storage_error,
        "Rate limiter initialized"
    );

    let state = Arc::new(AppState {
        service: RateLimitingService::new(limiter),
        reporter: CacheStatisticsReporter::new(registry),
        codes,
    });

    http::serve(config.server.bind_addr, state, shutdown_signal()).await
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "Failed to listen for Ctrl-C");
        return;
    }
    info!("Shutdown signal received");
}
