use anyhow::Result;
use log::{error, info};
use std::sync::Arc;
use youtubemeter::config::{init_logger, load_environment, shutdown_signal, AppConfig};
use youtubemeter::registry::Registry;
use youtubemeter::services::collector::Collector;
use youtubemeter::services::catalog::YoutubeCatalog;
use youtubemeter::services::read_cache::ReadCache;
use youtubemeter::services::storage::SqliteStorage;
use youtubemeter::{build_rocket, AppState};

#[rocket::main]
async fn main() -> Result<()> {
    load_environment();
    let config = AppConfig::from_env()?;
    init_logger(config.log_level);

    let storage = Arc::new(
        SqliteStorage::connect(&config.database_url, config.database_max_connections).await?,
    );
    storage.migrate().await?;
    let registry = Arc::new(Registry::new());

    let collector = if config.run_collector {
        let catalog = Arc::new(YoutubeCatalog::new(
            &config.youtube_api_key,
            config.catalog_discovery,
            config.collector.period_collection,
            config.catalog_timeout,
        )?);
        Some(
            Collector::start(
                registry.clone(),
                storage.clone(),
                catalog,
                config.collector.clone(),
            )
            .await?,
        )
    } else {
        info!("Collector disabled");
        None
    };

    if config.run_api {
        let cache = Arc::new(ReadCache::new(storage.clone(), config.cache.clone()));
        let state = AppState {
            config: config.clone(),
            storage: storage.clone(),
            cache,
            registry,
        };
        // Rocket handles Ctrl-C and SIGTERM itself and returns once its
        // graceful shutdown is over.
        if let Err(e) = build_rocket(state)?.launch().await {
            error!("HTTP server stopped with error: {e}");
        }
    } else {
        info!("HTTP API disabled");
        shutdown_signal().await;
    }

    if let Some(collector) = collector {
        collector.shutdown().await;
    }
    storage.close().await;
    info!("Bye");
    Ok(())
}
