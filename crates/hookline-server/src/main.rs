//! Hookline - Campaign delivery server entry point

use anyhow::{bail, Result};
use hookline_api::AppState;
use hookline_common::config::{Config, LoggingConfig};
use hookline_core::jobs::JobManager;
use hookline_core::{
    BulkImporter, CampaignManager, DeliveryWorker, HttpStopHook, NoopStopHook, RedirectCipher,
    SmtpTransport, StopHook, TwilioSmsTransport,
};
use hookline_storage::repository::{
    CampaignRepository, CampaignStore, DeliveryUnitRepository, DeliveryUnitStore, GroupRepository,
    GroupStore,
};
use hookline_storage::{DatabasePool, MemoryStore};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Store handles for the configured backend
struct Stores {
    units: Arc<dyn DeliveryUnitStore>,
    campaigns: Arc<dyn CampaignStore>,
    groups: Arc<dyn GroupStore>,
    db_pool: Option<DatabasePool>,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging
    init_logging(&config.logging);

    info!("Starting Hookline server...");

    let stores = open_stores(&config).await?;

    let cipher = RedirectCipher::new(config.tracking.redirect_key.as_bytes())?;

    // Scheduled-stop hook
    let stop_hook: Arc<dyn StopHook> = match &config.stop_hook.url {
        Some(url) => {
            info!("Scheduled-stop hook posting to {}", url);
            Arc::new(HttpStopHook::new(
                url.clone(),
                Duration::from_secs(config.stop_hook.timeout_secs),
            )?)
        }
        None => Arc::new(NoopStopHook),
    };

    // Initialize delivery worker
    let worker = Arc::new(
        DeliveryWorker::new(
            stores.units.clone(),
            stores.campaigns.clone(),
            Arc::new(SmtpTransport::new(config.server.hostname.clone())),
            Arc::new(TwilioSmsTransport::new(config.sms.api_base.clone())),
            cipher.clone(),
        )
        .with_stop_hook(stop_hook)
        .with_max_concurrent_groups(config.worker.max_concurrent_groups)
        .with_poll_interval(config.worker.poll_interval_secs)
        .with_max_send_attempts(config.worker.max_send_attempts),
    );

    // Initialize bulk importer
    tokio::fs::create_dir_all(&config.import.upload_dir).await?;
    let importer = Arc::new(BulkImporter::new(
        stores.groups.clone(),
        Arc::new(JobManager::new()),
        config.import.clone(),
    ));

    let campaigns = Arc::new(CampaignManager::new(
        stores.campaigns.clone(),
        stores.groups.clone(),
        cipher,
    ));

    if config.api.keys.is_empty() {
        warn!("No API keys configured, every API request will be rejected");
    }

    let shutdown = CancellationToken::new();

    // Start delivery worker
    let worker_handle = tokio::spawn(worker.clone().run(shutdown.clone()));

    // Start API server
    let api_handle = {
        let state = AppState {
            campaigns,
            store: stores.campaigns.clone(),
            worker,
            importer,
            api_keys: config.api.keys.clone(),
            db_pool: stores.db_pool.clone(),
        };
        let app = hookline_api::create_router(state, config.api.max_upload_bytes);
        let addr = format!("{}:{}", config.server.bind_address, config.api.port);
        let listener = tokio::net::TcpListener::bind(&addr).await?;
        info!("Starting API server on {}", addr);

        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app)
                .with_graceful_shutdown(shutdown.cancelled_owned())
                .await
            {
                error!("API server error: {}", e);
            }
        })
    };

    info!("Hookline server started successfully");

    // Wait for shutdown signal
    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");

    shutdown.cancel();
    if let Err(e) = worker_handle.await {
        error!("Delivery worker task failed: {}", e);
    }
    if let Err(e) = api_handle.await {
        error!("API server task failed: {}", e);
    }

    info!("Hookline server shutdown complete");

    Ok(())
}

async fn open_stores(config: &Config) -> Result<Stores> {
    match config.database.backend.as_str() {
        "memory" => {
            warn!("Using in-memory store, data is lost on restart");
            let store = Arc::new(MemoryStore::new());
            Ok(Stores {
                units: store.clone(),
                campaigns: store.clone(),
                groups: store,
                db_pool: None,
            })
        }
        "postgres" => {
            let db_pool = DatabasePool::new(&config.database).await?;
            db_pool.migrate().await?;
            info!("Database ready");

            Ok(Stores {
                units: Arc::new(DeliveryUnitRepository::new(db_pool.clone())),
                campaigns: Arc::new(CampaignRepository::new(db_pool.clone())),
                groups: Arc::new(GroupRepository::new(db_pool.clone())),
                db_pool: Some(db_pool),
            })
        }
        other => bail!("Unknown database backend: {}", other),
    }
}

fn init_logging(config: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("{},hookline=debug", config.level)));

    let registry = tracing_subscriber::registry().with(filter);
    if config.format == "json" {
        registry.with(fmt::layer().json().with_target(true)).init();
    } else {
        registry
            .with(fmt::layer().with_target(true).with_level(true))
            .init();
    }
}
