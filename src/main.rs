//! txpilot service - transaction lifecycle engine behind an HTTP API
//!
//! Submits transactions for one chain, watches them to confirmation and
//! resumes in-flight records after a restart.

use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tracing::{error, info, warn};

use txpilot::api;
use txpilot::chain::{EthersLedger, SharedLedger};
use txpilot::config::Settings;
use txpilot::metrics::{self, MetricsServer};
use txpilot::state::{MemoryRecordStore, PgRecordStore, RecordStore};
use txpilot::tx::{LocalSigner, Signers};
use txpilot::{EngineOptions, TxEngine};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    init_logging();

    info!("Starting txpilot v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let settings = Settings::load()?;
    info!(
        "Loaded configuration for chain {} ({})",
        settings.chain.chain_id, settings.engine.instance_id
    );

    // Record store: PostgreSQL when configured, memory otherwise
    let store: Arc<dyn RecordStore> = match &settings.database {
        Some(database) => {
            let store = PgRecordStore::new(database).await?;
            info!("Database connection established");
            store.run_migrations().await?;
            Arc::new(store)
        }
        None => {
            warn!("No [database] configured, records will not survive a restart");
            Arc::new(MemoryRecordStore::new())
        }
    };

    let client: SharedLedger = Arc::new(EthersLedger::new(&settings.chain)?);
    let signer = LocalSigner::from_env(&settings.wallet.private_key_env)?;
    let signers = Signers::new(Arc::new(signer));

    let engine = Arc::new(TxEngine::new(
        client,
        signers,
        store,
        EngineOptions::from_settings(&settings)?,
    ));
    info!("Transaction engine initialized");

    // Resume whatever was in flight when we last stopped
    let recovered = engine.recover().await?;
    if !recovered.is_empty() {
        info!("Resumed {} watches", recovered.len());
    }

    // Start API server
    let api_handle = tokio::spawn({
        let config = settings.api.clone();
        let engine = engine.clone();
        async move {
            if let Err(e) = api::run_server(config, engine).await {
                error!("API server error: {}", e);
            }
        }
    });

    // Start metrics server
    let metrics_handle = if settings.metrics.enabled {
        let server = MetricsServer::new(settings.metrics.port);
        Some(tokio::spawn(async move {
            if let Err(e) = server.run().await {
                error!("Metrics server error: {}", e);
            }
        }))
    } else {
        None
    };

    let purge_handle =
        engine.spawn_cache_purge(Duration::from_secs(settings.cache.purge_interval_secs));

    // Health check loop
    let health_handle = tokio::spawn({
        let engine = engine.clone();
        async move {
            loop {
                tokio::time::sleep(Duration::from_secs(30)).await;

                match engine.health_check().await {
                    Ok(_) => metrics::record_health_check(true),
                    Err(e) => {
                        warn!("Health check failed: {}", e);
                        metrics::record_health_check(false);
                    }
                }
            }
        }
    });

    info!("txpilot is running");
    info!("API server: http://{}:{}", settings.api.host, settings.api.port);
    if settings.metrics.enabled {
        info!("Metrics: http://0.0.0.0:{}/metrics", settings.metrics.port);
    }

    // Wait for shutdown signal
    shutdown_signal().await;

    info!("Shutdown signal received, stopping...");

    // Watches stop locally; records stay in the store for the next start
    engine.stop_all();
    for handle in recovered {
        let _ = handle.wait().await;
    }

    api_handle.abort();
    purge_handle.abort();
    health_handle.abort();
    if let Some(h) = metrics_handle {
        h.abort();
    }

    info!("txpilot stopped");
    Ok(())
}

fn init_logging() {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,txpilot=debug,sqlx=warn,hyper=warn"));

    let json = std::env::var("TXPILOT_LOG_JSON").map_or(false, |v| v == "1" || v == "true");
    if json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_target(true).with_thread_ids(true))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true).with_thread_ids(true))
            .init();
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
