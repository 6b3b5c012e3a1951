//! Oracle transaction manager
//!
//! Keeps a gas price estimate for one EVM chain and drives submitted
//! transactions through broadcast, gas bumping and confirmation.

use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tracing::{error, info, warn};

use oracle_txm::chain::{ChainClient, EthersChainClient};
use oracle_txm::config::{LogFormat, Settings};
use oracle_txm::gas::{DataAvailabilityPriceSource, GasEstimator};
use oracle_txm::keystore::{KeyStore, WalletKeyStore};
use oracle_txm::metrics::MetricsServer;
use oracle_txm::state::{InMemoryTxStore, PgTxStore, TxStore};
use oracle_txm::tx::TransactionManager;

const DB_HEALTH_CHECK_INTERVAL: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let settings = Settings::load()?;

    // Initialize logging
    init_logging(settings.logging.format);

    info!("Starting oracle-txm v{}", env!("CARGO_PKG_VERSION"));
    info!(
        "Loaded configuration for chain {} ({})",
        settings.node.name, settings.node.chain_id
    );

    let client: Arc<dyn ChainClient> = Arc::new(EthersChainClient::new(&settings.node)?);
    let keystore: Arc<dyn KeyStore> =
        Arc::new(WalletKeyStore::from_env(&settings.wallet.private_key_env)?);

    // Initialize transaction store
    let mut db_health_handle = None;
    let store: Arc<dyn TxStore> = match &settings.database {
        Some(db_config) => {
            let store = Arc::new(PgTxStore::new(db_config).await?);
            info!("Database connection established");

            store.run_migrations().await?;
            info!("Database migrations complete");

            db_health_handle = Some(tokio::spawn({
                let store = store.clone();
                async move {
                    loop {
                        tokio::time::sleep(DB_HEALTH_CHECK_INTERVAL).await;
                        if let Err(e) = store.health_check().await {
                            warn!("Database health check failed: {}", e);
                        }
                    }
                }
            }));
            store as Arc<dyn TxStore>
        }
        None => {
            warn!("Using in-memory transaction store");
            Arc::new(InMemoryTxStore::new())
        }
    };

    // Initialize gas estimator
    let da_source = settings
        .da_oracle
        .as_ref()
        .map(|da| DataAvailabilityPriceSource::new(client.clone(), da))
        .transpose()?;
    let estimator = Arc::new(GasEstimator::new(
        client.clone(),
        settings.gas_estimator.clone(),
        settings.txm.gas_bump_threshold,
        da_source,
    ));
    let estimator_handle = estimator.start();

    // Initialize transaction manager
    let manager = TransactionManager::new(
        client.clone(),
        store,
        keystore,
        estimator.clone(),
        &settings.txm,
    );
    let tracker = manager.tracker();
    let tracker_handle = tracker.start();

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

    match manager.balance().await {
        Ok(balance) => info!(
            "Signing account {:?} balance {} wei",
            manager.account().address,
            balance
        ),
        Err(e) => warn!("Could not read signing account balance: {}", e),
    }

    info!("oracle-txm is running");
    if settings.metrics.enabled {
        info!("Metrics: http://0.0.0.0:{}/metrics", settings.metrics.port);
    }

    // Wait for shutdown signal
    shutdown_signal().await;

    info!("Shutdown signal received, stopping...");

    // Graceful shutdown
    tracker.stop();
    estimator.stop();
    if let Err(e) = tracker_handle.await {
        error!("Confirmation tracker task failed: {}", e);
    }
    if let Err(e) = estimator_handle.await {
        error!("Gas estimator task failed: {}", e);
    }

    // Abort background tasks
    if let Some(h) = metrics_handle {
        h.abort();
    }
    if let Some(h) = db_health_handle {
        h.abort();
    }

    info!("oracle-txm stopped");
    Ok(())
}

fn init_logging(format: LogFormat) {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,oracle_txm=debug,sqlx=warn,hyper=warn"));

    let registry = tracing_subscriber::registry().with(filter);
    match format {
        LogFormat::Json => registry.with(fmt::layer().json()).init(),
        LogFormat::Pretty => registry
            .with(fmt::layer().with_target(true).with_thread_ids(true))
            .init(),
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
