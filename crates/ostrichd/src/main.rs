#![forbid(unsafe_code)]

use anyhow::Result;
use clap::Parser;
use ostrichd::config::{Args, ServerConfig, VerificationMode};
use ostrichd::external::{AdmissionService, HttpAdmissionService};
use ostrichd::identity::{HttpResolver, IdentityResolver};
use ostrichd::metrics::{start_metrics_server, HealthState};
use ostrichd::payment::{LnbitsProcessor, PaymentProcessor};
use ostrichd::server::{Collaborators, ServerState};
use ostrichd::storage::{EventStore, MemoryStore, SqliteStore};
use ostrichd::run_with_shutdown;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const RESOLVER_TIMEOUT: Duration = Duration::from_secs(10);
const PROCESSOR_TIMEOUT: Duration = Duration::from_secs(15);

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    let config: ServerConfig = args.into();

    if let Err(e) = config.validate() {
        anyhow::bail!("configuration error: {}", e);
    }

    let store: Arc<dyn EventStore> = if config.database == "memory" {
        warn!("using in-memory store (not persisted)");
        Arc::new(MemoryStore::new())
    } else {
        Arc::new(SqliteStore::open(&config.database, config.reader_pool_size).await?)
    };

    let resolver: Option<Arc<dyn IdentityResolver>> =
        if config.policy.identity.mode == VerificationMode::Disabled {
            None
        } else {
            Some(Arc::new(HttpResolver::new(RESOLVER_TIMEOUT)?))
        };
    let admission_service: Option<Arc<dyn AdmissionService>> = match &config.admission_url {
        Some(url) => Some(Arc::new(HttpAdmissionService::new(
            url,
            Duration::from_millis(config.admission_timeout_ms),
        )?)),
        None => None,
    };

    let payment_processor: Option<Arc<dyn PaymentProcessor>> = match &config.processor {
        Some(processor) => Some(Arc::new(LnbitsProcessor::new(processor, PROCESSOR_TIMEOUT)?)),
        None => None,
    };

    info!(limitation = ?config.limitation(), "relay limits");

    let health_state = HealthState::new();
    let (state, background) = ServerState::build(
        config.clone(),
        store,
        Collaborators {
            resolver,
            admission_service,
            payment_processor,
            health: health_state.clone(),
        },
    );

    let listener = TcpListener::bind(config.listen).await?;
    info!("bound to {}", config.listen);

    tokio::spawn({
        let health_state = health_state.clone();
        let signups = state.signups.clone();
        async move {
            if let Err(e) = start_metrics_server(config.metrics_addr, health_state, signups).await {
                warn!("metrics server error: {}", e);
            }
        }
    });

    let (shutdown_tx, shutdown_rx) = watch::channel(());
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("received shutdown signal"),
            Err(e) => {
                warn!("cannot listen for shutdown signal: {}", e);
                std::future::pending::<()>().await;
            }
        }
        let _ = shutdown_tx.send(());
    });

    let result = run_with_shutdown(listener, state, shutdown_rx).await;
    background.shutdown().await;
    result?;
    Ok(())
}
