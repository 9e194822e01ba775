use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use wps_api::build_app;
use wps_bus::{AmqpConsumer, AmqpPublisher, AuditPublisher, FailurePublisher};
use wps_config::AppConfig;
use wps_driver::{KubectlDriver, NoopDriver, StackDriver};
use wps_engine::LifecycleEngine;
use wps_store::{MemoryStore, RedisStore, StateStore};

#[derive(Debug, Parser)]
#[command(
    name = "wps-server",
    about = "Workspace provisioning orchestrator for the Secure Processing Environment",
    version
)]
struct Args {
    /// Address the read API listens on.
    #[arg(long, env = "WPS_BIND", default_value = "0.0.0.0:8000")]
    bind: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let args = Args::parse();
    let config = AppConfig::from_env()?;

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&config.logging.level)),
        )
        .with_target(false)
        .init();

    info!(service = %config.service_name, "starting workspace provisioning orchestrator");

    let store: Arc<dyn StateStore> = if config.store.url.starts_with("memory") {
        warn!("using in-memory state store; state is lost on restart");
        Arc::new(MemoryStore::new())
    } else {
        Arc::new(RedisStore::connect(&config.store.url).await?)
    };

    let driver: Arc<dyn StackDriver> = if config.disable_driver {
        warn!("stack driver disabled; no platform resources will be created");
        Arc::new(NoopDriver::new())
    } else {
        Arc::new(KubectlDriver::new(&config.stack))
    };
    info!(driver = driver.name(), "stack driver selected");

    let publisher = Arc::new(AmqpPublisher::new(
        config.bus.url.clone(),
        config.bus.exchange.clone(),
    ));
    let engine = Arc::new(LifecycleEngine::new(
        config.stack.clone(),
        config.operation_timeout,
        store.clone(),
        driver,
        AuditPublisher::new(publisher.clone()),
        FailurePublisher::new(publisher),
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let consumer = AmqpConsumer::new(
        config.bus.clone(),
        config.event_bindings.clone(),
        config.reconnect_delay,
        engine,
    );
    let consumer_task = tokio::spawn(consumer.run(shutdown_rx));

    let app = build_app(store, &config.api_prefix);
    let listener = tokio::net::TcpListener::bind(&args.bind).await?;
    info!(addr = %args.bind, prefix = %config.api_prefix, "read api listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // Let the consumer drain its in-flight event within the grace period.
    info!("shutting down; draining event consumer");
    shutdown_tx.send(true).ok();
    if tokio::time::timeout(config.shutdown_grace, consumer_task)
        .await
        .is_err()
    {
        warn!("event consumer did not stop within the grace period");
    }

    Ok(())
}

async fn shutdown_signal() {
    tokio::signal::ctrl_c().await.ok();
}
