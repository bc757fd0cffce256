//! Drover daemon over the in-memory registries.
//!
//! Wires a [`MemoryBackend`] behind the controller and runs the lookup loop
//! until ctrl-c. Useful for local runs and as the reference wiring for
//! deployments with real registries.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use drover::backends::MemoryBackend;
use drover::{Config, Controller, ControllerConfig, LookupConfig, LookupTask, TimeOrderedIdGenerator};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "drover=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env()?;
    info!(
        tmp_path = %config.tmp_path,
        out_path = %config.out_path,
        "starting drover"
    );

    let backend = Arc::new(MemoryBackend::new());
    let mut controller_config = ControllerConfig::new(&config.tmp_path, &config.out_path);
    controller_config.lookup_interval = Duration::from_millis(config.lookup_interval_ms);
    let controller = Arc::new(Controller::new(
        backend.clone(),
        backend.clone(),
        backend.clone(),
        backend.clone(),
        backend.clone(),
        backend.clone(),
        Arc::new(TimeOrderedIdGenerator),
        controller_config,
    ));

    let lookup = LookupTask::new(
        controller,
        LookupConfig {
            interval: Duration::from_millis(config.lookup_interval_ms),
            orphan_interval: Duration::from_millis(config.orphan_lookup_interval_ms),
        },
    );

    let shutdown = CancellationToken::new();
    let lookup_handle = tokio::spawn(lookup.run(shutdown.clone()));

    tokio::signal::ctrl_c().await?;
    info!("shutdown requested");
    shutdown.cancel();
    lookup_handle.await?;
    Ok(())
}
