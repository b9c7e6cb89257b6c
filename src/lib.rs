pub mod config;
pub mod engine;
pub mod error;
pub mod lifecycle;
mod parsers;
pub mod status;
pub mod watchers;

use config::{MinerConfig, ProxySettings};
use engine::docker_api::DockerClient;
use engine::Engine;
use error::ProxyError;
use lifecycle::{Directive, LifecycleController};
use std::future::Future;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;
use watchers::event_watcher::EventWatcher;

/// Process entry point: connect to the local engine and arbitrate until signalled.
pub fn run() -> Result<(), ProxyError> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(async {
        let settings = ProxySettings::from_env()?;
        tracing::info!(
            "Connecting to engine at {:?} (API v{})",
            settings.engine_host,
            settings.api_version
        );
        let engine = Arc::new(DockerClient::new(&settings)?);
        serve(engine, settings, shutdown_signal()).await
    })
}

/// Resolve configuration, reconcile once, then dispatch engine events until
/// `shutdown` resolves. Failing to read configuration or the initial status
/// is fatal; everything after that is logged and absorbed.
pub async fn serve<E: Engine>(
    engine: Arc<E>,
    settings: ProxySettings,
    shutdown: impl Future<Output = ()>,
) -> Result<(), ProxyError> {
    let labels = engine.host_labels().await?;
    let config = MinerConfig::resolve(&labels);
    tracing::info!("Miner config: {config:?}");

    let controller = Arc::new(LifecycleController::new(
        engine.clone(),
        config,
        settings.clone(),
    ));
    let status = controller.tracker().snapshot().await?;
    tracing::info!("Initial host status: {status}");

    let mut watcher = EventWatcher::new(engine, controller, &settings);
    if status.is_idle() || (status.mining_active() && status.edge_work_active()) {
        watcher.dispatch(Directive::Reconcile);
    }
    watcher.run(shutdown).await
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            Err(e) => {
                tracing::warn!("Cannot listen for SIGTERM: {e}");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
    tracing::info!("Shutdown signal received");
}
