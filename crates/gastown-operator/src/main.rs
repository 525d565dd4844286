//! Gastown controller entry point.
//!
//! Builds the Kubernetes and beads clients from the environment, wires
//! the controller, and runs it until SIGINT/SIGTERM. Exits 0 on a
//! clean shutdown, 1 on fatal client construction or watcher-stopped
//! errors.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use gastown_beads::{BeadsApi, BeadsClient};
use gastown_operator::{
    Controller, ControllerConfig, MirrorProvisioner, OperatorError, PodManager, PodStore,
};

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,gastown=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = ControllerConfig::from_env();
    tracing::info!(
        namespace = %config.namespace,
        beads_url = %config.beads_url,
        sync_interval = config.sync_interval_seconds,
        "starting gastown controller"
    );

    let shutdown = CancellationToken::new();
    spawn_signal_handler(shutdown.clone());

    if let Err(e) = run(config, shutdown).await {
        tracing::error!(error = %e, "controller failed");
        std::process::exit(1);
    }
}

async fn run(config: ControllerConfig, shutdown: CancellationToken) -> Result<(), OperatorError> {
    let client = kube::Client::try_default().await?;
    tracing::info!("connected to Kubernetes cluster");

    let config = Arc::new(config);
    let beads: Arc<dyn BeadsApi> = Arc::new(BeadsClient::new(
        config.beads_url.clone(),
        config.beads_token.clone(),
        config.town.clone(),
    ));
    let pods: Arc<dyn PodStore> =
        Arc::new(PodManager::new(client.clone(), config.namespace.clone()));
    let mirrors = MirrorProvisioner::new(client, config.namespace.clone());

    Controller::new(config, beads, pods)
        .with_mirrors(mirrors)
        .run(shutdown)
        .await
}

fn spawn_signal_handler(shutdown: CancellationToken) {
    tokio::spawn(async move {
        let terminate = async {
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(mut signal) => {
                    signal.recv().await;
                }
                Err(e) => {
                    tracing::warn!(error = %e, "failed to install SIGTERM handler");
                    std::future::pending::<()>().await;
                }
            }
        };

        tokio::select! {
            _ = tokio::signal::ctrl_c() => tracing::info!("received SIGINT"),
            () = terminate => tracing::info!("received SIGTERM"),
        }
        shutdown.cancel();
    });
}
