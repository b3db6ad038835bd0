//! Kangal controller, runs distributed load tests described by LoadTest resources.
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use kube::{Client, Config as KubeConfig};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use kangal_operator::{
    backends::Registry,
    config::Config,
    controller::{self, Options},
    metrics::OtelReporter,
    utils::UtcClock,
    CONTROLLER_NAME,
};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::parse();
    let telemetry = kangal_common::telemetry::init(
        CONTROLLER_NAME,
        config.otlp_endpoint.clone(),
        config.log_format.into(),
    )
    .await?;

    let kube_config = config.kube_client_config(KubeConfig::infer().await?);
    let k_client = Client::try_from(kube_config)?;

    let backends = config.backend_context(k_client.clone(), |name| std::env::var(name).ok());
    let registry = Registry::with_defaults(backends)?;
    info!(
        backends = ?registry.types().map(|t| t.to_string()).collect::<Vec<_>>(),
        cleanup_threshold = ?config.cleanup_threshold,
        workers = config.workers,
        "starting controller"
    );

    let shutdown = CancellationToken::new();
    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            if let Err(err) = tokio::signal::ctrl_c().await {
                error!(%err, "failed to listen for shutdown signal");
            }
            shutdown.cancel();
        }
    });

    let options = Options {
        k_client,
        clock: Arc::new(UtcClock),
        registry: Arc::new(registry),
        reporter: Arc::new(OtelReporter::default()),
        settings: config.settings(),
        workers: config.workers,
    };
    let result = controller::run(options, shutdown).await;

    // Flush traces and metrics before shutdown
    telemetry.shutdown()?;
    result
}
