use std::sync::Arc;

use clap::Parser;
use kube::Client;
use log::{error, info};
use tokio::signal;
use tokio::signal::unix::SignalKind;
use tokio::sync::watch;

mod config;
mod error;
mod kubernetes;
mod metrics;
mod query;
mod retry;
mod shutdown;

use config::Opt;
use kubernetes::cluster::KubeCluster;
use kubernetes::controller::Reconciler;
use kubernetes::scaler::ScalerSettings;
use metrics::ScalerMetrics;
use query::PrometheusClient;

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    let opt = Opt::parse();

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    opt.validate()?;

    let client = Client::try_default().await?;
    let metrics = Arc::new(ScalerMetrics::new()?);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let listener = tokio::net::TcpListener::bind(opt.listen_address).await?;
    let metrics_server = tokio::spawn(metrics::serve(
        listener,
        metrics.clone(),
        shutdown_rx.clone(),
    ));

    let reconciler = Reconciler::new(
        KubeCluster::new(client),
        PrometheusClient::new(reqwest::Client::new()),
        metrics,
        ScalerSettings {
            minimum_replicas_lower_bound: opt.minimum_replicas_lower_bound,
            default_prometheus_server_url: opt.prometheus_server_url.clone(),
        },
    );
    let poller = tokio::spawn(reconciler.run(opt.poll_interval(), shutdown_rx));

    let mut terminate = signal::unix::signal(SignalKind::terminate())?;
    info!("Waiting for SIGTERM or Ctrl-C...");
    tokio::select! {
        _ = signal::ctrl_c() => info!("Received SIGINT. Waiting for running tasks to finish..."),
        _ = terminate.recv() => info!("Received SIGTERM. Waiting for running tasks to finish..."),
    }

    let _ = shutdown_tx.send(true);
    poller.await?;
    match metrics_server.await? {
        Ok(()) => {}
        Err(err) => error!(target: "metrics", "metrics server failed: {}", err),
    }

    info!("Shutting down...");
    Ok(())
}
