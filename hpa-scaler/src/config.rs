use std::net::SocketAddr;
use std::time::Duration;

use anyhow::ensure;
use clap::Parser;

#[derive(Debug, Clone, Parser)]
#[clap(name = "hpa-scaler", about = "Overrides HPA minReplicas from a Prometheus query")]
pub struct Opt {
    /// Prometheus server used when an HPA does not override it
    #[clap(long, env = "PROMETHEUS_SERVER_URL")]
    pub prometheus_server_url: String,

    /// minReplicas is never set below this value
    #[clap(long, env = "MINIMUM_REPLICAS_LOWER_BOUND", default_value_t = 3)]
    pub minimum_replicas_lower_bound: i32,

    /// Address serving the /metrics endpoint
    #[clap(long, env = "LISTEN_ADDRESS", default_value = "0.0.0.0:9101")]
    pub listen_address: SocketAddr,

    /// Base interval between passes in seconds, jittered by 25%
    #[clap(long, env = "POLL_INTERVAL_SECONDS", default_value_t = 90)]
    pub poll_interval: u64,
}

impl Opt {
    pub fn validate(&self) -> anyhow::Result<()> {
        ensure!(
            !self.prometheus_server_url.trim().is_empty(),
            "PROMETHEUS_SERVER_URL is required, set it to your Prometheus server service url"
        );
        ensure!(
            self.minimum_replicas_lower_bound >= 0,
            "minimum replicas lower bound must not be negative, got {}",
            self.minimum_replicas_lower_bound
        );
        ensure!(self.poll_interval > 0, "poll interval must be positive");
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval)
    }
}
