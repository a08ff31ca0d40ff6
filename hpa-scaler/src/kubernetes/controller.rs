use std::sync::Arc;
use std::time::Duration;

use kube::ResourceExt;
use log::{error, info, warn};
use rand::Rng;
use tokio::sync::watch;

use super::cluster::ClusterClient;
use super::replicasets::ReplicaSetSnapshot;
use super::scaler::{process_autoscaler, ScalerSettings, Status, INITIATOR_POLLER};
use crate::error::Error;
use crate::metrics::ScalerMetrics;
use crate::query::MetricSource;
use crate::shutdown::shutdown_requested;

/// State scoped to one pass over all HPAs, dropped when the pass ends.
#[derive(Debug, Default)]
pub struct PassContext {
    pub replica_sets: ReplicaSetSnapshot,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PassSummary {
    pub succeeded: usize,
    pub failed: usize,
    pub skipped: usize,
}

impl PassSummary {
    fn record(&mut self, status: Status) {
        match status {
            Status::Succeeded => self.succeeded += 1,
            Status::Failed => self.failed += 1,
            Status::Skipped => self.skipped += 1,
        }
    }
}

pub struct Reconciler<C, M> {
    cluster: C,
    metric_source: M,
    metrics: Arc<ScalerMetrics>,
    settings: ScalerSettings,
}

impl<C, M> Reconciler<C, M>
where
    C: ClusterClient,
    M: MetricSource,
{
    pub fn new(
        cluster: C,
        metric_source: M,
        metrics: Arc<ScalerMetrics>,
        settings: ScalerSettings,
    ) -> Self {
        Self {
            cluster,
            metric_source,
            metrics,
            settings,
        }
    }

    /// Processes every HPA in list order. A failing HPA is counted and
    /// logged, the remaining ones are still processed.
    pub async fn run_pass(&self) -> Result<PassSummary, Error> {
        info!(target: "controller", "Listing horizontal pod autoscalers for all namespaces...");
        let hpas = self.cluster.list_autoscalers().await?;
        info!(target: "controller", "Cluster has {} horizontal pod autoscalers", hpas.len());

        let mut context = PassContext::default();
        let mut summary = PassSummary::default();

        for hpa in &hpas {
            let result = process_autoscaler(
                &self.cluster,
                &self.metric_source,
                &self.metrics,
                &mut context.replica_sets,
                &self.settings,
                hpa,
                INITIATOR_POLLER,
            )
            .await;

            let status = match result {
                Ok(status) => status,
                Err(err @ Error::Query(_)) => {
                    warn!(
                        target: "controller",
                        "HorizontalPodAutoscaler {}.{}: {}",
                        hpa.name_any(),
                        hpa.namespace().unwrap_or_default(),
                        err
                    );
                    Status::Failed
                }
                Err(err) => {
                    error!(
                        target: "controller",
                        "HorizontalPodAutoscaler {}.{}: {}",
                        hpa.name_any(),
                        hpa.namespace().unwrap_or_default(),
                        err
                    );
                    Status::Failed
                }
            };

            self.metrics.record_processed(
                &hpa.namespace().unwrap_or_default(),
                status.as_str(),
                INITIATOR_POLLER,
            );
            summary.record(status);
        }

        info!(
            target: "controller",
            "Pass finished: {} succeeded, {} failed, {} skipped (replicasets listed: {})",
            summary.succeeded,
            summary.failed,
            summary.skipped,
            context.replica_sets.is_fetched()
        );
        Ok(summary)
    }

    /// Runs passes until `shutdown` flips to true. A running pass is never
    /// interrupted, only the sleep between passes is.
    pub async fn run(self, base_interval: Duration, mut shutdown: watch::Receiver<bool>) {
        loop {
            if *shutdown.borrow() {
                break;
            }

            if let Err(err) = self.run_pass().await {
                error!(target: "controller", "Could not list the horizontal pod autoscalers in the cluster: {}", err);
            }

            let sleep_time = apply_jitter(base_interval);
            info!(target: "controller", "Sleeping for {} seconds...", sleep_time.as_secs());

            tokio::select! {
                _ = tokio::time::sleep(sleep_time) => {}
                _ = shutdown_requested(&mut shutdown) => break,
            }
        }
        info!(target: "controller", "Poll loop stopped");
    }
}

/// Spreads `base` uniformly over +/-25%.
pub fn apply_jitter(base: Duration) -> Duration {
    let base_ms = base.as_millis() as u64;
    let deviation = base_ms / 4;
    if deviation == 0 {
        return base;
    }
    let offset = rand::thread_rng().gen_range(0..2 * deviation);
    Duration::from_millis(base_ms - deviation + offset)
}
