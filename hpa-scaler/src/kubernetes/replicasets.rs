use std::collections::HashMap;

use k8s_openapi::api::apps::v1::ReplicaSet;
use kube::ResourceExt;
use log::{error, info};

use super::cluster::ClusterClient;
use super::models::APP_LABEL;

/// Replica sets of the whole cluster, listed at most once per pass and only
/// when some HPA asks for deployment checking.
#[derive(Debug, Default)]
pub struct ReplicaSetSnapshot {
    fetched: bool,
    // non-empty replica sets per app label, None when listing failed
    active_by_app: Option<HashMap<String, usize>>,
}

impl ReplicaSetSnapshot {
    #[cfg(test)]
    pub fn from_replica_sets(replica_sets: &[ReplicaSet]) -> Self {
        Self {
            fetched: true,
            active_by_app: Some(count_active_by_app(replica_sets)),
        }
    }

    pub fn is_fetched(&self) -> bool {
        self.fetched
    }

    async fn ensure_fetched<C: ClusterClient + ?Sized>(&mut self, cluster: &C) {
        if self.fetched {
            return;
        }
        self.fetched = true;

        info!(target: "scaler", "Listing replicasets for all namespaces...");
        match cluster.list_replica_sets().await {
            Ok(replica_sets) => {
                info!(target: "scaler", "Cluster has {} replicasets", replica_sets.len());
                self.active_by_app = Some(count_active_by_app(&replica_sets));
            }
            Err(err) => {
                error!(target: "scaler", "Could not list the replicasets in the cluster: {}", err);
            }
        }
    }

    /// An application is being deployed while more than one of its replica
    /// sets has pods. Without a usable listing this reports `false`.
    pub async fn deployment_in_progress<C: ClusterClient + ?Sized>(
        &mut self,
        cluster: &C,
        app: &str,
    ) -> bool {
        self.ensure_fetched(cluster).await;
        self.active_replica_sets(app) > 1
    }

    fn active_replica_sets(&self, app: &str) -> usize {
        self.active_by_app
            .as_ref()
            .and_then(|counts| counts.get(app))
            .copied()
            .unwrap_or(0)
    }
}

fn count_active_by_app(replica_sets: &[ReplicaSet]) -> HashMap<String, usize> {
    let mut counts = HashMap::new();
    for rs in replica_sets {
        let replicas = rs.status.as_ref().map(|s| s.replicas).unwrap_or(0);
        if replicas <= 0 {
            continue;
        }
        if let Some(app) = rs.labels().get(APP_LABEL) {
            *counts.entry(app.clone()).or_insert(0) += 1;
        }
    }
    counts
}
