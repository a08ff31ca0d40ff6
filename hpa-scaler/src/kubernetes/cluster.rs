use async_trait::async_trait;
use k8s_openapi::api::apps::v1::ReplicaSet;
use k8s_openapi::api::autoscaling::v1::HorizontalPodAutoscaler;
use kube::api::{Api, ListParams, PostParams};
use kube::{Client, ResourceExt};

use crate::error::Error;

/// Cluster operations the scaler depends on. Lists span all namespaces.
#[async_trait]
pub trait ClusterClient: Send + Sync {
    async fn list_autoscalers(&self) -> Result<Vec<HorizontalPodAutoscaler>, Error>;

    async fn update_autoscaler(
        &self,
        hpa: &HorizontalPodAutoscaler,
    ) -> Result<HorizontalPodAutoscaler, Error>;

    async fn list_replica_sets(&self) -> Result<Vec<ReplicaSet>, Error>;
}

pub struct KubeCluster {
    client: Client,
}

impl KubeCluster {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ClusterClient for KubeCluster {
    async fn list_autoscalers(&self) -> Result<Vec<HorizontalPodAutoscaler>, Error> {
        let hpas: Api<HorizontalPodAutoscaler> = Api::all(self.client.clone());
        let list = hpas
            .list(&ListParams::default())
            .await
            .map_err(|source| Error::ClusterList {
                resource: "horizontal pod autoscalers",
                source,
            })?;
        Ok(list.items)
    }

    async fn update_autoscaler(
        &self,
        hpa: &HorizontalPodAutoscaler,
    ) -> Result<HorizontalPodAutoscaler, Error> {
        let name = hpa.name_any();
        let namespace = hpa.namespace().unwrap_or_default();
        let hpas: Api<HorizontalPodAutoscaler> =
            Api::namespaced(self.client.clone(), &namespace);

        let replaced = hpas.replace(&name, &PostParams::default(), hpa).await;
        replaced.map_err(|source| Error::ClusterWrite {
            name,
            namespace,
            source,
        })
    }

    async fn list_replica_sets(&self) -> Result<Vec<ReplicaSet>, Error> {
        let replica_sets: Api<ReplicaSet> = Api::all(self.client.clone());
        let list = replica_sets
            .list(&ListParams::default())
            .await
            .map_err(|source| Error::ClusterList {
                resource: "replica sets",
                source,
            })?;
        Ok(list.items)
    }
}
