use k8s_openapi::api::autoscaling::v1::HorizontalPodAutoscaler;
use k8s_openapi::chrono::{SecondsFormat, Utc};
use kube::ResourceExt;
use log::{debug, info, warn};

use super::cluster::ClusterClient;
use super::models::{DesiredState, ANNOTATION_STATE, APP_LABEL};
use super::replicasets::ReplicaSetSnapshot;
use crate::error::Error;
use crate::metrics::ScalerMetrics;
use crate::query::MetricSource;

pub const INITIATOR_POLLER: &str = "poller";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Succeeded,
    Failed,
    Skipped,
}

impl Status {
    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Succeeded => "succeeded",
            Status::Failed => "failed",
            Status::Skipped => "skipped",
        }
    }
}

#[derive(Debug, Clone)]
pub struct ScalerSettings {
    pub minimum_replicas_lower_bound: i32,
    pub default_prometheus_server_url: String,
}

/// Highest minReplicas ever written, leaves room for maxReplicas above it.
pub const MAX_MIN_REPLICAS: i32 = i32::MAX - 1;

/// Replicas needed to serve `request_rate`, rounded up and capped at
/// `MAX_MIN_REPLICAS`. NaN counts as zero.
pub fn metric_floor(delta: f64, request_rate: f64, requests_per_replica: f64) -> i32 {
    let floor = (delta + request_rate / requests_per_replica).ceil();
    if floor.is_nan() {
        return 0;
    }
    floor.min(f64::from(MAX_MIN_REPLICAS)) as i32
}

/// Replicas that must remain after one scale-down step.
pub fn ratio_floor(current_replicas: i32, scale_down_max_ratio: f64) -> i32 {
    // floor the removable amount so scale-down errs on the slow side
    let max_scale_down = (f64::from(current_replicas) * scale_down_max_ratio).floor() as i32;

    // a zero step would forbid scaling down entirely, allow one replica instead
    if max_scale_down == 0 {
        return current_replicas - 1;
    }

    current_replicas - max_scale_down
}

/// The larger of both floors, never below the lower bound. A missing ratio
/// floor (deployment in progress) leaves the metric floor on its own.
pub fn target_min_replicas(metric_floor: i32, ratio_floor: Option<i32>, lower_bound: i32) -> i32 {
    let target = ratio_floor.map_or(metric_floor, |ratio| ratio.max(metric_floor));
    target.max(lower_bound)
}

/// maxReplicas has to stay above minReplicas.
pub fn max_replicas_for(min_replicas: i32, current_max_replicas: i32) -> i32 {
    if min_replicas >= current_max_replicas {
        min_replicas.saturating_add(1)
    } else {
        current_max_replicas
    }
}

/// Sets minReplicas (and maxReplicas when needed) of one HPA from its
/// annotations. Returns `Skipped` when disabled or already up to date.
pub async fn process_autoscaler<C, M>(
    cluster: &C,
    metric_source: &M,
    metrics: &ScalerMetrics,
    replica_sets: &mut ReplicaSetSnapshot,
    settings: &ScalerSettings,
    hpa: &HorizontalPodAutoscaler,
    initiator: &str,
) -> Result<Status, Error>
where
    C: ClusterClient + ?Sized,
    M: MetricSource + ?Sized,
{
    let annotations = hpa.annotations();
    if annotations.is_empty() {
        return Ok(Status::Skipped);
    }

    let desired = DesiredState::from_annotations(annotations, &settings.default_prometheus_server_url);
    if !desired.enabled {
        return Ok(Status::Skipped);
    }

    let name = hpa.name_any();
    let namespace = hpa.namespace().unwrap_or_default();

    let Some(spec) = hpa.spec.as_ref() else {
        warn!(target: "scaler", "HorizontalPodAutoscaler {}.{} has no spec, skipping", name, namespace);
        return Ok(Status::Skipped);
    };

    let mut request_rate = 0.0;
    let mut min_by_query = 0;
    if desired.metric_floor_enabled() {
        request_rate = metric_source
            .query(&desired.prometheus_server_url, &desired.prometheus_query)
            .await?;
        min_by_query = metric_floor(desired.delta, request_rate, desired.requests_per_replica);
    }

    let actual_replicas = hpa.status.as_ref().map(|s| s.current_replicas).unwrap_or(0);

    let mut deployment_in_progress = false;
    if desired.enable_deployment_checking {
        if let Some(app) = hpa.labels().get(APP_LABEL) {
            deployment_in_progress = replica_sets.deployment_in_progress(cluster, app).await;
        }
    }

    let min_by_ratio = if deployment_in_progress {
        None
    } else {
        Some(ratio_floor(actual_replicas, desired.scale_down_max_ratio))
    };

    let target = target_min_replicas(
        min_by_query,
        min_by_ratio,
        settings.minimum_replicas_lower_bound,
    );

    debug!(
        target: "scaler",
        "Calculated values for hpa {} in namespace {}: requestRate={} minByQuery={} minByRatio={:?} deploymentInProgress={} requestsPerReplica={} delta={} scaleDownMaxRatio={} target={}",
        name,
        namespace,
        request_rate,
        min_by_query,
        min_by_ratio,
        deployment_in_progress,
        desired.requests_per_replica,
        desired.delta,
        desired.scale_down_max_ratio,
        target
    );

    metrics.record_replicas(&name, &namespace, target, actual_replicas, request_rate);

    let current_min = spec.min_replicas.unwrap_or(1);
    if target == current_min {
        return Ok(Status::Skipped);
    }

    info!(
        target: "scaler",
        "[{}] HorizontalPodAutoscaler {}.{} - Updating hpa because minReplicas has changed from {} to {}...",
        initiator, name, namespace, current_min, target
    );

    let mut state = desired;
    state.last_updated = Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true);
    let serialized = serde_json::to_string(&state)?;

    let mut updated = hpa.clone();
    updated
        .annotations_mut()
        .insert(ANNOTATION_STATE.to_string(), serialized);
    if let Some(spec) = updated.spec.as_mut() {
        spec.max_replicas = max_replicas_for(target, spec.max_replicas);
        spec.min_replicas = Some(target);
    }

    cluster.update_autoscaler(&updated).await?;

    info!(
        target: "scaler",
        "[{}] HorizontalPodAutoscaler {}.{} - Updated hpa successfully...",
        initiator, name, namespace
    );

    Ok(Status::Succeeded)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kubernetes::cluster::fake::{autoscaler, replica_set, FakeCluster};
    use crate::kubernetes::models::*;
    use crate::query::fake::FakeMetricSource;

    const QUERY: &str = "sum(rate(nginx_http_requests_total{app=\"web\"}[10m]))";

    fn settings() -> ScalerSettings {
        ScalerSettings {
            minimum_replicas_lower_bound: 3,
            default_prometheus_server_url: "http://prometheus.monitoring".to_string(),
        }
    }

    async fn process(
        cluster: &FakeCluster,
        source: &FakeMetricSource,
        hpa: &HorizontalPodAutoscaler,
    ) -> Result<Status, Error> {
        let metrics = ScalerMetrics::new().unwrap();
        let mut replica_sets = ReplicaSetSnapshot::default();
        process_autoscaler(
            cluster,
            source,
            &metrics,
            &mut replica_sets,
            &settings(),
            hpa,
            INITIATOR_POLLER,
        )
        .await
    }

    #[test]
    fn metric_floor_rounds_up() {
        assert_eq!(metric_floor(-0.5, 225.4068155675859, 2.5), 90);
        assert_eq!(metric_floor(0.0, 100.0, 10.0), 10);
        assert_eq!(metric_floor(0.0, 100.1, 10.0), 11);
        assert_eq!(metric_floor(2.0, 0.0, 1.0), 2);
    }

    #[test]
    fn metric_floor_is_capped_below_max_replicas_range() {
        assert_eq!(metric_floor(1e12, 1.0, 1.0), MAX_MIN_REPLICAS);
        assert_eq!(metric_floor(0.0, f64::INFINITY, 1.0), MAX_MIN_REPLICAS);
        assert_eq!(metric_floor(0.0, 1.0, 0.0), MAX_MIN_REPLICAS);
        assert_eq!(metric_floor(0.0, 0.0, 0.0), 0);
        assert_eq!(metric_floor(-1e12, 1.0, 1.0), i32::MIN);
    }

    #[test]
    fn ratio_floor_rounds_removed_replicas_down() {
        assert_eq!(ratio_floor(100, 0.2), 80);
        assert_eq!(ratio_floor(10, 0.25), 8);
        assert_eq!(ratio_floor(7, 0.5), 4);
        assert_eq!(ratio_floor(10, 1.0), 0);
    }

    #[test]
    fn ratio_floor_always_allows_removing_one_replica() {
        assert_eq!(ratio_floor(2, 0.01), 1);
        assert_eq!(ratio_floor(4, 0.2), 3);
        assert_eq!(ratio_floor(50, 0.0), 49);
    }

    #[test]
    fn target_takes_larger_floor_and_respects_lower_bound() {
        assert_eq!(target_min_replicas(90, Some(80), 3), 90);
        assert_eq!(target_min_replicas(10, Some(80), 3), 80);
        assert_eq!(target_min_replicas(10, None, 3), 10);
        assert_eq!(target_min_replicas(0, Some(1), 3), 3);
        assert_eq!(target_min_replicas(0, None, 3), 3);
        assert_eq!(target_min_replicas(-4, Some(-1), 0), 0);
    }

    #[test]
    fn max_replicas_is_raised_above_min() {
        assert_eq!(max_replicas_for(10, 20), 20);
        assert_eq!(max_replicas_for(20, 20), 21);
        assert_eq!(max_replicas_for(25, 20), 26);
    }

    #[test]
    fn max_replicas_does_not_overflow() {
        let min = metric_floor(0.0, f64::INFINITY, 1.0);
        assert_eq!(max_replicas_for(min, 10), i32::MAX);
        assert!(min < max_replicas_for(min, 10));
        assert_eq!(max_replicas_for(i32::MAX, 10), i32::MAX);
    }

    #[test]
    fn status_labels() {
        assert_eq!(Status::Succeeded.as_str(), "succeeded");
        assert_eq!(Status::Failed.as_str(), "failed");
        assert_eq!(Status::Skipped.as_str(), "skipped");
    }

    #[tokio::test]
    async fn disabled_hpa_is_skipped_without_queries_or_writes() {
        let hpa = autoscaler(
            "web",
            "shop",
            3,
            10,
            5,
            &[
                (ANNOTATION_HPA_SCALER, "false"),
                (ANNOTATION_PROMETHEUS_QUERY, QUERY),
                (ANNOTATION_SCALE_DOWN_MAX_RATIO, "0.1"),
            ],
        );
        let cluster = FakeCluster::new(vec![hpa.clone()]);
        let source = FakeMetricSource::default().with_value(QUERY, 500.0);

        assert_eq!(process(&cluster, &source, &hpa).await.unwrap(), Status::Skipped);
        assert!(cluster.updates().is_empty());
        assert!(source.calls().is_empty());
    }

    #[tokio::test]
    async fn hpa_without_annotations_is_skipped() {
        let hpa = autoscaler("web", "shop", 3, 10, 5, &[]);
        let cluster = FakeCluster::new(vec![hpa.clone()]);

        let status = process(&cluster, &FakeMetricSource::default(), &hpa).await;

        assert_eq!(status.unwrap(), Status::Skipped);
        assert!(cluster.updates().is_empty());
    }

    #[tokio::test]
    async fn metric_floor_updates_min_replicas_and_state() {
        let hpa = autoscaler(
            "web",
            "shop",
            3,
            200,
            50,
            &[
                (ANNOTATION_HPA_SCALER, "true"),
                (ANNOTATION_PROMETHEUS_QUERY, QUERY),
                (ANNOTATION_REQUESTS_PER_REPLICA, "2.5"),
                (ANNOTATION_DELTA, "-0.5"),
            ],
        );
        let cluster = FakeCluster::new(vec![hpa.clone()]);
        let source = FakeMetricSource::default().with_value(QUERY, 225.4068155675859);

        assert_eq!(process(&cluster, &source, &hpa).await.unwrap(), Status::Succeeded);

        let updates = cluster.updates();
        assert_eq!(updates.len(), 1);
        let spec = updates[0].spec.as_ref().unwrap();
        assert_eq!(spec.min_replicas, Some(90));
        assert_eq!(spec.max_replicas, 200);

        let state: serde_json::Value =
            serde_json::from_str(&updates[0].annotations()[ANNOTATION_STATE]).unwrap();
        assert_eq!(state["enabled"], "true");
        assert_eq!(state["prometheusQuery"], QUERY);
        assert_eq!(state["requestsPerReplica"], 2.5);
        assert_eq!(state["delta"], -0.5);
        assert!(state["lastUpdated"].as_str().unwrap().ends_with('Z'));

        assert_eq!(
            source.calls(),
            vec![("http://prometheus.monitoring".to_string(), QUERY.to_string())]
        );
    }

    #[tokio::test]
    async fn annotation_overrides_prometheus_server() {
        let hpa = autoscaler(
            "web",
            "shop",
            3,
            10,
            3,
            &[
                (ANNOTATION_HPA_SCALER, "true"),
                (ANNOTATION_PROMETHEUS_QUERY, QUERY),
                (ANNOTATION_PROMETHEUS_SERVER_URL, "http://prometheus.shop"),
            ],
        );
        let cluster = FakeCluster::new(vec![hpa.clone()]);
        let source = FakeMetricSource::default().with_value(QUERY, 1.0);

        process(&cluster, &source, &hpa).await.unwrap();

        assert_eq!(source.calls()[0].0, "http://prometheus.shop");
    }

    #[tokio::test]
    async fn unchanged_target_is_skipped() {
        // ratio floor 20 - floor(20 * 0.1) = 18 already matches minReplicas
        let hpa = autoscaler(
            "web",
            "shop",
            18,
            40,
            20,
            &[
                (ANNOTATION_HPA_SCALER, "true"),
                (ANNOTATION_SCALE_DOWN_MAX_RATIO, "0.1"),
            ],
        );
        let cluster = FakeCluster::new(vec![hpa.clone()]);

        let status = process(&cluster, &FakeMetricSource::default(), &hpa).await;

        assert_eq!(status.unwrap(), Status::Skipped);
        assert!(cluster.updates().is_empty());
    }

    #[tokio::test]
    async fn second_run_on_updated_hpa_is_idempotent() {
        let hpa = autoscaler(
            "web",
            "shop",
            3,
            200,
            50,
            &[
                (ANNOTATION_HPA_SCALER, "true"),
                (ANNOTATION_PROMETHEUS_QUERY, QUERY),
                (ANNOTATION_REQUESTS_PER_REPLICA, "10"),
            ],
        );
        let cluster = FakeCluster::new(vec![hpa.clone()]);
        let source = FakeMetricSource::default().with_value(QUERY, 600.0);

        assert_eq!(process(&cluster, &source, &hpa).await.unwrap(), Status::Succeeded);
        let updated = cluster.updates().remove(0);
        assert_eq!(process(&cluster, &source, &updated).await.unwrap(), Status::Skipped);
        assert_eq!(cluster.updates().len(), 1);
    }

    #[tokio::test]
    async fn max_replicas_is_raised_with_min() {
        let hpa = autoscaler(
            "web",
            "shop",
            3,
            10,
            10,
            &[
                (ANNOTATION_HPA_SCALER, "true"),
                (ANNOTATION_PROMETHEUS_QUERY, QUERY),
            ],
        );
        let cluster = FakeCluster::new(vec![hpa.clone()]);
        let source = FakeMetricSource::default().with_value(QUERY, 12.2);

        process(&cluster, &source, &hpa).await.unwrap();

        let spec = cluster.updates()[0].spec.clone().unwrap();
        assert_eq!(spec.min_replicas, Some(13));
        assert_eq!(spec.max_replicas, 14);
        assert!(spec.min_replicas.unwrap() < spec.max_replicas);
    }

    #[tokio::test]
    async fn huge_delta_keeps_min_below_max() {
        let hpa = autoscaler(
            "web",
            "shop",
            3,
            10,
            5,
            &[
                (ANNOTATION_HPA_SCALER, "true"),
                (ANNOTATION_PROMETHEUS_QUERY, QUERY),
                (ANNOTATION_DELTA, "1e12"),
            ],
        );
        let cluster = FakeCluster::new(vec![hpa.clone()]);
        let source = FakeMetricSource::default().with_value(QUERY, 1.0);

        assert_eq!(process(&cluster, &source, &hpa).await.unwrap(), Status::Succeeded);

        let spec = cluster.updates()[0].spec.clone().unwrap();
        assert_eq!(spec.min_replicas, Some(MAX_MIN_REPLICAS));
        assert_eq!(spec.max_replicas, i32::MAX);
    }

    #[tokio::test]
    async fn lower_bound_holds_when_floors_are_small() {
        let hpa = autoscaler(
            "web",
            "shop",
            5,
            10,
            2,
            &[
                (ANNOTATION_HPA_SCALER, "true"),
                (ANNOTATION_PROMETHEUS_QUERY, QUERY),
            ],
        );
        let cluster = FakeCluster::new(vec![hpa.clone()]);
        let source = FakeMetricSource::default().with_value(QUERY, 0.0);

        process(&cluster, &source, &hpa).await.unwrap();

        assert_eq!(cluster.updates()[0].spec.as_ref().unwrap().min_replicas, Some(3));
    }

    #[tokio::test]
    async fn query_failure_fails_without_writing() {
        let hpa = autoscaler(
            "web",
            "shop",
            3,
            10,
            5,
            &[
                (ANNOTATION_HPA_SCALER, "true"),
                (ANNOTATION_PROMETHEUS_QUERY, "unknown_metric"),
            ],
        );
        let cluster = FakeCluster::new(vec![hpa.clone()]);

        let err = process(&cluster, &FakeMetricSource::default(), &hpa)
            .await
            .unwrap_err();

        assert!(matches!(err, Error::Query(_)));
        assert!(cluster.updates().is_empty());
    }

    #[tokio::test]
    async fn write_conflict_is_reported() {
        // lower bound 3 replaces minReplicas 5
        let hpa = autoscaler(
            "web",
            "shop",
            5,
            10,
            8,
            &[(ANNOTATION_HPA_SCALER, "true")],
        );
        let cluster = FakeCluster::new(vec![hpa.clone()]).conflicting_on("web");

        let err = process(&cluster, &FakeMetricSource::default(), &hpa)
            .await
            .unwrap_err();

        assert!(matches!(err, Error::ClusterWrite { .. }));
    }

    #[tokio::test]
    async fn rollout_suspends_ratio_floor() {
        let annotations = [
            (ANNOTATION_HPA_SCALER, "true"),
            (ANNOTATION_PROMETHEUS_QUERY, QUERY),
            (ANNOTATION_SCALE_DOWN_MAX_RATIO, "0.2"),
            (ANNOTATION_ENABLE_DEPLOYMENT_CHECKING, "true"),
        ];
        let hpa = autoscaler("web", "shop", 3, 200, 100, &annotations);
        let cluster = FakeCluster::new(vec![hpa.clone()]).with_replica_sets(vec![
            replica_set("web-7d9f", "web", 60),
            replica_set("web-5c2a", "web", 40),
        ]);
        let source = FakeMetricSource::default().with_value(QUERY, 10.0);

        process(&cluster, &source, &hpa).await.unwrap();

        // ratio floor would be 80, only the metric floor applies
        assert_eq!(cluster.updates()[0].spec.as_ref().unwrap().min_replicas, Some(10));
        assert_eq!(cluster.replica_set_lists(), 1);
    }

    #[tokio::test]
    async fn ratio_floor_applies_after_rollout() {
        let annotations = [
            (ANNOTATION_HPA_SCALER, "true"),
            (ANNOTATION_PROMETHEUS_QUERY, QUERY),
            (ANNOTATION_SCALE_DOWN_MAX_RATIO, "0.2"),
            (ANNOTATION_ENABLE_DEPLOYMENT_CHECKING, "true"),
        ];
        let hpa = autoscaler("web", "shop", 3, 200, 100, &annotations);
        let cluster = FakeCluster::new(vec![hpa.clone()]).with_replica_sets(vec![
            replica_set("web-7d9f", "web", 100),
            replica_set("web-5c2a", "web", 0),
        ]);
        let source = FakeMetricSource::default().with_value(QUERY, 10.0);

        process(&cluster, &source, &hpa).await.unwrap();

        assert_eq!(cluster.updates()[0].spec.as_ref().unwrap().min_replicas, Some(80));
    }

    #[tokio::test]
    async fn replica_sets_are_not_listed_without_deployment_checking() {
        let hpa = autoscaler(
            "web",
            "shop",
            3,
            200,
            100,
            &[
                (ANNOTATION_HPA_SCALER, "true"),
                (ANNOTATION_SCALE_DOWN_MAX_RATIO, "0.2"),
            ],
        );
        let cluster = FakeCluster::new(vec![hpa.clone()]).with_replica_sets(vec![
            replica_set("web-7d9f", "web", 60),
            replica_set("web-5c2a", "web", 40),
        ]);

        process(&cluster, &FakeMetricSource::default(), &hpa).await.unwrap();

        assert_eq!(cluster.replica_set_lists(), 0);
        assert_eq!(cluster.updates()[0].spec.as_ref().unwrap().min_replicas, Some(80));
    }
}
