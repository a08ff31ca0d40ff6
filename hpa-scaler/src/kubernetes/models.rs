use std::collections::BTreeMap;
use std::str::FromStr;

use log::debug;
use serde::{Serialize, Serializer};

pub const ANNOTATION_HPA_SCALER: &str = "estafette.io/hpa-scaler";
pub const ANNOTATION_PROMETHEUS_QUERY: &str = "estafette.io/hpa-scaler-prometheus-query";
pub const ANNOTATION_REQUESTS_PER_REPLICA: &str = "estafette.io/hpa-scaler-requests-per-replica";
pub const ANNOTATION_DELTA: &str = "estafette.io/hpa-scaler-delta";
pub const ANNOTATION_PROMETHEUS_SERVER_URL: &str = "estafette.io/hpa-scaler-prometheus-server-url";
pub const ANNOTATION_SCALE_DOWN_MAX_RATIO: &str = "estafette.io/hpa-scaler-scale-down-max-ratio";
pub const ANNOTATION_ENABLE_DEPLOYMENT_CHECKING: &str =
    "estafette.io/hpa-scaler-enable-scale-down-ratio-deployment-checking";
pub const ANNOTATION_STATE: &str = "estafette.io/hpa-scaler-state";

// Label shared by an HPA and the replica sets of the application it scales
pub const APP_LABEL: &str = "app";

/// Scaler settings of one HPA, resolved from its annotations on every pass.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DesiredState {
    #[serde(serialize_with = "serialize_flag")]
    pub enabled: bool,
    pub prometheus_query: String,
    pub requests_per_replica: f64,
    pub delta: f64,
    pub last_updated: String,
    #[serde(rename = "prometheusServerUrl")]
    pub prometheus_server_url: String,
    pub scale_down_max_ratio: f64,
    #[serde(
        rename = "enableScaleDownRatioDeploymentChecking",
        serialize_with = "serialize_flag"
    )]
    pub enable_deployment_checking: bool,
}

fn serialize_flag<S: Serializer>(flag: &bool, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(if *flag { "true" } else { "false" })
}

impl DesiredState {
    pub fn from_annotations(
        annotations: &BTreeMap<String, String>,
        default_server_url: &str,
    ) -> Self {
        DesiredState {
            enabled: flag_annotation(annotations, ANNOTATION_HPA_SCALER),
            prometheus_query: annotations
                .get(ANNOTATION_PROMETHEUS_QUERY)
                .cloned()
                .unwrap_or_default(),
            requests_per_replica: parse_annotation(annotations, ANNOTATION_REQUESTS_PER_REPLICA)
                .unwrap_or(1.0),
            delta: parse_annotation(annotations, ANNOTATION_DELTA).unwrap_or(0.0),
            last_updated: String::new(),
            prometheus_server_url: annotations
                .get(ANNOTATION_PROMETHEUS_SERVER_URL)
                .cloned()
                .unwrap_or_else(|| default_server_url.to_string()),
            scale_down_max_ratio: parse_annotation(annotations, ANNOTATION_SCALE_DOWN_MAX_RATIO)
                .unwrap_or(1.0),
            enable_deployment_checking: flag_annotation(
                annotations,
                ANNOTATION_ENABLE_DEPLOYMENT_CHECKING,
            ),
        }
    }

    /// The metric floor only applies with a query and a positive divisor.
    pub fn metric_floor_enabled(&self) -> bool {
        !self.prometheus_query.is_empty() && self.requests_per_replica > 0.0
    }
}

/// Returns the parsed annotation, or `None` when it is absent or malformed.
pub fn parse_annotation<T: FromStr>(annotations: &BTreeMap<String, String>, key: &str) -> Option<T> {
    let raw = annotations.get(key)?;
    match raw.parse::<T>() {
        Ok(value) => Some(value),
        Err(_) => {
            debug!(target: "scaler", "ignoring malformed annotation {}={:?}", key, raw);
            None
        }
    }
}

fn flag_annotation(annotations: &BTreeMap<String, String>, key: &str) -> bool {
    annotations.get(key).map(String::as_str) == Some("true")
}
