use async_trait::async_trait;
use bytes::Bytes;
use log::debug;
use serde::Deserialize;
use serde_json::Value;

use crate::error::QueryError;
use crate::retry::{retry_with_backoff, RetryConfig};

// {"status":"success","data":{"resultType":"vector","result":[{"metric":{"location":"@web"},"value":[1513161148.757,"225.4068155675859"]}]}}
#[derive(Debug, Clone, Deserialize)]
pub struct QueryResponse {
    pub status: String,
    pub data: QueryResponseData,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryResponseData {
    pub result_type: String,
    pub result: Vec<QueryResult>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct QueryResult {
    #[serde(default)]
    pub metric: Value,
    pub value: (Value, String),
}

impl QueryResponse {
    pub fn from_slice(body: &[u8]) -> Result<Self, QueryError> {
        let response: QueryResponse = serde_json::from_slice(body)?;
        debug!(
            target: "prometheus",
            "Successfully unmarshalled prometheus query response: status={} resultType={} results={}",
            response.status,
            response.data.result_type,
            response.data.result.len()
        );
        Ok(response)
    }

    /// Scalar value of the first sample.
    pub fn request_rate(&self) -> Result<f64, QueryError> {
        let first = self.data.result.first().ok_or(QueryError::EmptyResult)?;
        let raw = &first.value.1;
        debug!(target: "prometheus", "using sample {:?} of series {}", raw, first.metric);
        match raw.parse::<f64>() {
            Ok(rate) if rate.is_finite() => Ok(rate),
            _ => Err(QueryError::InvalidValue(raw.clone())),
        }
    }
}

/// Source of the request rate driving the metric floor.
#[async_trait]
pub trait MetricSource: Send + Sync {
    async fn query(&self, server_url: &str, query: &str) -> Result<f64, QueryError>;
}

/// Instant query client for the Prometheus HTTP API. Connection failures
/// and 5xx responses are retried with backoff.
#[derive(Clone, Default)]
pub struct PrometheusClient {
    http: reqwest::Client,
    retry: RetryConfig,
}

impl PrometheusClient {
    pub fn new(http: reqwest::Client) -> Self {
        Self {
            http,
            retry: RetryConfig::default(),
        }
    }

    async fn fetch(&self, url: &str, query: &str) -> Result<Bytes, QueryError> {
        let response = self
            .http
            .get(url)
            .query(&[("query", query)])
            .send()
            .await
            .map_err(QueryError::Transport)?;

        let status = response.status();
        if !status.is_success() {
            return Err(QueryError::Status(status));
        }

        response.bytes().await.map_err(QueryError::Body)
    }
}

#[async_trait]
impl MetricSource for PrometheusClient {
    async fn query(&self, server_url: &str, query: &str) -> Result<f64, QueryError> {
        let url = format!("{}/api/v1/query", server_url.trim_end_matches('/'));
        debug!(target: "prometheus", "querying {} with {}", url, query);

        let body = retry_with_backoff(
            &self.retry,
            "prometheus query",
            QueryError::is_transient,
            || self.fetch(&url, query),
        )
        .await?;

        QueryResponse::from_slice(&body)?.request_rate()
    }
}
