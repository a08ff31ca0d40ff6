use thiserror::Error;

/// Failure while fetching or decoding a Prometheus instant query.
#[derive(Debug, Error)]
pub enum QueryError {
    #[error("executing prometheus query failed: {0}")]
    Transport(#[source] reqwest::Error),

    #[error("prometheus responded with status {0}")]
    Status(reqwest::StatusCode),

    #[error("reading prometheus query response body failed: {0}")]
    Body(#[source] reqwest::Error),

    #[error("unmarshalling prometheus query response failed: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("prometheus query returned no results")]
    EmptyResult,

    #[error("prometheus query returned an unparsable value: {0:?}")]
    InvalidValue(String),
}

impl QueryError {
    /// Connection failures and 5xx responses are worth another attempt.
    pub fn is_transient(&self) -> bool {
        match self {
            QueryError::Transport(_) | QueryError::Body(_) => true,
            QueryError::Status(status) => status.is_server_error(),
            _ => false,
        }
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Query(#[from] QueryError),

    #[error("listing {resource} failed: {source}")]
    ClusterList {
        resource: &'static str,
        #[source]
        source: kube::Error,
    },

    #[error("updating horizontal pod autoscaler {namespace}/{name} failed: {source}")]
    ClusterWrite {
        name: String,
        namespace: String,
        #[source]
        source: kube::Error,
    },

    #[error("serializing hpa scaler state failed: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("metrics registry error: {0}")]
    Metrics(#[from] prometheus::Error),
}
