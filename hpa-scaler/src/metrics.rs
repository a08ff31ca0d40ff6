use std::sync::Arc;

use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use log::{error, info};
use prometheus::{CounterVec, Encoder, GaugeVec, Opts, Registry, TextEncoder};
use tokio::sync::watch;

use crate::error::Error;
use crate::shutdown::shutdown_requested;

/// Counters and gauges exported by the scaler, registered once at startup.
pub struct ScalerMetrics {
    registry: Registry,
    totals: CounterVec,
    min_replicas: GaugeVec,
    actual_replicas: GaugeVec,
    request_rate: GaugeVec,
}

impl ScalerMetrics {
    pub fn new() -> Result<Self, Error> {
        let registry = Registry::new();

        let totals = CounterVec::new(
            Opts::new(
                "estafette_hpa_scaler_totals",
                "Number of processed HorizontalPodAutoscalers.",
            ),
            &["namespace", "status", "initiator"],
        )?;
        let min_replicas = GaugeVec::new(
            Opts::new(
                "estafette_hpa_scaler_min_replicas",
                "The minimum number of replicas per hpa as set by this application.",
            ),
            &["hpa", "namespace"],
        )?;
        let actual_replicas = GaugeVec::new(
            Opts::new(
                "estafette_hpa_scaler_actual_replicas",
                "The actual number of replicas per hpa as set by this application.",
            ),
            &["hpa", "namespace"],
        )?;
        let request_rate = GaugeVec::new(
            Opts::new(
                "estafette_hpa_scaler_request_rate",
                "The request rate used for setting minimum number of replicas per hpa as set by this application.",
            ),
            &["hpa", "namespace"],
        )?;

        registry.register(Box::new(totals.clone()))?;
        registry.register(Box::new(min_replicas.clone()))?;
        registry.register(Box::new(actual_replicas.clone()))?;
        registry.register(Box::new(request_rate.clone()))?;

        Ok(Self {
            registry,
            totals,
            min_replicas,
            actual_replicas,
            request_rate,
        })
    }

    pub fn record_processed(&self, namespace: &str, status: &str, initiator: &str) {
        self.totals
            .with_label_values(&[namespace, status, initiator])
            .inc();
    }

    pub fn record_replicas(
        &self,
        hpa: &str,
        namespace: &str,
        target_min_replicas: i32,
        actual_replicas: i32,
        request_rate: f64,
    ) {
        self.min_replicas
            .with_label_values(&[hpa, namespace])
            .set(f64::from(target_min_replicas));
        self.actual_replicas
            .with_label_values(&[hpa, namespace])
            .set(f64::from(actual_replicas));
        self.request_rate
            .with_label_values(&[hpa, namespace])
            .set(request_rate);
    }

    pub fn encode(&self) -> Result<String, Error> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        Ok(String::from_utf8_lossy(&buffer).into_owned())
    }

    #[cfg(test)]
    pub fn processed_count(&self, namespace: &str, status: &str, initiator: &str) -> f64 {
        self.totals
            .with_label_values(&[namespace, status, initiator])
            .get()
    }

    #[cfg(test)]
    pub fn min_replicas_gauge(&self, hpa: &str, namespace: &str) -> f64 {
        self.min_replicas.with_label_values(&[hpa, namespace]).get()
    }
}

async fn metrics_handler(State(metrics): State<Arc<ScalerMetrics>>) -> impl IntoResponse {
    match metrics.encode() {
        Ok(body) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, prometheus::TEXT_FORMAT)],
            body,
        )
            .into_response(),
        Err(err) => {
            error!(target: "metrics", "encoding metrics failed: {}", err);
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

pub fn router(metrics: Arc<ScalerMetrics>) -> Router {
    Router::new()
        .route("/metrics", get(metrics_handler))
        .with_state(metrics)
}

/// Serves `/metrics` on `listener` until the shutdown flag flips.
pub async fn serve(
    listener: tokio::net::TcpListener,
    metrics: Arc<ScalerMetrics>,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    info!(target: "metrics", "Serving Prometheus metrics on {}", listener.local_addr()?);

    axum::serve(listener, router(metrics))
        .with_graceful_shutdown(async move { shutdown_requested(&mut shutdown).await })
        .await?;
    Ok(())
}
