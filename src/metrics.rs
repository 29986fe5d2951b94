// Metrics module for the placement webhook
// Provides Prometheus metrics for admission decisions and reconciliation passes

use prometheus::{
    register_counter_vec, register_gauge_vec, register_histogram_vec, CounterVec, Encoder,
    GaugeVec, HistogramVec, TextEncoder,
};
use std::time::Instant;
use tracing::warn;
use warp::{Filter, Reply};

// Metric definitions
lazy_static::lazy_static! {
    // Webhook metrics
    static ref WEBHOOK_COUNTER: CounterVec = register_counter_vec!(
        "placement_webhook_requests_total",
        "Total webhook requests",
        &["webhook_type", "result"]
    ).unwrap();

    static ref WEBHOOK_DURATION: HistogramVec = register_histogram_vec!(
        "placement_webhook_duration_seconds",
        "Webhook request duration",
        &["webhook_type"],
        vec![0.01, 0.1, 0.5, 1.0, 2.5, 5.0, 10.0]
    ).unwrap();

    static ref DECISION_COUNTER: CounterVec = register_counter_vec!(
        "placement_decisions_total",
        "Placement decisions by outcome",
        &["outcome"]
    ).unwrap();

    // Reconciliation metrics
    static ref RECONCILE_COUNTER: CounterVec = register_counter_vec!(
        "placement_reconcile_total",
        "Total number of reconciliation passes",
        &["namespace", "deployment", "result"]
    ).unwrap();

    static ref RECONCILE_DURATION: HistogramVec = register_histogram_vec!(
        "placement_reconcile_duration_seconds",
        "Time spent in reconciliation",
        &["namespace", "deployment"],
        vec![0.1, 0.5, 1.0, 5.0, 10.0, 30.0]
    ).unwrap();

    static ref EVICTED_PODS: CounterVec = register_counter_vec!(
        "placement_evicted_pods_total",
        "Pods evicted to restore the declared distribution",
        &["namespace", "deployment"]
    ).unwrap();

    // Error metrics
    static ref ERROR_COUNTER: CounterVec = register_counter_vec!(
        "placement_errors_total",
        "Total number of errors by type",
        &["error_type", "namespace"]
    ).unwrap();

    static ref BUILD_INFO: GaugeVec = register_gauge_vec!(
        "placement_build_info",
        "Version and build info",
        &["version", "build_date", "git_commit"]
    ).unwrap();
}

/// Metrics collector shared by the webhook and the reconciler
#[derive(Clone)]
pub struct MetricsCollector {
    start_time: Instant,
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsCollector {
    pub fn new() -> Self {
        let build_date = std::env::var("BUILD_DATE").unwrap_or_else(|_| "unknown".to_string());
        let git_commit = std::env::var("GIT_COMMIT").unwrap_or_else(|_| "unknown".to_string());
        BUILD_INFO
            .with_label_values(&[
                env!("CARGO_PKG_VERSION"),
                build_date.as_str(),
                git_commit.as_str(),
            ])
            .set(1.0);

        Self {
            start_time: Instant::now(),
        }
    }

    /// Start timing a reconciliation
    pub fn start_reconcile(&self, namespace: &str, deployment: &str) -> ReconcileTimer {
        ReconcileTimer {
            namespace: namespace.to_string(),
            deployment: deployment.to_string(),
            start: Instant::now(),
        }
    }

    /// Start timing a webhook request
    pub fn start_webhook(&self, webhook_type: &str) -> WebhookTimer {
        WebhookTimer {
            webhook_type: webhook_type.to_string(),
            start: Instant::now(),
        }
    }

    pub fn record_decision(&self, outcome: &str) {
        DECISION_COUNTER.with_label_values(&[outcome]).inc();
    }

    pub fn record_evictions(&self, namespace: &str, deployment: &str, count: usize) {
        EVICTED_PODS
            .with_label_values(&[namespace, deployment])
            .inc_by(count as f64);
    }

    /// Record error occurrence
    pub fn record_error(&self, error_type: &str, namespace: &str) {
        ERROR_COUNTER
            .with_label_values(&[error_type, namespace])
            .inc();
    }

    pub fn uptime_seconds(&self) -> f64 {
        self.start_time.elapsed().as_secs_f64()
    }
}

/// Timer for tracking reconciliation duration
pub struct ReconcileTimer {
    namespace: String,
    deployment: String,
    start: Instant,
}

impl ReconcileTimer {
    pub fn success(self) {
        self.finish("success");
    }

    pub fn error(self, error_type: &str) {
        ERROR_COUNTER
            .with_label_values(&[error_type, self.namespace.as_str()])
            .inc();
        self.finish("error");
    }

    fn finish(self, result: &str) {
        RECONCILE_COUNTER
            .with_label_values(&[self.namespace.as_str(), self.deployment.as_str(), result])
            .inc();

        RECONCILE_DURATION
            .with_label_values(&[self.namespace.as_str(), self.deployment.as_str()])
            .observe(self.start.elapsed().as_secs_f64());
    }
}

/// Timer for tracking webhook duration
pub struct WebhookTimer {
    webhook_type: String,
    start: Instant,
}

impl WebhookTimer {
    /// Complete the request; `result` is e.g. "allowed", "rejected" or "invalid"
    pub fn finish(self, result: &str) {
        WEBHOOK_COUNTER
            .with_label_values(&[self.webhook_type.as_str(), result])
            .inc();

        WEBHOOK_DURATION
            .with_label_values(&[self.webhook_type.as_str()])
            .observe(self.start.elapsed().as_secs_f64());
    }
}

/// Create metrics endpoint for Prometheus scraping
pub fn metrics_handler() -> impl Filter<Extract = impl Reply, Error = warp::Rejection> + Clone {
    warp::path("metrics")
        .and(warp::get())
        .map(|| {
            let encoder = TextEncoder::new();
            let mut buffer = Vec::new();
            if let Err(error) = encoder.encode(&prometheus::gather(), &mut buffer) {
                warn!(%error, "failed to encode metrics");
            }
            String::from_utf8_lossy(&buffer).into_owned()
        })
        .map(|metrics: String| {
            warp::reply::with_header(
                metrics,
                "content-type",
                "text/plain; version=0.0.4; charset=utf-8",
            )
        })
}

/// Health check endpoint
pub fn health_handler(
    collector: MetricsCollector,
) -> impl Filter<Extract = impl Reply, Error = warp::Rejection> + Clone {
    warp::path("health").and(warp::get()).map(move || {
        warp::reply::json(&serde_json::json!({
            "status": "healthy",
            "timestamp": chrono::Utc::now().to_rfc3339(),
            "uptimeSeconds": collector.uptime_seconds(),
            "version": env!("CARGO_PKG_VERSION")
        }))
    })
}

/// Readiness check endpoint
pub fn ready_handler() -> impl Filter<Extract = impl Reply, Error = warp::Rejection> + Clone {
    warp::path("ready").and(warp::get()).map(|| {
        warp::reply::json(&serde_json::json!({
            "status": "ready",
            "timestamp": chrono::Utc::now().to_rfc3339()
        }))
    })
}
