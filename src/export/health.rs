use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use prometheus::{
    Counter, CounterVec, Encoder, Gauge, Histogram, HistogramOpts, HistogramVec, Opts, Registry,
    TextEncoder,
};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::config::resolve_bind_addr;

const NAMESPACE: &str = "therapy";

/// Prometheus metrics for the telemetry server.
///
/// All metrics use the "therapy" namespace.
pub struct HealthMetrics {
    registry: Registry,
    addr: String,
    shutdown: parking_lot::Mutex<Option<CancellationToken>>,

    // === Ingest ===
    /// Total inbound text frames.
    pub messages_received: Counter,
    /// Rejected frames by validation reason.
    pub messages_rejected: CounterVec,
    /// Time from decode to broadcast for one accepted message.
    pub message_processing_duration: Histogram,
    /// Open WebSocket connections.
    pub connections_active: Gauge,
    /// Outbound notifications dropped because a connection was closed or full.
    pub broadcast_dropped: Counter,

    // === Sessions ===
    pub sessions_tracked: Gauge,
    pub session_transitions: CounterVec,

    // === Record store ===
    /// Observations accepted by the record store by kind.
    pub observations_persisted: CounterVec,
    /// Failed record store operations by operation.
    pub upstream_errors: CounterVec,
    pub record_requests_total: CounterVec,
    pub record_request_duration: HistogramVec,

    // === Reports ===
    pub reports_emitted: Counter,
    pub reports_skipped: Counter,
    pub reports_failed: Counter,
}

impl HealthMetrics {
    pub fn new(addr: &str) -> Result<Self> {
        let registry = Registry::new();

        // === Ingest ===
        let messages_received = Counter::with_opts(
            Opts::new(
                "messages_received_total",
                "Total inbound telemetry frames.",
            )
            .namespace(NAMESPACE),
        )?;
        let messages_rejected = CounterVec::new(
            Opts::new(
                "messages_rejected_total",
                "Total rejected telemetry frames by reason.",
            )
            .namespace(NAMESPACE),
            &["reason"],
        )?;
        let message_processing_duration = Histogram::with_opts(
            HistogramOpts::new(
                "message_processing_duration_seconds",
                "Time to apply, persist and broadcast one accepted message.",
            )
            .namespace(NAMESPACE)
            .buckets(vec![0.0001, 0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0]),
        )?;
        let connections_active = Gauge::with_opts(
            Opts::new("connections_active", "Number of open WebSocket connections.")
                .namespace(NAMESPACE),
        )?;
        let broadcast_dropped = Counter::with_opts(
            Opts::new(
                "broadcast_dropped_total",
                "Total notifications dropped for closed or full connections.",
            )
            .namespace(NAMESPACE),
        )?;

        // === Sessions ===
        let sessions_tracked = Gauge::with_opts(
            Opts::new("sessions_tracked", "Number of device sessions tracked.")
                .namespace(NAMESPACE),
        )?;
        let session_transitions = CounterVec::new(
            Opts::new(
                "session_transitions_total",
                "Total session state transitions by transition.",
            )
            .namespace(NAMESPACE),
            &["transition"],
        )?;

        // === Record store ===
        let observations_persisted = CounterVec::new(
            Opts::new(
                "observations_persisted_total",
                "Total observations accepted by the record store by kind.",
            )
            .namespace(NAMESPACE),
            &["kind"],
        )?;
        let upstream_errors = CounterVec::new(
            Opts::new(
                "upstream_errors_total",
                "Total failed record store operations by operation.",
            )
            .namespace(NAMESPACE),
            &["operation"],
        )?;
        let record_requests_total = CounterVec::new(
            Opts::new(
                "record_requests_total",
                "Total record store HTTP requests by operation and status.",
            )
            .namespace(NAMESPACE),
            &["operation", "status"],
        )?;
        let record_request_duration = HistogramVec::new(
            HistogramOpts::new(
                "record_request_duration_seconds",
                "Record store HTTP request duration by operation.",
            )
            .namespace(NAMESPACE)
            .buckets(vec![0.01, 0.05, 0.1, 0.5, 1.0, 5.0]),
            &["operation"],
        )?;

        // === Reports ===
        let reports_emitted = Counter::with_opts(
            Opts::new(
                "reports_emitted_total",
                "Total session reports accepted by the record store.",
            )
            .namespace(NAMESPACE),
        )?;
        let reports_skipped = Counter::with_opts(
            Opts::new(
                "reports_skipped_total",
                "Total ended sessions with nothing to report.",
            )
            .namespace(NAMESPACE),
        )?;
        let reports_failed = Counter::with_opts(
            Opts::new(
                "reports_failed_total",
                "Total session reports the record store did not accept.",
            )
            .namespace(NAMESPACE),
        )?;

        registry.register(Box::new(messages_received.clone()))?;
        registry.register(Box::new(messages_rejected.clone()))?;
        registry.register(Box::new(message_processing_duration.clone()))?;
        registry.register(Box::new(connections_active.clone()))?;
        registry.register(Box::new(broadcast_dropped.clone()))?;
        registry.register(Box::new(sessions_tracked.clone()))?;
        registry.register(Box::new(session_transitions.clone()))?;
        registry.register(Box::new(observations_persisted.clone()))?;
        registry.register(Box::new(upstream_errors.clone()))?;
        registry.register(Box::new(record_requests_total.clone()))?;
        registry.register(Box::new(record_request_duration.clone()))?;
        registry.register(Box::new(reports_emitted.clone()))?;
        registry.register(Box::new(reports_skipped.clone()))?;
        registry.register(Box::new(reports_failed.clone()))?;

        Ok(Self {
            registry,
            addr: addr.to_string(),
            shutdown: parking_lot::Mutex::new(None),
            messages_received,
            messages_rejected,
            message_processing_duration,
            connections_active,
            broadcast_dropped,
            sessions_tracked,
            session_transitions,
            observations_persisted,
            upstream_errors,
            record_requests_total,
            record_request_duration,
            reports_emitted,
            reports_skipped,
            reports_failed,
        })
    }

    /// Records one record store request. Matches the client metrics
    /// callback signature.
    pub fn observe_record_request(
        &self,
        operation: &str,
        status: &str,
        duration: std::time::Duration,
    ) {
        self.record_requests_total
            .with_label_values(&[operation, status])
            .inc();
        self.record_request_duration
            .with_label_values(&[operation])
            .observe(duration.as_secs_f64());
    }

    /// Starts the HTTP server serving /metrics and /healthz. Returns the
    /// bound address.
    pub async fn start(&self) -> Result<SocketAddr> {
        let addr = if self.addr.is_empty() {
            ":9090"
        } else {
            &self.addr
        };

        let bind_addr = resolve_bind_addr(addr);

        let registry = self.registry.clone();
        let app_state = Arc::new(AppState { registry });

        let app = Router::new()
            .route("/metrics", get(metrics_handler))
            .route("/healthz", get(healthz_handler))
            .with_state(app_state);

        let listener = TcpListener::bind(&bind_addr)
            .await
            .with_context(|| format!("listening on {bind_addr}"))?;

        let local_addr = listener.local_addr().context("getting local address")?;

        let cancel = CancellationToken::new();
        *self.shutdown.lock() = Some(cancel.clone());

        tokio::spawn(async move {
            tracing::info!(addr = %local_addr, "health metrics server started");

            let result = axum::serve(
                listener,
                app.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .with_graceful_shutdown(async move {
                cancel.cancelled().await;
            })
            .await;

            if let Err(e) = result {
                tracing::error!(error = %e, "health metrics server error");
            }
        });

        Ok(local_addr)
    }

    /// Gracefully shuts down the health metrics server.
    pub async fn stop(&self) -> Result<()> {
        if let Some(cancel) = self.shutdown.lock().take() {
            cancel.cancel();
        }

        Ok(())
    }
}

/// Shared state for axum handlers.
struct AppState {
    registry: Registry,
}

fn encode_metrics(registry: &Registry) -> Result<String> {
    let encoder = TextEncoder::new();
    let metric_families = registry.gather();

    let mut buffer = Vec::new();
    encoder
        .encode(&metric_families, &mut buffer)
        .context("encoding metrics")?;

    String::from_utf8(buffer).context("converting metrics to string")
}

/// GET /metrics - Prometheus text format.
async fn metrics_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match encode_metrics(&state.registry) {
        Ok(text) => (StatusCode::OK, text),
        Err(e) => {
            tracing::error!(error = %e, "rendering metrics");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                "encoding error".to_string(),
            )
        }
    }
}

/// GET /healthz - Simple health check.
async fn healthz_handler() -> &'static str {
    "ok"
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_uses_namespace() {
        let metrics = HealthMetrics::new(":0").expect("metrics register");
        metrics.messages_received.inc();
        metrics
            .messages_rejected
            .with_label_values(&["missing_device_id"])
            .inc();
        metrics.observe_record_request(
            "create_observation",
            "success",
            std::time::Duration::from_millis(20),
        );

        let text = encode_metrics(&metrics.registry).expect("renders");
        assert!(text.contains("therapy_messages_received_total 1"));
        assert!(text.contains("therapy_messages_rejected_total{reason=\"missing_device_id\"} 1"));
        assert!(text.contains(
            "therapy_record_requests_total{operation=\"create_observation\",status=\"success\"} 1"
        ));
        assert!(text.contains("therapy_record_request_duration_seconds_count"));
    }

    #[tokio::test]
    async fn test_serves_healthz_and_metrics() {
        let metrics = HealthMetrics::new("127.0.0.1:0").expect("metrics register");
        metrics.reports_emitted.inc();
        let addr = metrics.start().await.expect("server starts");

        let client = reqwest::Client::new();
        let body = client
            .get(format!("http://{addr}/healthz"))
            .send()
            .await
            .expect("healthz request")
            .text()
            .await
            .expect("healthz body");
        assert_eq!(body, "ok");

        let body = client
            .get(format!("http://{addr}/metrics"))
            .send()
            .await
            .expect("metrics request")
            .text()
            .await
            .expect("metrics body");
        assert!(body.contains("therapy_reports_emitted_total 1"));

        metrics.stop().await.expect("stops");
    }
}
