use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use prometheus::{
    Counter, CounterVec, Encoder, Gauge, Histogram, HistogramOpts, Opts, Registry, TextEncoder,
};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::reconcile::{AnomalyKind, Outcome, Resolution};

const NAMESPACE: &str = "streamprobe";

/// Prometheus metrics for a running benchmark.
///
/// All metrics use the "streamprobe" namespace. Metrics are always recorded;
/// the HTTP server exposing them is optional.
pub struct HealthMetrics {
    registry: Registry,
    addr: String,
    shutdown: parking_lot::Mutex<Option<CancellationToken>>,

    /// Messages handed to the transport.
    pub messages_sent: Counter,
    /// Messages matched in order.
    pub messages_arrived: Counter,
    /// Payload bytes carried by decoded arrivals.
    pub arrived_bytes: Counter,
    /// Messages promoted from never-arrived by a late arrival.
    pub messages_arrived_too_late: Counter,
    /// Ledger entries drained into never-arrived, including the final sweep.
    pub messages_drained: Counter,
    /// Arrivals that could not be resolved, by kind.
    pub anomalies: CounterVec,
    /// Failed socket reads in transport receive loops.
    pub receive_errors: Counter,
    /// Current send rate in Hz.
    pub send_rate: Gauge,
    /// Ledger entries awaiting resolution.
    pub ledger_depth: Gauge,
    /// Last sampled host CPU usage percent.
    pub cpu_usage: Gauge,
    /// Last sampled host memory usage percent.
    pub memory_usage: Gauge,
    /// End-to-end latency of matched arrivals (50us-1s buckets).
    pub latency: Histogram,
}

impl HealthMetrics {
    /// Creates a new health metrics instance with all metrics registered.
    pub fn new(addr: &str) -> Result<Self> {
        let registry = Registry::new();

        let messages_sent = Counter::with_opts(
            Opts::new("messages_sent_total", "Total messages handed to the transport.")
                .namespace(NAMESPACE),
        )?;
        let messages_arrived = Counter::with_opts(
            Opts::new(
                "messages_arrived_total",
                "Total messages that arrived in order.",
            )
            .namespace(NAMESPACE),
        )?;
        let arrived_bytes = Counter::with_opts(
            Opts::new(
                "arrived_payload_bytes_total",
                "Total payload bytes carried by decoded arrivals.",
            )
            .namespace(NAMESPACE),
        )?;
        let messages_arrived_too_late = Counter::with_opts(
            Opts::new(
                "messages_arrived_too_late_total",
                "Total messages that arrived after being declared lost.",
            )
            .namespace(NAMESPACE),
        )?;
        let messages_drained = Counter::with_opts(
            Opts::new(
                "messages_drained_total",
                "Total ledger entries declared never-arrived.",
            )
            .namespace(NAMESPACE),
        )?;
        let anomalies = CounterVec::new(
            Opts::new("anomalies_total", "Total unresolvable arrivals by kind.")
                .namespace(NAMESPACE),
            &["kind"],
        )?;
        let receive_errors = Counter::with_opts(
            Opts::new(
                "receive_errors_total",
                "Total failed reads in transport receive loops.",
            )
            .namespace(NAMESPACE),
        )?;
        let send_rate = Gauge::with_opts(
            Opts::new("send_rate_hz", "Current send rate in messages per second.")
                .namespace(NAMESPACE),
        )?;
        let ledger_depth = Gauge::with_opts(
            Opts::new("ledger_depth", "Ledger entries awaiting resolution.").namespace(NAMESPACE),
        )?;
        let cpu_usage = Gauge::with_opts(
            Opts::new("cpu_usage_percent", "Last sampled host CPU usage.").namespace(NAMESPACE),
        )?;
        let memory_usage = Gauge::with_opts(
            Opts::new("memory_usage_percent", "Last sampled host memory usage.")
                .namespace(NAMESPACE),
        )?;
        let latency = Histogram::with_opts(
            HistogramOpts::new(
                "latency_seconds",
                "End-to-end latency of messages that arrived in order.",
            )
            .namespace(NAMESPACE)
            .buckets(vec![
                0.00005, 0.0001, 0.00025, 0.0005, 0.001, 0.0025, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0,
            ]),
        )?;

        registry.register(Box::new(messages_sent.clone()))?;
        registry.register(Box::new(messages_arrived.clone()))?;
        registry.register(Box::new(arrived_bytes.clone()))?;
        registry.register(Box::new(messages_arrived_too_late.clone()))?;
        registry.register(Box::new(messages_drained.clone()))?;
        registry.register(Box::new(anomalies.clone()))?;
        registry.register(Box::new(receive_errors.clone()))?;
        registry.register(Box::new(send_rate.clone()))?;
        registry.register(Box::new(ledger_depth.clone()))?;
        registry.register(Box::new(cpu_usage.clone()))?;
        registry.register(Box::new(memory_usage.clone()))?;
        registry.register(Box::new(latency.clone()))?;

        Ok(Self {
            registry,
            addr: addr.to_string(),
            shutdown: parking_lot::Mutex::new(None),
            messages_sent,
            messages_arrived,
            arrived_bytes,
            messages_arrived_too_late,
            messages_drained,
            anomalies,
            receive_errors,
            send_rate,
            ledger_depth,
            cpu_usage,
            memory_usage,
            latency,
        })
    }

    /// Record the outcome of one arrival.
    pub fn observe_resolution(&self, resolution: &Resolution) {
        if resolution.drained > 0 {
            self.messages_drained.inc_by(resolution.drained as f64);
        }

        match &resolution.outcome {
            Outcome::Arrived(record) => {
                self.messages_arrived.inc();
                self.latency.observe(record.latency_ns() as f64 / 1e9);
            }
            Outcome::ArrivedTooLate(_) => self.messages_arrived_too_late.inc(),
            Outcome::Anomaly(kind) => self.observe_anomaly(*kind),
        }
    }

    pub fn observe_anomaly(&self, kind: AnomalyKind) {
        self.anomalies.with_label_values(&[kind.as_str()]).inc();
    }

    /// Render every registered metric in the Prometheus text format.
    pub fn render(&self) -> Result<String> {
        render_registry(&self.registry)
    }

    /// Starts the HTTP server serving /metrics and /healthz.
    ///
    /// Returns the bound address, which differs from the configured one when
    /// an ephemeral port was requested.
    pub async fn start(&self) -> Result<SocketAddr> {
        let addr = if self.addr.is_empty() {
            ":9090"
        } else {
            &self.addr
        };

        // Parse address, handling ":port" shorthand.
        let bind_addr = if addr.starts_with(':') {
            format!("0.0.0.0{addr}")
        } else {
            addr.to_string()
        };

        let app_state = Arc::new(AppState {
            registry: self.registry.clone(),
        });

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

fn render_registry(registry: &Registry) -> Result<String> {
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
    match render_registry(&state.registry) {
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
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;

    use super::*;
    use crate::reconcile::{ArrivedRecord, Resolution};

    #[test]
    fn test_observe_resolution_updates_counters() {
        let metrics = HealthMetrics::new("127.0.0.1:0").expect("metrics");

        metrics.observe_resolution(&Resolution {
            outcome: Outcome::Arrived(ArrivedRecord {
                id: 3,
                sent_ns: 1_000,
                received_ns: 251_000,
            }),
            drained: 2,
        });
        metrics.observe_resolution(&Resolution {
            outcome: Outcome::Anomaly(AnomalyKind::UnknownId),
            drained: 0,
        });

        assert_eq!(metrics.messages_arrived.get(), 1.0);
        assert_eq!(metrics.messages_drained.get(), 2.0);
        assert_eq!(metrics.latency.get_sample_count(), 1);
        assert_eq!(
            metrics
                .anomalies
                .with_label_values(&["unknown_id"])
                .get(),
            1.0
        );
    }

    #[test]
    fn test_render_contains_namespace() {
        let metrics = HealthMetrics::new("127.0.0.1:0").expect("metrics");
        metrics.messages_sent.inc_by(5.0);

        let text = metrics.render().expect("render");
        assert!(text.contains("streamprobe_messages_sent_total 5"), "{text}");
    }

    #[tokio::test]
    async fn test_server_serves_healthz() {
        let metrics = HealthMetrics::new("127.0.0.1:0").expect("metrics");
        let addr = metrics.start().await.expect("start");

        let mut stream = TcpStream::connect(addr).await.expect("connect");
        stream
            .write_all(b"GET /healthz HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
            .await
            .expect("write");

        let mut response = String::new();
        stream
            .read_to_string(&mut response)
            .await
            .expect("read");

        assert!(response.starts_with("HTTP/1.1 200"), "{response}");
        assert!(response.ends_with("ok"), "{response}");

        metrics.stop().await.expect("stop");
    }
}
