use std::net::SocketAddr;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use prometheus::{
    Counter, CounterVec, Encoder, Gauge, Histogram, HistogramOpts, Opts, Registry, TextEncoder,
};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// Prometheus metrics for monitor health.
///
/// All metrics use the "pingwatch" namespace. They are updated by the
/// monitoring loop whether or not the HTTP server is running.
pub struct HealthMetrics {
    registry: Registry,
    addr: String,
    shutdown: parking_lot::Mutex<Option<CancellationToken>>,

    /// Total lines read from the probe process.
    pub lines_received: Counter,
    /// Lines discarded by the parser, by reason.
    pub lines_malformed: CounterVec,
    /// Points written, by outcome (reply/timeout).
    pub points_written: CounterVec,
    /// Failed point writes.
    pub write_errors: Counter,
    /// Point write duration (1ms-5s buckets).
    pub write_duration: Histogram,
    /// Number of configured targets.
    pub targets: Gauge,
}

impl HealthMetrics {
    /// Registers every metric. `addr` is only used by `start`.
    pub fn new(addr: &str) -> Result<Self> {
        let registry = Registry::new();

        let lines_received = Counter::with_opts(
            Opts::new(
                "lines_received_total",
                "Total lines read from the probe process.",
            )
            .namespace("pingwatch"),
        )?;
        let lines_malformed = CounterVec::new(
            Opts::new(
                "lines_malformed_total",
                "Probe output lines discarded by the parser.",
            )
            .namespace("pingwatch"),
            &["reason"],
        )?;
        let points_written = CounterVec::new(
            Opts::new("points_written_total", "Points written to the store.")
                .namespace("pingwatch"),
            &["outcome"],
        )?;
        let write_errors = Counter::with_opts(
            Opts::new("write_errors_total", "Failed point writes.").namespace("pingwatch"),
        )?;
        let write_duration = Histogram::with_opts(
            HistogramOpts::new("write_duration_seconds", "Point write duration.")
                .namespace("pingwatch")
                .buckets(vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0]),
        )?;
        let targets = Gauge::with_opts(
            Opts::new("targets", "Number of configured targets.").namespace("pingwatch"),
        )?;

        registry.register(Box::new(lines_received.clone()))?;
        registry.register(Box::new(lines_malformed.clone()))?;
        registry.register(Box::new(points_written.clone()))?;
        registry.register(Box::new(write_errors.clone()))?;
        registry.register(Box::new(write_duration.clone()))?;
        registry.register(Box::new(targets.clone()))?;

        Ok(Self {
            registry,
            addr: addr.to_string(),
            shutdown: parking_lot::Mutex::new(None),
            lines_received,
            lines_malformed,
            points_written,
            write_errors,
            write_duration,
            targets,
        })
    }

    /// Renders all metrics in the Prometheus text format.
    pub fn render(&self) -> Result<String> {
        encode_registry(&self.registry)
    }

    /// Serves /metrics and /healthz until `stop` is called.
    ///
    /// Returns the bound address, which differs from the configured one when
    /// port 0 is requested.
    pub async fn start(&self) -> Result<SocketAddr> {
        let bind_addr = bind_address(&self.addr);
        let listener = TcpListener::bind(&bind_addr)
            .await
            .with_context(|| format!("binding health server to {bind_addr}"))?;
        let local_addr = listener.local_addr().context("reading bound address")?;

        let token = CancellationToken::new();
        if let Some(previous) = self.shutdown.lock().replace(token.clone()) {
            previous.cancel();
        }

        let app = router(self.registry.clone());
        tokio::spawn(async move {
            info!(addr = %local_addr, "health server listening");

            let served = axum::serve(listener, app)
                .with_graceful_shutdown(token.cancelled_owned())
                .await;

            match served {
                Ok(()) => debug!(addr = %local_addr, "health server stopped"),
                Err(e) => error!(error = %e, "health server failed"),
            }
        });

        Ok(local_addr)
    }

    /// Stops the HTTP server, if running. Metrics keep counting.
    pub async fn stop(&self) {
        let token = self.shutdown.lock().take();
        if let Some(token) = token {
            token.cancel();
        }
    }

    /// Returns true while the HTTP server is running.
    pub fn is_serving(&self) -> bool {
        self.shutdown.lock().is_some()
    }
}

/// Expands the `:port` shorthand to all interfaces.
fn bind_address(addr: &str) -> String {
    match addr {
        "" => "0.0.0.0:9090".to_string(),
        a if a.starts_with(':') => format!("0.0.0.0{a}"),
        a => a.to_string(),
    }
}

fn router(registry: Registry) -> Router {
    Router::new()
        .route("/metrics", get(serve_metrics))
        .route("/healthz", get(|| async { "ok" }))
        .with_state(registry)
}

fn encode_registry(registry: &Registry) -> Result<String> {
    let mut buffer = Vec::with_capacity(4096);
    TextEncoder::new()
        .encode(&registry.gather(), &mut buffer)
        .context("encoding metrics")?;

    String::from_utf8(buffer).context("metrics output is not UTF-8")
}

async fn serve_metrics(State(registry): State<Registry>) -> Response {
    match encode_registry(&registry) {
        Ok(body) => body.into_response(),
        Err(e) => {
            error!(error = %e, "rendering /metrics");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_contains_namespaced_metrics() {
        let health = HealthMetrics::new(":0").expect("metrics");
        health.lines_received.inc();
        health
            .lines_malformed
            .with_label_values(&["too_few_tokens"])
            .inc();
        health.points_written.with_label_values(&["timeout"]).inc();

        let text = health.render().expect("render");
        assert!(text.contains("pingwatch_lines_received_total 1"));
        assert!(text.contains("pingwatch_lines_malformed_total{reason=\"too_few_tokens\"} 1"));
        assert!(text.contains("pingwatch_points_written_total{outcome=\"timeout\"} 1"));
    }

    #[test]
    fn test_bind_address() {
        assert_eq!(bind_address(":9090"), "0.0.0.0:9090");
        assert_eq!(bind_address(""), "0.0.0.0:9090");
        assert_eq!(bind_address("127.0.0.1:0"), "127.0.0.1:0");
    }

    #[tokio::test]
    async fn test_server_serves_healthz_and_metrics() {
        let health = HealthMetrics::new("127.0.0.1:0").expect("metrics");
        health.targets.set(3.0);
        let addr = health.start().await.expect("start");

        let healthz = reqwest::get(format!("http://{addr}/healthz"))
            .await
            .expect("request");
        assert_eq!(healthz.status(), reqwest::StatusCode::OK);
        assert_eq!(healthz.text().await.expect("body"), "ok");

        let metrics = reqwest::get(format!("http://{addr}/metrics"))
            .await
            .expect("request")
            .text()
            .await
            .expect("body");
        assert!(metrics.contains("pingwatch_targets 3"));

        assert!(health.is_serving());
        health.stop().await;
        assert!(!health.is_serving());
    }

    #[tokio::test]
    async fn test_stop_is_infallible_and_idempotent() {
        let health = HealthMetrics::new("127.0.0.1:0").expect("metrics");
        health.stop().await;

        health.start().await.expect("start");
        health.stop().await;
        health.stop().await;

        health.lines_received.inc();
        assert!(health
            .render()
            .expect("render")
            .contains("pingwatch_lines_received_total 1"));
    }
}
