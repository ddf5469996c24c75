//! Prometheus metrics

use crate::config::MonitoringConfig;
use prometheus::{Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, Registry};
use std::sync::LazyLock;
use tokio::task::JoinHandle;
use tracing::{error, info};

/// Global metrics registry
static REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

/// Process-wide metric handles
pub static METRICS: LazyLock<Metrics> = LazyLock::new(Metrics::new);

/// Metrics struct
pub struct Metrics {
    // Counters
    pub frames_sent: IntCounter,
    pub frames_received: IntCounter,
    pub auth_outcomes: IntCounterVec,
    pub edge_evictions: IntCounter,
    pub dispatch_errors: IntCounterVec,

    // Gauges
    pub registered_edges: IntGauge,
    pub snapshot_version: IntGauge,
    pub active_sessions: IntGauge,

    // Histograms
    pub dispatch_duration: Histogram,
}

impl Metrics {
    pub fn new() -> Self {
        let frames_sent = IntCounter::with_opts(Opts::new(
            "chorus_frames_sent_total",
            "Total number of frames sent",
        ))
        .unwrap();

        let frames_received = IntCounter::with_opts(Opts::new(
            "chorus_frames_received_total",
            "Total number of frames received",
        ))
        .unwrap();

        let auth_outcomes = IntCounterVec::new(
            Opts::new(
                "chorus_auth_outcomes_total",
                "Authentication outcomes by source (session, cache, backend, fallback, rejected)",
            ),
            &["source"],
        )
        .unwrap();

        let edge_evictions = IntCounter::with_opts(Opts::new(
            "chorus_edge_evictions_total",
            "Edge nodes evicted for missing heartbeats",
        ))
        .unwrap();

        let dispatch_errors = IntCounterVec::new(
            Opts::new("chorus_dispatch_errors_total", "Rejected client commands by error code"),
            &["code"],
        )
        .unwrap();

        let registered_edges = IntGauge::with_opts(Opts::new(
            "chorus_registered_edges",
            "Number of registered edge nodes",
        ))
        .unwrap();

        let snapshot_version = IntGauge::with_opts(Opts::new(
            "chorus_acl_snapshot_version",
            "Version of the ACL snapshot currently in force",
        ))
        .unwrap();

        let active_sessions = IntGauge::with_opts(Opts::new(
            "chorus_active_sessions",
            "Number of connected client sessions",
        ))
        .unwrap();

        let dispatch_duration = Histogram::with_opts(
            HistogramOpts::new("chorus_dispatch_duration_seconds", "Client command duration in seconds")
                .buckets(vec![0.0005, 0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0]),
        )
        .unwrap();

        // Register metrics
        REGISTRY.register(Box::new(frames_sent.clone())).ok();
        REGISTRY.register(Box::new(frames_received.clone())).ok();
        REGISTRY.register(Box::new(auth_outcomes.clone())).ok();
        REGISTRY.register(Box::new(edge_evictions.clone())).ok();
        REGISTRY.register(Box::new(dispatch_errors.clone())).ok();
        REGISTRY.register(Box::new(registered_edges.clone())).ok();
        REGISTRY.register(Box::new(snapshot_version.clone())).ok();
        REGISTRY.register(Box::new(active_sessions.clone())).ok();
        REGISTRY.register(Box::new(dispatch_duration.clone())).ok();

        Self {
            frames_sent,
            frames_received,
            auth_outcomes,
            edge_evictions,
            dispatch_errors,
            registered_edges,
            snapshot_version,
            active_sessions,
            dispatch_duration,
        }
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Render the registry in the Prometheus text format
pub fn render() -> Vec<u8> {
    use prometheus::Encoder;

    LazyLock::force(&METRICS);
    let encoder = prometheus::TextEncoder::new();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&REGISTRY.gather(), &mut buffer) {
        error!("Failed to encode metrics: {}", e);
    }
    buffer
}

/// Start Prometheus metrics server
pub fn start_server(config: &MonitoringConfig) -> JoinHandle<()> {
    let bind = config.prometheus_bind;
    let enabled = config.prometheus_enabled;

    tokio::spawn(async move {
        if !enabled {
            info!("Prometheus metrics disabled");
            return;
        }

        use bytes::Bytes;
        use http_body_util::Full;
        use hyper::{Response, server::conn::http1, service::service_fn};
        use hyper_util::rt::TokioIo;

        let listener = match tokio::net::TcpListener::bind(bind).await {
            Ok(l) => l,
            Err(e) => {
                error!("Failed to bind metrics server: {}", e);
                return;
            }
        };

        info!("Prometheus metrics server listening on {}", bind);

        loop {
            let (stream, _) = match listener.accept().await {
                Ok(r) => r,
                Err(e) => {
                    error!("Metrics accept error: {}", e);
                    continue;
                }
            };

            let io = TokioIo::new(stream);

            tokio::spawn(async move {
                let service = service_fn(|_req| async {
                    let mut response = Response::new(Full::new(Bytes::from(render())));
                    response.headers_mut().insert(
                        hyper::header::CONTENT_TYPE,
                        hyper::header::HeaderValue::from_static("text/plain; version=0.0.4"),
                    );
                    Ok::<_, std::convert::Infallible>(response)
                });

                if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                    error!("Metrics connection error: {}", e);
                }
            });
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_contains_registered_families() {
        METRICS.auth_outcomes.with_label_values(&["cache"]).inc();
        METRICS.dispatch_errors.with_label_values(&["validation_error"]).inc();

        let text = String::from_utf8(render()).unwrap();
        assert!(text.contains("chorus_auth_outcomes_total{source=\"cache\"}"));
        assert!(text.contains("chorus_dispatch_errors_total{code=\"validation_error\"}"));
        assert!(text.contains("chorus_registered_edges"));
    }
}
