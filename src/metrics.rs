/// Traffic metrics exported in the Prometheus text format
use prometheus::{Encoder, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};

use crate::events::TrafficEvent;

/// Metrics collector for the routing proxy
///
/// Each instance owns its registry, so independent fleets (and tests) never
/// share counters.
#[derive(Clone)]
pub struct Metrics {
    registry: Registry,
    /// Completed connections by method kind and action
    pub connections: IntCounterVec,
    /// Bytes forwarded to clients by action
    pub bytes_in: IntCounterVec,
    /// Bytes forwarded to destinations by action
    pub bytes_out: IntCounterVec,
    /// Tunnels whose routing used a ClientHello SNI hostname
    pub sni_resolved: IntCounter,
    /// Failed connections to upstreams or origins
    pub upstream_errors: IntCounter,
    /// Local listeners currently accepting
    pub listeners_running: IntGauge,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    /// Create a new metrics collector
    pub fn new() -> Self {
        let registry = Registry::new();

        let connections = IntCounterVec::new(
            Opts::new(
                "sni_router_connections_total",
                "Completed proxied connections",
            ),
            &["method", "action"],
        )
        .expect("static metric definition");
        let bytes_in = IntCounterVec::new(
            Opts::new(
                "sni_router_bytes_in_total",
                "Bytes forwarded from destinations to clients",
            ),
            &["action"],
        )
        .expect("static metric definition");
        let bytes_out = IntCounterVec::new(
            Opts::new(
                "sni_router_bytes_out_total",
                "Bytes forwarded from clients to destinations",
            ),
            &["action"],
        )
        .expect("static metric definition");
        let sni_resolved = IntCounter::new(
            "sni_router_sni_resolved_total",
            "Tunnels routed by ClientHello SNI hostname",
        )
        .expect("static metric definition");
        let upstream_errors = IntCounter::new(
            "sni_router_upstream_errors_total",
            "Failed connections to upstream proxies or origins",
        )
        .expect("static metric definition");
        let listeners_running = IntGauge::new(
            "sni_router_listeners_running",
            "Local proxy listeners currently accepting",
        )
        .expect("static metric definition");

        for collector in [
            Box::new(connections.clone()) as Box<dyn prometheus::core::Collector>,
            Box::new(bytes_in.clone()),
            Box::new(bytes_out.clone()),
            Box::new(sni_resolved.clone()),
            Box::new(upstream_errors.clone()),
            Box::new(listeners_running.clone()),
        ] {
            registry
                .register(collector)
                .expect("metric names are unique within the registry");
        }

        Self {
            registry,
            connections,
            bytes_in,
            bytes_out,
            sni_resolved,
            upstream_errors,
            listeners_running,
        }
    }

    /// Account a finished connection
    pub fn record_traffic(&self, event: &TrafficEvent) {
        if !event.is_closed() {
            return;
        }
        let action = event.action.as_str();
        let method = if event.method == "CONNECT" {
            "connect"
        } else {
            "http"
        };
        self.connections.with_label_values(&[method, action]).inc();
        self.bytes_in
            .with_label_values(&[action])
            .inc_by(event.bytes_in);
        self.bytes_out
            .with_label_values(&[action])
            .inc_by(event.bytes_out);
        if event.sni_hostname.is_some() {
            self.sni_resolved.inc();
        }
    }

    /// Record an upstream error
    pub fn record_upstream_error(&self) {
        self.upstream_errors.inc();
    }

    pub fn set_listeners_running(&self, count: usize) {
        self.listeners_running.set(count as i64);
    }

    /// Render every metric in the text exposition format
    pub fn render(&self) -> String {
        let mut buffer = Vec::new();
        let encoder = TextEncoder::new();
        if let Err(e) = encoder.encode(&self.registry.gather(), &mut buffer) {
            tracing::warn!("Failed to encode metrics: {}", e);
        }
        String::from_utf8(buffer).unwrap_or_default()
    }
}
