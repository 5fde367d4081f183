//! # Prometheus Metrics
//!
//! Operational metrics for a connected agent, scraped at `/metrics` on the
//! port given to `connect --metrics-port`.
//!
//! All metrics live in a dedicated [`prometheus::Registry`] with the
//! `agentmesh` prefix so they do not collide with any default global
//! registry consumers.

use std::sync::Arc;
use std::time::Duration;

use agentmesh_protocol::{MeshResult, NodeStatus, SessionState};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
    TextEncoder,
};

/// Metric handles for one agent. Cloning shares the underlying metrics.
#[derive(Clone)]
pub struct AgentMetrics {
    registry: Registry,
    /// Outbound calls made by this agent.
    pub calls_total: IntCounter,
    /// Outbound calls that failed, by error class.
    pub call_failures_total: IntCounterVec,
    /// Outbound call latency in seconds.
    pub call_latency_seconds: Histogram,
    /// Inbound requests served by the built-in handlers.
    pub requests_served_total: IntCounter,
    /// Session reconnects since start.
    pub reconnects_total: IntCounter,
    /// Unexpired peers in the discovery cache.
    pub known_peers: IntGauge,
    /// Session state: 0 disconnected, 1 connecting, 2 connected,
    /// 3 reconnecting, 4 closed.
    pub session_state: IntGauge,
    /// 1 while the session runs through a relay.
    pub relay_in_use: IntGauge,
}

impl AgentMetrics {
    /// Creates and registers all metrics.
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new_custom(Some("agentmesh".into()), None)?;

        let calls_total = IntCounter::new("calls_total", "Outbound calls made")?;
        registry.register(Box::new(calls_total.clone()))?;

        let call_failures_total = IntCounterVec::new(
            Opts::new("call_failures_total", "Outbound calls that failed"),
            &["reason"],
        )?;
        registry.register(Box::new(call_failures_total.clone()))?;

        let call_latency_seconds = Histogram::with_opts(
            HistogramOpts::new("call_latency_seconds", "Outbound call latency in seconds")
                .buckets(vec![0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0]),
        )?;
        registry.register(Box::new(call_latency_seconds.clone()))?;

        let requests_served_total =
            IntCounter::new("requests_served_total", "Inbound requests served")?;
        registry.register(Box::new(requests_served_total.clone()))?;

        let reconnects_total = IntCounter::new("reconnects_total", "Session reconnects")?;
        registry.register(Box::new(reconnects_total.clone()))?;

        let known_peers = IntGauge::new("known_peers", "Unexpired peers in the discovery cache")?;
        registry.register(Box::new(known_peers.clone()))?;

        let session_state = IntGauge::new("session_state", "Current session state")?;
        registry.register(Box::new(session_state.clone()))?;

        let relay_in_use = IntGauge::new("relay_in_use", "Whether the session uses a relay")?;
        registry.register(Box::new(relay_in_use.clone()))?;

        Ok(Self {
            registry,
            calls_total,
            call_failures_total,
            call_latency_seconds,
            requests_served_total,
            reconnects_total,
            known_peers,
            session_state,
            relay_in_use,
        })
    }

    /// Records one outbound call.
    pub fn observe_call<T>(&self, result: &MeshResult<T>, elapsed: Duration) {
        self.calls_total.inc();
        self.call_latency_seconds.observe(elapsed.as_secs_f64());
        if let Err(e) = result {
            self.call_failures_total
                .with_label_values(&[failure_reason(e)])
                .inc();
        }
    }

    /// Folds a status snapshot into the gauges. `reconnects` in the status is
    /// cumulative; the counter advances by the difference.
    pub fn observe_status(&self, status: &NodeStatus) {
        self.session_state.set(state_code(status.state));
        self.known_peers.set(status.known_peers as i64);
        self.relay_in_use.set(i64::from(status.relay_in_use));
        let seen = self.reconnects_total.get();
        if status.reconnects > seen {
            self.reconnects_total.inc_by(status.reconnects - seen);
        }
    }

    /// Encodes all registered metrics into the Prometheus text exposition format.
    pub fn encode(&self) -> Result<String, prometheus::Error> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&metric_families, &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}

fn state_code(state: SessionState) -> i64 {
    match state {
        SessionState::Disconnected => 0,
        SessionState::Connecting => 1,
        SessionState::Connected => 2,
        SessionState::Reconnecting => 3,
        SessionState::Closed => 4,
    }
}

fn failure_reason(e: &agentmesh_protocol::MeshError) -> &'static str {
    use agentmesh_protocol::MeshError;
    match e {
        MeshError::NotConnected => "not_connected",
        MeshError::PeerUnreachable { .. } => "unreachable",
        MeshError::Authentication(_) => "authentication",
        MeshError::Remote { .. } => "remote",
        MeshError::InvalidResponse { .. } => "invalid_response",
        _ => "other",
    }
}

/// Shared metrics state passed to axum handlers.
pub type SharedMetrics = Arc<AgentMetrics>;

/// Axum handler that renders `/metrics` in Prometheus text format.
pub async fn metrics_handler(
    axum::extract::State(metrics): axum::extract::State<SharedMetrics>,
) -> impl IntoResponse {
    match metrics.encode() {
        Ok(body) => (
            StatusCode::OK,
            [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
            body,
        )
            .into_response(),
        Err(e) => {
            tracing::error!(error = %e, "failed to encode metrics");
            (StatusCode::INTERNAL_SERVER_ERROR, "metrics encoding failed").into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use agentmesh_protocol::{Identity, MeshError};

    fn status(state: SessionState, reconnects: u64) -> NodeStatus {
        NodeStatus {
            peer_id: Identity::ephemeral().peer_id().clone(),
            state,
            endpoint: None,
            relay_in_use: true,
            retry_count: 0,
            reconnects,
            known_peers: 3,
            announcing: false,
            certificate: None,
        }
    }

    #[test]
    fn status_folds_into_gauges() {
        let m = AgentMetrics::new().unwrap();
        m.observe_status(&status(SessionState::Connected, 2));
        m.observe_status(&status(SessionState::Reconnecting, 2));
        m.observe_status(&status(SessionState::Connected, 3));
        assert_eq!(m.session_state.get(), 2);
        assert_eq!(m.reconnects_total.get(), 3);
        assert_eq!(m.known_peers.get(), 3);
        assert_eq!(m.relay_in_use.get(), 1);
    }

    #[test]
    fn calls_and_failures_recorded() {
        let m = AgentMetrics::new().unwrap();
        m.observe_call(&Ok::<_, MeshError>(()), Duration::from_millis(20));
        m.observe_call::<()>(&Err(MeshError::NotConnected), Duration::from_millis(1));
        assert_eq!(m.calls_total.get(), 2);
        assert_eq!(
            m.call_failures_total
                .with_label_values(&["not_connected"])
                .get(),
            1
        );
        let text = m.encode().unwrap();
        assert!(text.contains("agentmesh_calls_total 2"));
        assert!(text.contains("agentmesh_call_latency_seconds_bucket"));
    }
}
