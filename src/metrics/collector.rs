//! Metrics collector using prometheus-client.
//!
//! Installed on a server as a connection state observer. It counts accepted
//! connections, tracks how many connections sit in each state, counts state
//! transitions and records how long active periods last.

use crate::conn::{ConnInfo, ConnState, ConnStateObserver};
use dashmap::DashMap;
use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::{Histogram, exponential_buckets};
use prometheus_client::registry::Registry;
use std::sync::Arc;
use std::time::Instant;

/// Labels for the per-state connection gauge.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct StateLabels {
    pub state: String,
}

/// Labels for state transition counts.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct TransitionLabels {
    pub from: String,
    pub to: String,
}

/// Collects and stores all metrics.
#[derive(Clone)]
pub struct MetricsCollector {
    inner: Arc<MetricsCollectorInner>,
}

struct MetricsCollectorInner {
    /// Connections accepted.
    connections_total: Counter,
    /// Live connections by state.
    connections: Family<StateLabels, Gauge>,
    /// State transitions.
    transitions_total: Family<TransitionLabels, Counter>,
    /// Length of active periods, in seconds.
    active_duration_seconds: Histogram,
    /// Start of the current active period per connection.
    active_since: DashMap<u64, Instant>,
    registry: Registry,
}

impl MetricsCollector {
    pub fn new() -> Self {
        let mut registry = Registry::default();

        let connections_total = Counter::default();
        let connections = Family::<StateLabels, Gauge>::default();
        let transitions_total = Family::<TransitionLabels, Counter>::default();
        // Buckets: 1ms, 2.5ms, 5ms, ... up to about 10s.
        let active_duration_seconds = Histogram::new(exponential_buckets(0.001, 2.5, 13));

        registry.register(
            "drain_connections",
            "Total number of accepted connections",
            connections_total.clone(),
        );
        registry.register(
            "drain_connections_current",
            "Number of live connections by state",
            connections.clone(),
        );
        registry.register(
            "drain_state_transitions",
            "Total number of connection state transitions",
            transitions_total.clone(),
        );
        registry.register(
            "drain_active_duration_seconds",
            "Time a connection spends active before going idle or closing",
            active_duration_seconds.clone(),
        );

        Self {
            inner: Arc::new(MetricsCollectorInner {
                connections_total,
                connections,
                transitions_total,
                active_duration_seconds,
                active_since: DashMap::new(),
                registry,
            }),
        }
    }

    /// Get the prometheus registry for encoding.
    pub fn registry(&self) -> &Registry {
        &self.inner.registry
    }

    /// Number of live connections currently in `state`.
    pub fn connections_in(&self, state: ConnState) -> i64 {
        self.inner.connections.get_or_create(&state_labels(state)).get()
    }

    pub fn connections_total(&self) -> u64 {
        self.inner.connections_total.get()
    }

    fn record_transition(&self, conn: &ConnInfo, previous: ConnState, next: ConnState) {
        let inner = &self.inner;

        if next == ConnState::New {
            inner.connections_total.inc();
        } else {
            inner.connections.get_or_create(&state_labels(previous)).dec();
            inner
                .transitions_total
                .get_or_create(&TransitionLabels {
                    from: previous.as_str().to_string(),
                    to: next.as_str().to_string(),
                })
                .inc();
        }
        if !next.is_terminal() {
            inner.connections.get_or_create(&state_labels(next)).inc();
        }

        if next == ConnState::Active {
            inner.active_since.entry(conn.id).or_insert_with(Instant::now);
        } else if let Some((_, since)) = inner.active_since.remove(&conn.id) {
            inner
                .active_duration_seconds
                .observe(since.elapsed().as_secs_f64());
        }
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnStateObserver for MetricsCollector {
    fn on_state_change(&self, conn: &ConnInfo, previous: ConnState, next: ConnState) {
        self.record_transition(conn, previous, next);
    }
}

fn state_labels(state: ConnState) -> StateLabels {
    StateLabels {
        state: state.as_str().to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::listener::PeerAddr;

    fn info(id: u64) -> ConnInfo {
        ConnInfo {
            id,
            peer: PeerAddr::Unix,
        }
    }

    #[test]
    fn test_state_gauges_follow_lifecycle() {
        let collector = MetricsCollector::new();
        let conn = info(1);

        collector.on_state_change(&conn, ConnState::New, ConnState::New);
        assert_eq!(collector.connections_in(ConnState::New), 1);

        collector.on_state_change(&conn, ConnState::New, ConnState::Active);
        collector.on_state_change(&conn, ConnState::Active, ConnState::Idle);
        collector.on_state_change(&conn, ConnState::Idle, ConnState::Active);
        assert_eq!(collector.connections_in(ConnState::New), 0);
        assert_eq!(collector.connections_in(ConnState::Idle), 0);
        assert_eq!(collector.connections_in(ConnState::Active), 1);

        collector.on_state_change(&conn, ConnState::Active, ConnState::Closed);
        assert_eq!(collector.connections_in(ConnState::Active), 0);
        assert_eq!(collector.connections_in(ConnState::Closed), 0);
        assert_eq!(collector.connections_total(), 1);
    }

    #[test]
    fn test_metrics_encoding() {
        let collector = MetricsCollector::new();
        let conn = info(2);
        collector.on_state_change(&conn, ConnState::New, ConnState::New);
        collector.on_state_change(&conn, ConnState::New, ConnState::Active);
        collector.on_state_change(&conn, ConnState::Active, ConnState::Hijacked);

        let mut buffer = String::new();
        prometheus_client::encoding::text::encode(&mut buffer, collector.registry()).unwrap();

        assert!(buffer.contains("drain_connections_total 1"));
        assert!(buffer.contains("drain_state_transitions_total{from=\"active\",to=\"hijacked\"} 1"));
        assert!(buffer.contains("drain_active_duration_seconds_count 1"));
    }
}
