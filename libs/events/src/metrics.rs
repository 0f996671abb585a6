//! Prometheus metrics for listeners and connections.

use prometheus_client::encoding::text::encode;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::registry::Registry;
use tracing::trace;

use crate::error::MetricsError;
use crate::observer::ProxyObserver;
use crate::types::ListenerLabels;
use crate::worker::WorkerIds;

/// Prometheus-backed [`ProxyObserver`].
///
/// Exported series:
/// - `tsproxy_worker_total`: worker ids handed out
/// - `tsproxy_connection_total`: connections opened
/// - `tsproxy_connection_active{namespace,name,port,exposed_as}`
/// - `tsproxy_listener_active{namespace,name,port,exposed_as}`
#[derive(Debug)]
pub struct ProxyMetrics {
    registry: Registry,
    workers: Counter,
    connections_total: Counter,
    connections_active: Family<ListenerLabels, Gauge>,
    listeners: Family<ListenerLabels, Gauge>,
}

impl ProxyMetrics {
    /// Create the metric set and register it in a fresh registry.
    pub fn new() -> Self {
        let mut registry = Registry::default();

        let workers = Counter::default();
        registry.register("tsproxy_worker", "Total number of workers", workers.clone());

        let connections_total = Counter::default();
        registry.register(
            "tsproxy_connection",
            "Total number of connections",
            connections_total.clone(),
        );

        let connections_active = Family::<ListenerLabels, Gauge>::default();
        registry.register(
            "tsproxy_connection_active",
            "Active connections",
            connections_active.clone(),
        );

        let listeners = Family::<ListenerLabels, Gauge>::default();
        registry.register("tsproxy_listener_active", "Active listeners", listeners.clone());

        Self {
            registry,
            workers,
            connections_total,
            connections_active,
            listeners,
        }
    }

    /// Worker id allocator feeding `tsproxy_worker_total`.
    pub fn worker_ids(&self) -> WorkerIds {
        WorkerIds::with_counter(self.workers.clone())
    }

    /// Render all metrics in the OpenMetrics text format.
    pub fn encode(&self) -> Result<String, MetricsError> {
        let mut buffer = String::new();
        encode(&mut buffer, &self.registry)?;
        Ok(buffer)
    }

    /// Current value of the active-connection gauge for a listener.
    pub fn active_connections(&self, labels: &ListenerLabels) -> i64 {
        self.connections_active.get_or_create(labels).get()
    }

    /// Total connections opened so far.
    pub fn connections_total(&self) -> u64 {
        self.connections_total.get()
    }
}

impl Default for ProxyMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl ProxyObserver for ProxyMetrics {
    fn listener_opened(&self, labels: &ListenerLabels) {
        trace!(listener = %labels, "listener gauge set");
        self.listeners.get_or_create(labels).set(1);
    }

    fn listener_closed(&self, labels: &ListenerLabels) {
        trace!(listener = %labels, "listener gauge removed");
        self.listeners.remove(labels);
    }

    fn connection_opened(&self, labels: &ListenerLabels) {
        self.connections_total.inc();
        self.connections_active.get_or_create(labels).inc();
    }

    fn connection_closed(&self, labels: &ListenerLabels) {
        self.connections_active.get_or_create(labels).dec();
    }
}
