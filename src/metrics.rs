//! Prometheus instrumentation for the hot paths, mirroring the teacher's
//! `ClientConnectionMetrics`/`worker_metrics` split: a handful of gauges and
//! counters registered once per [`Hub`], cloned cheaply into each [`Client`].

use prometheus::{IntCounter, IntCounterVec, IntGauge, Opts, Registry};

/// Process-wide (well, hub-wide) counters and gauges.
#[derive(Clone)]
pub struct HubMetrics {
    pub connected_clients: IntGauge,
    pub messages_published: IntCounter,
    pub clients_disconnected: IntCounter,
    pub publish_by_outcome: IntCounterVec,
    /// Sum of every connected client's outbound queue depth, mirroring the
    /// teacher's process-wide `total_outgoing_queue_length` gauge rather than
    /// a per-client series: a const label keyed by client id is unbounded
    /// cardinality over the life of a process, since nothing would ever
    /// unregister it on disconnect.
    pub total_outbound_queue_depth: IntGauge,
}

impl HubMetrics {
    /// Registers a fresh set of metrics against `registry`.
    ///
    /// Registration failures (name collisions) are logged and otherwise
    /// ignored: metrics are an observability aid, not load-bearing for
    /// correctness, so a hub must still function without them.
    pub fn new(registry: &Registry) -> Self {
        let connected_clients =
            IntGauge::new("wshub_connected_clients", "Number of clients currently connected").unwrap();
        let messages_published =
            IntCounter::new("wshub_messages_published_total", "Messages successfully enqueued by Publish").unwrap();
        let clients_disconnected =
            IntCounter::new("wshub_clients_disconnected_total", "Clients torn down by the hub").unwrap();
        let publish_by_outcome = IntCounterVec::new(
            Opts::new("wshub_publish_outcome_total", "Publish enqueue outcomes by result"),
            &["outcome"],
        )
        .unwrap();
        let total_outbound_queue_depth = IntGauge::new(
            "wshub_total_outbound_queue_depth",
            "Sum of outbound send-queue depth across every connected client",
        )
        .unwrap();

        for collector in [
            Box::new(connected_clients.clone()) as Box<dyn prometheus::core::Collector>,
            Box::new(messages_published.clone()),
            Box::new(clients_disconnected.clone()),
            Box::new(publish_by_outcome.clone()),
            Box::new(total_outbound_queue_depth.clone()),
        ] {
            if let Err(err) = registry.register(collector) {
                tracing::debug!(%err, "metric already registered, reusing existing registry state");
            }
        }

        Self {
            connected_clients,
            messages_published,
            clients_disconnected,
            publish_by_outcome,
            total_outbound_queue_depth,
        }
    }
}

impl Default for HubMetrics {
    fn default() -> Self {
        Self::new(&Registry::new())
    }
}

/// Per-client queue-depth handle. Rather than a per-client gauge registered
/// under a high-cardinality `client_id` label (which nothing would ever
/// unregister on disconnect), every `Client` shares a clone of the hub's one
/// `total_outbound_queue_depth` gauge and increments/decrements it, mirroring
/// the teacher's process-wide `total_outgoing_queue_length` gauge.
#[derive(Clone)]
pub struct ClientMetrics {
    pub queue_depth: IntGauge,
}

impl ClientMetrics {
    /// Builds a handle backed by the hub-wide shared gauge.
    pub fn new(total_outbound_queue_depth: &IntGauge) -> Self {
        Self {
            queue_depth: total_outbound_queue_depth.clone(),
        }
    }

    /// A metrics handle detached from any registry, for tests and dummies.
    pub fn detached() -> Self {
        Self {
            queue_depth: IntGauge::new("wshub_client_queue_depth_detached", "detached").unwrap(),
        }
    }
}
