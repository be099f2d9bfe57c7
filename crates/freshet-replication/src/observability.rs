//! Fetcher metrics
//!
//! Lightweight metrics built on the `metrics` facade with Prometheus export
//! support, behind the `metrics-prometheus` cargo feature (on by default).
//! With the feature disabled every recording call compiles to a no-op.
//!
//! Rates are exported as monotonic counters (`*_total`); per-second rates
//! are derived by the scraper. Lag is also kept in an in-process registry so
//! the manager can answer status queries without a metrics backend.

use crate::partition::{BrokerEndpoint, PartitionId};
use dashmap::DashMap;

/// Per-source-broker fetcher metrics
///
/// Tagged with `{client_id, source_host, source_port}`.
pub struct FetcherMetrics;

impl FetcherMetrics {
    /// Fetch requests issued to the source broker
    pub fn increment_requests(client_id: &str, source: &BrokerEndpoint) {
        #[cfg(feature = "metrics-prometheus")]
        metrics::counter!(
            "freshet_fetcher_requests_total",
            "client_id" => client_id.to_string(),
            "source_host" => source.host.clone(),
            "source_port" => source.port.to_string()
        )
        .increment(1);
    }

    /// Fetch requests that failed at the transport level
    pub fn increment_request_failures(client_id: &str, source: &BrokerEndpoint) {
        #[cfg(feature = "metrics-prometheus")]
        metrics::counter!(
            "freshet_fetcher_request_failures_total",
            "client_id" => client_id.to_string(),
            "source_host" => source.host.clone(),
            "source_port" => source.port.to_string()
        )
        .increment(1);
    }

    /// Valid bytes appended from fetch responses
    pub fn add_bytes(client_id: &str, source: &BrokerEndpoint, bytes: u64) {
        #[cfg(feature = "metrics-prometheus")]
        metrics::counter!(
            "freshet_fetcher_bytes_total",
            "client_id" => client_id.to_string(),
            "source_host" => source.host.clone(),
            "source_port" => source.port.to_string()
        )
        .increment(bytes);
    }

    /// Offset resets caused by a leader whose log ends below ours
    /// (unclean leader election); divergence is accepted, not repaired
    pub fn increment_unclean_resets(client_id: &str) {
        #[cfg(feature = "metrics-prometheus")]
        metrics::counter!(
            "freshet_fetcher_unclean_resets_total",
            "client_id" => client_id.to_string()
        )
        .increment(1);
    }

    /// Per-partition replication lag:
    /// `max(0, leader_high_watermark - follower_next_offset)`
    pub fn set_lag(client_id: &str, tp: &PartitionId, lag: i64) {
        #[cfg(feature = "metrics-prometheus")]
        metrics::gauge!(
            "freshet_fetcher_lag",
            "client_id" => client_id.to_string(),
            "topic" => tp.topic.clone(),
            "partition" => tp.partition.to_string()
        )
        .set(lag as f64);
    }

    /// Worst lag across one fetcher's partitions
    pub fn set_max_lag(client_id: &str, lag: i64) {
        #[cfg(feature = "metrics-prometheus")]
        metrics::gauge!(
            "freshet_fetcher_max_lag",
            "client_id" => client_id.to_string()
        )
        .set(lag as f64);
    }
}

/// In-process lag registry for one fetcher
///
/// Mirrors the exported lag gauges so the manager can compute max-lag and
/// answer status queries directly. Concurrent-safe: written by the event
/// loop, read by the manager.
#[derive(Debug)]
pub struct FetcherLagRegistry {
    client_id: String,
    lags: DashMap<PartitionId, i64>,
}

impl FetcherLagRegistry {
    pub fn new(client_id: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            lags: DashMap::new(),
        }
    }

    pub fn record(&self, tp: &PartitionId, lag: i64) {
        self.lags.insert(tp.clone(), lag);
        FetcherMetrics::set_lag(&self.client_id, tp, lag);
        FetcherMetrics::set_max_lag(&self.client_id, self.max_lag());
    }

    /// Remove a partition's lag entry. The facade has no unregister, so the
    /// exported gauge is zeroed.
    pub fn remove(&self, tp: &PartitionId) {
        if self.lags.remove(tp).is_some() {
            FetcherMetrics::set_lag(&self.client_id, tp, 0);
            FetcherMetrics::set_max_lag(&self.client_id, self.max_lag());
        }
    }

    pub fn get(&self, tp: &PartitionId) -> Option<i64> {
        self.lags.get(tp).map(|e| *e.value())
    }

    pub fn max_lag(&self) -> i64 {
        self.lags.iter().map(|e| *e.value()).max().unwrap_or(0)
    }

    pub fn len(&self) -> usize {
        self.lags.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lags.is_empty()
    }
}

// ============================================================================
// Prometheus Backend (when enabled)
// ============================================================================

#[cfg(feature = "metrics-prometheus")]
mod prom {
    use metrics_exporter_prometheus::PrometheusBuilder;
    use std::net::SocketAddr;

    /// Start an HTTP server on `addr` serving `/metrics`
    pub fn init_prometheus_exporter(
        addr: SocketAddr,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        PrometheusBuilder::new().with_http_listener(addr).install()?;
        tracing::info!("Prometheus metrics exporter listening on http://{}/metrics", addr);
        Ok(())
    }
}

#[cfg(feature = "metrics-prometheus")]
pub use prom::init_prometheus_exporter;
