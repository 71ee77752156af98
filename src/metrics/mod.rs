/// Fire-and-forget metrics sink for failover and topology events
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Consumer of failover/topology measurements.
///
/// Every method has a no-op default; implementations must never block.
pub trait MetricsContainer: Send + Sync {
    fn register_failure_detection_time(&self, _elapsed: Duration) {}

    fn register_writer_failover_procedure_time(&self, _elapsed: Duration) {}

    fn register_reader_failover_procedure_time(&self, _elapsed: Duration) {}

    fn register_failover_connects(&self, _success: bool) {}

    fn register_invalid_initial_connection(&self, _invalid: bool) {}

    fn register_use_cached_topology(&self, _hit: bool) {}

    fn register_topology_query_execution_time(&self, _elapsed: Duration) {}

    fn register_topology_query(&self, _success: bool) {}
}

/// Discards everything
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMetrics;

impl MetricsContainer for NoopMetrics {}

/// Point-in-time copy of `ClusterMetrics`
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub failure_detections: u64,
    pub failure_detection_time_ms: u64,
    pub writer_failovers: u64,
    pub writer_failover_time_ms: u64,
    pub reader_failovers: u64,
    pub reader_failover_time_ms: u64,
    pub failover_connect_successes: u64,
    pub failover_connect_failures: u64,
    pub invalid_initial_connections: u64,
    pub cached_topology_hits: u64,
    pub cached_topology_misses: u64,
    pub topology_queries: u64,
    pub topology_query_failures: u64,
    pub topology_query_time_ms: u64,
}

/// Lock-free counters for one cluster
#[derive(Debug, Default)]
pub struct ClusterMetrics {
    failure_detections: AtomicU64,
    failure_detection_time_ms: AtomicU64,
    writer_failovers: AtomicU64,
    writer_failover_time_ms: AtomicU64,
    reader_failovers: AtomicU64,
    reader_failover_time_ms: AtomicU64,
    failover_connect_successes: AtomicU64,
    failover_connect_failures: AtomicU64,
    invalid_initial_connections: AtomicU64,
    cached_topology_hits: AtomicU64,
    cached_topology_misses: AtomicU64,
    topology_queries: AtomicU64,
    topology_query_failures: AtomicU64,
    topology_query_time_ms: AtomicU64,
}

impl ClusterMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
        MetricsSnapshot {
            failure_detections: load(&self.failure_detections),
            failure_detection_time_ms: load(&self.failure_detection_time_ms),
            writer_failovers: load(&self.writer_failovers),
            writer_failover_time_ms: load(&self.writer_failover_time_ms),
            reader_failovers: load(&self.reader_failovers),
            reader_failover_time_ms: load(&self.reader_failover_time_ms),
            failover_connect_successes: load(&self.failover_connect_successes),
            failover_connect_failures: load(&self.failover_connect_failures),
            invalid_initial_connections: load(&self.invalid_initial_connections),
            cached_topology_hits: load(&self.cached_topology_hits),
            cached_topology_misses: load(&self.cached_topology_misses),
            topology_queries: load(&self.topology_queries),
            topology_query_failures: load(&self.topology_query_failures),
            topology_query_time_ms: load(&self.topology_query_time_ms),
        }
    }
}

fn add_millis(counter: &AtomicU64, elapsed: Duration) {
    counter.fetch_add(elapsed.as_millis() as u64, Ordering::Relaxed);
}

impl MetricsContainer for ClusterMetrics {
    fn register_failure_detection_time(&self, elapsed: Duration) {
        self.failure_detections.fetch_add(1, Ordering::Relaxed);
        add_millis(&self.failure_detection_time_ms, elapsed);
    }

    fn register_writer_failover_procedure_time(&self, elapsed: Duration) {
        self.writer_failovers.fetch_add(1, Ordering::Relaxed);
        add_millis(&self.writer_failover_time_ms, elapsed);
    }

    fn register_reader_failover_procedure_time(&self, elapsed: Duration) {
        self.reader_failovers.fetch_add(1, Ordering::Relaxed);
        add_millis(&self.reader_failover_time_ms, elapsed);
    }

    fn register_failover_connects(&self, success: bool) {
        if success {
            self.failover_connect_successes.fetch_add(1, Ordering::Relaxed);
        } else {
            self.failover_connect_failures.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn register_invalid_initial_connection(&self, invalid: bool) {
        if invalid {
            self.invalid_initial_connections.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn register_use_cached_topology(&self, hit: bool) {
        if hit {
            self.cached_topology_hits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.cached_topology_misses.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn register_topology_query_execution_time(&self, elapsed: Duration) {
        add_millis(&self.topology_query_time_ms, elapsed);
    }

    fn register_topology_query(&self, success: bool) {
        self.topology_queries.fetch_add(1, Ordering::Relaxed);
        if !success {
            self.topology_query_failures.fetch_add(1, Ordering::Relaxed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cluster_metrics_counters() {
        let metrics = ClusterMetrics::new();
        metrics.register_failover_connects(true);
        metrics.register_failover_connects(false);
        metrics.register_failover_connects(false);
        metrics.register_writer_failover_procedure_time(Duration::from_millis(250));
        metrics.register_use_cached_topology(true);
        metrics.register_topology_query(false);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.failover_connect_successes, 1);
        assert_eq!(snapshot.failover_connect_failures, 2);
        assert_eq!(snapshot.writer_failovers, 1);
        assert_eq!(snapshot.writer_failover_time_ms, 250);
        assert_eq!(snapshot.cached_topology_hits, 1);
        assert_eq!(snapshot.topology_queries, 1);
        assert_eq!(snapshot.topology_query_failures, 1);
    }

    #[test]
    fn test_noop_metrics() {
        let metrics: &dyn MetricsContainer = &NoopMetrics;
        metrics.register_failure_detection_time(Duration::from_secs(1));
        metrics.register_invalid_initial_connection(true);
    }
}
