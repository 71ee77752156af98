/// Reader failover: race connections to every reader, first success wins
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{timeout, Instant};
use tracing::{debug, info};

use super::sync::FailoverSync;
use crate::connection::{ConnectionHandler, ConnectionProxy};
use crate::host::{ClusterTopologyInfo, HostInfo};
use crate::metrics::{MetricsContainer, NoopMetrics};
use crate::topology::TopologyServiceInterface;

pub const DEFAULT_READER_FAILOVER_TIMEOUT: Duration = Duration::from_secs(60);
pub const DEFAULT_READER_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Pause between two rounds in which every candidate failed
const ROUND_RETRY_INTERVAL: Duration = Duration::from_secs(1);

/// Outcome of a reader failover
#[derive(Clone)]
pub struct ReaderFailoverResult {
    pub connected: bool,
    pub new_host: Option<HostInfo>,
    pub new_connection: Option<Arc<dyn ConnectionProxy>>,
}

impl ReaderFailoverResult {
    pub fn failed() -> Self {
        Self {
            connected: false,
            new_host: None,
            new_connection: None,
        }
    }

    fn success(host: HostInfo, connection: Arc<dyn ConnectionProxy>) -> Self {
        Self {
            connected: true,
            new_host: Some(host),
            new_connection: Some(connection),
        }
    }
}

impl std::fmt::Debug for ReaderFailoverResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReaderFailoverResult")
            .field("connected", &self.connected)
            .field("new_host", &self.new_host)
            .finish()
    }
}

/// Winner slot of one race. Once `decided`, late connections are closed.
#[derive(Default)]
struct RaceSlot {
    decided: bool,
    winner: Option<(HostInfo, Arc<dyn ConnectionProxy>)>,
}

pub struct FailoverReaderHandler {
    topology_service: Arc<dyn TopologyServiceInterface>,
    connection_handler: Arc<dyn ConnectionHandler>,
    failover_timeout: Duration,
    connect_timeout: Duration,
    allow_writer_fallback: bool,
    rng: Mutex<StdRng>,
    metrics: Arc<dyn MetricsContainer>,
}

impl FailoverReaderHandler {
    pub fn new(
        topology_service: Arc<dyn TopologyServiceInterface>,
        connection_handler: Arc<dyn ConnectionHandler>,
        failover_timeout: Duration,
        connect_timeout: Duration,
    ) -> Self {
        Self {
            topology_service,
            connection_handler,
            failover_timeout,
            connect_timeout,
            allow_writer_fallback: true,
            rng: Mutex::new(StdRng::from_entropy()),
            metrics: Arc::new(NoopMetrics),
        }
    }

    pub fn with_writer_fallback(mut self, allow: bool) -> Self {
        self.allow_writer_fallback = allow;
        self
    }

    /// Deterministic candidate order
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng = Mutex::new(StdRng::seed_from_u64(seed));
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<dyn MetricsContainer>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Up readers, then down readers, each group shuffled; the writer goes
    /// last when writer fallback is allowed
    pub fn build_candidates(&self, topology: &ClusterTopologyInfo, include_writer: bool) -> Vec<HostInfo> {
        let (mut up, mut down): (Vec<HostInfo>, Vec<HostInfo>) =
            topology.get_readers().into_iter().partition(|h| h.is_host_up());
        {
            let mut rng = self.rng.lock();
            up.shuffle(&mut *rng);
            down.shuffle(&mut *rng);
        }

        let mut candidates = up;
        candidates.append(&mut down);
        if include_writer {
            if let Some(writer) = topology.get_writer() {
                candidates.push(writer);
            }
        }
        candidates
    }

    /// Connect to any reader of `topology` within the failover timeout
    pub async fn failover(&self, topology: &ClusterTopologyInfo) -> ReaderFailoverResult {
        let started = Instant::now();
        let deadline = started + self.failover_timeout;

        let result = loop {
            let candidates = self.build_candidates(topology, self.allow_writer_fallback);
            if candidates.is_empty() {
                debug!("Reader failover has no candidates");
                break ReaderFailoverResult::failed();
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            let result = self.race(candidates, remaining).await;
            if result.connected {
                break result;
            }

            if Instant::now() + ROUND_RETRY_INTERVAL >= deadline {
                break ReaderFailoverResult::failed();
            }
            tokio::time::sleep(ROUND_RETRY_INTERVAL).await;
        };

        self.metrics.register_reader_failover_procedure_time(started.elapsed());
        match &result.new_host {
            Some(host) => info!("Reader failover connected to {}", host),
            None => info!("Reader failover failed after {:?}", started.elapsed()),
        }
        result
    }

    /// Connect to a reader, retrying until connected or `sync` completes.
    ///
    /// The writer is never a candidate here.
    pub async fn get_reader_connection(
        &self,
        topology: &ClusterTopologyInfo,
        sync: &FailoverSync,
    ) -> ReaderFailoverResult {
        while !sync.is_completed() {
            let candidates = self.build_candidates(topology, false);
            if !candidates.is_empty() {
                let result = self.race(candidates, self.connect_timeout).await;
                if result.connected {
                    return result;
                }
            }
            tokio::time::sleep(ROUND_RETRY_INTERVAL).await;
        }
        ReaderFailoverResult::failed()
    }

    /// One round: one connect task per candidate, at most `wait` long
    async fn race(&self, candidates: Vec<HostInfo>, wait: Duration) -> ReaderFailoverResult {
        let slot = Arc::new(Mutex::new(RaceSlot::default()));
        // every task is counted before the first one can finish
        let sync = Arc::new(FailoverSync::new(candidates.len() as i64));

        for host in candidates {
            let sync = sync.clone();
            let slot = slot.clone();
            let handler = self.connection_handler.clone();
            let topology_service = self.topology_service.clone();
            let metrics = self.metrics.clone();
            let connect_timeout = self.connect_timeout;

            tokio::spawn(async move {
                if sync.is_completed() {
                    return;
                }
                let connected = timeout(connect_timeout, handler.connect(&host, None))
                    .await
                    .ok()
                    .flatten();

                let Some(connection) = connected else {
                    debug!("Reader failover could not connect to {}", host);
                    topology_service.mark_host_down(&host);
                    metrics.register_failover_connects(false);
                    sync.mark_as_complete(false);
                    return;
                };

                metrics.register_failover_connects(true);
                topology_service.mark_host_up(&host);
                let won = {
                    let mut slot = slot.lock();
                    if slot.decided || slot.winner.is_some() {
                        false
                    } else {
                        slot.winner = Some((host.clone(), connection.clone()));
                        true
                    }
                };
                if won {
                    debug!("Reader failover won by {}", host);
                    sync.mark_as_complete(true);
                } else {
                    connection.close().await;
                    sync.mark_as_complete(false);
                }
            });
        }

        sync.wait_and_complete(wait).await;

        let winner = {
            let mut slot = slot.lock();
            slot.decided = true;
            slot.winner.take()
        };
        match winner {
            Some((host, connection)) => ReaderFailoverResult::success(host, connection),
            None => ReaderFailoverResult::failed(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{test_host, test_topology, MockConnectionHandler, RecordingTopologyService};

    fn handler_for(hosts: &[&str]) -> Arc<MockConnectionHandler> {
        let handler = Arc::new(MockConnectionHandler::new());
        for name in hosts {
            handler.add_host(test_host(name).host(), Vec::new());
        }
        handler
    }

    fn reader_handler(
        topology_service: Arc<RecordingTopologyService>,
        handler: Arc<MockConnectionHandler>,
    ) -> FailoverReaderHandler {
        FailoverReaderHandler::new(
            topology_service,
            handler,
            Duration::from_secs(60),
            Duration::from_secs(5),
        )
        .with_seed(7)
    }

    #[tokio::test(start_paused = true)]
    async fn test_all_readers_failing() {
        let topology = test_topology("writer", &["r1", "r2", "r3"]);
        let handler = handler_for(&["writer", "r1", "r2", "r3"]);
        for name in ["writer", "r1", "r2", "r3"] {
            handler.set_available(test_host(name).host(), false);
        }
        let service = Arc::new(RecordingTopologyService::new());
        let readers = reader_handler(service.clone(), handler.clone());

        let started = Instant::now();
        let result = readers.failover(&topology).await;

        assert!(!result.connected);
        assert!(result.new_connection.is_none());
        assert!(started.elapsed() <= Duration::from_secs(61));
        let down = service.marked_down();
        for name in ["r1", "r2", "r3", "writer"] {
            assert!(down.contains(&test_host(name).host_port_pair()), "{} not marked down", name);
        }
        assert!(service.marked_up().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_success_wins_and_losers_are_closed() {
        let topology = test_topology("writer", &["r1", "r2"]);
        let handler = handler_for(&["writer", "r1", "r2"]);
        handler.set_delay(test_host("r1").host(), Duration::from_millis(100));
        handler.set_delay(test_host("r2").host(), Duration::from_millis(300));
        let service = Arc::new(RecordingTopologyService::new());
        let readers = reader_handler(service.clone(), handler.clone()).with_writer_fallback(false);

        let result = readers.failover(&topology).await;
        assert!(result.connected);
        assert_eq!(result.new_host.unwrap().instance_name, "r1");

        // r2 finishes after the race was decided
        tokio::time::sleep(Duration::from_secs(1)).await;
        let late = handler.opened(test_host("r2").host());
        assert_eq!(late.len(), 1);
        assert_eq!(late[0].close_count(), 1);
        assert_eq!(handler.opened(test_host("r1").host())[0].close_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_writer_fallback() {
        let topology = test_topology("writer", &["r1"]);
        let handler = handler_for(&["writer", "r1"]);
        handler.set_available(test_host("r1").host(), false);
        let service = Arc::new(RecordingTopologyService::new());
        let readers = reader_handler(service.clone(), handler.clone());

        let result = readers.failover(&topology).await;
        assert!(result.connected);
        assert_eq!(result.new_host.unwrap().instance_name, "writer");
        assert!(service.marked_up().contains(&test_host("writer").host_port_pair()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_writer_fallback_times_out() {
        let topology = test_topology("writer", &["r1"]);
        let handler = handler_for(&["writer", "r1"]);
        handler.set_available(test_host("r1").host(), false);
        let service = Arc::new(RecordingTopologyService::new());
        let readers = FailoverReaderHandler::new(service, handler.clone(), Duration::from_secs(10), Duration::from_secs(1))
            .with_writer_fallback(false);

        let result = readers.failover(&topology).await;
        assert!(!result.connected);
        assert_eq!(handler.attempts(test_host("writer").host()), 0);
        assert!(handler.attempts(test_host("r1").host()) > 1);
    }

    #[tokio::test]
    async fn test_candidate_order() {
        let topology = test_topology("writer", &["r1", "r2", "r3", "r4"]);
        topology.mark_host_down(&test_host("r2"));
        topology.mark_host_down(&test_host("r4"));
        let readers = reader_handler(
            Arc::new(RecordingTopologyService::new()),
            Arc::new(MockConnectionHandler::new()),
        );

        let candidates = readers.build_candidates(&topology, true);
        let names: Vec<&str> = candidates.iter().map(|h| h.instance_name.as_str()).collect();
        assert_eq!(names.len(), 5);
        let mut first: Vec<&str> = names[..2].to_vec();
        first.sort();
        assert_eq!(first, vec!["r1", "r3"]);
        let mut second: Vec<&str> = names[2..4].to_vec();
        second.sort();
        assert_eq!(second, vec!["r2", "r4"]);
        assert_eq!(names[4], "writer");

        let without_writer = readers.build_candidates(&topology, false);
        assert_eq!(without_writer.len(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_get_reader_connection_stops_when_cancelled() {
        let topology = test_topology("writer", &["r1"]);
        let handler = handler_for(&["writer", "r1"]);
        handler.set_available(test_host("r1").host(), false);
        let readers = reader_handler(Arc::new(RecordingTopologyService::new()), handler);

        let sync = Arc::new(FailoverSync::new(1));
        let canceller = sync.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(3)).await;
            canceller.mark_as_complete(true);
        });

        let result = readers.get_reader_connection(&topology, &sync).await;
        assert!(!result.connected);
    }
}
