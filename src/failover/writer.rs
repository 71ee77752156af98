/// Writer failover: reconnect to the old writer or find the new one
///
/// Two tasks race. The reconnect task keeps reconnecting to the writer that
/// failed and wins only if that host is still the writer once it is back.
/// The discovery task connects to any reader, watches the topology through
/// it until another instance is promoted, and connects to that instance.
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{timeout, Instant};
use tracing::{debug, info, warn};

use super::reader::{FailoverReaderHandler, DEFAULT_READER_CONNECT_TIMEOUT};
use super::sync::FailoverSync;
use crate::connection::{ConnectionHandler, ConnectionProxy};
use crate::host::{ClusterTopologyInfo, HostInfo};
use crate::metrics::{MetricsContainer, NoopMetrics};
use crate::topology::TopologyServiceInterface;

pub const DEFAULT_WRITER_FAILOVER_TIMEOUT: Duration = Duration::from_secs(60);
pub const DEFAULT_RECONNECT_WRITER_INTERVAL: Duration = Duration::from_secs(5);
pub const DEFAULT_READ_TOPOLOGY_INTERVAL: Duration = Duration::from_secs(5);

/// Name of the task that produced a writer failover result
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriterTask {
    ReconnectToWriter,
    WaitForNewWriter,
}

/// Outcome of a writer failover
#[derive(Clone)]
pub struct WriterFailoverResult {
    pub connected: bool,
    pub is_new_host: bool,
    pub new_topology: Option<Arc<ClusterTopologyInfo>>,
    pub new_connection: Option<Arc<dyn ConnectionProxy>>,
    pub task: Option<WriterTask>,
}

impl WriterFailoverResult {
    pub fn failed() -> Self {
        Self {
            connected: false,
            is_new_host: false,
            new_topology: None,
            new_connection: None,
            task: None,
        }
    }

    /// Writer of the topology this result carries
    pub fn new_writer(&self) -> Option<HostInfo> {
        self.new_topology.as_ref().and_then(|t| t.get_writer())
    }
}

impl std::fmt::Debug for WriterFailoverResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WriterFailoverResult")
            .field("connected", &self.connected)
            .field("is_new_host", &self.is_new_host)
            .field("new_writer", &self.new_writer())
            .field("task", &self.task)
            .finish()
    }
}

#[derive(Default)]
struct WriterSlot {
    decided: bool,
    result: Option<WriterFailoverResult>,
}

/// State shared by the two racing tasks of one failover
struct RaceContext {
    topology_service: Arc<dyn TopologyServiceInterface>,
    connection_handler: Arc<dyn ConnectionHandler>,
    reader_handler: Arc<FailoverReaderHandler>,
    original_writer: HostInfo,
    current_topology: Arc<ClusterTopologyInfo>,
    reconnect_interval: Duration,
    read_topology_interval: Duration,
    connect_timeout: Duration,
    metrics: Arc<dyn MetricsContainer>,
    sync: FailoverSync,
    slot: Mutex<WriterSlot>,
}

impl RaceContext {
    /// Record `result` unless the race is already decided
    fn publish(&self, result: WriterFailoverResult) -> bool {
        let mut slot = self.slot.lock();
        if slot.decided || slot.result.is_some() {
            return false;
        }
        slot.result = Some(result);
        true
    }

    async fn connect(&self, host: &HostInfo) -> Option<Arc<dyn ConnectionProxy>> {
        let connection = timeout(self.connect_timeout, self.connection_handler.connect(host, None))
            .await
            .ok()
            .flatten();
        self.metrics.register_failover_connects(connection.is_some());
        match &connection {
            Some(_) => self.topology_service.mark_host_up(host),
            None => self.topology_service.mark_host_down(host),
        }
        connection
    }

    /// Reconnect to the original writer until it is back, the topology says
    /// another instance took over, or the race ends
    async fn reconnect_to_writer(self: Arc<Self>) {
        while !self.sync.is_completed() {
            if let Some(connection) = self.connect(&self.original_writer).await {
                // a cached snapshot would still name the old writer
                let topology = self.topology_service.refresh_topology(connection.as_ref()).await;
                let still_writer = topology
                    .as_ref()
                    .and_then(|t| t.get_writer())
                    .map_or(false, |w| w.is_host_same(&self.original_writer));

                if still_writer {
                    let result = WriterFailoverResult {
                        connected: true,
                        is_new_host: false,
                        new_topology: topology,
                        new_connection: Some(connection.clone()),
                        task: Some(WriterTask::ReconnectToWriter),
                    };
                    if self.publish(result) {
                        debug!("Reconnected to writer {}", self.original_writer);
                        self.sync.mark_as_complete(true);
                    } else {
                        connection.close().await;
                    }
                    return;
                }

                connection.close().await;
                if topology.is_some() {
                    debug!("{} is no longer the writer, deferring to new writer discovery", self.original_writer);
                    self.sync.mark_as_complete(false);
                    return;
                }
                debug!("Could not read topology from {}, retrying", self.original_writer);
            }
            tokio::time::sleep(self.reconnect_interval).await;
        }
    }

    /// Watch the topology through a reader until a new writer shows up
    async fn wait_for_new_writer(self: Arc<Self>) {
        while !self.sync.is_completed() {
            let reader = self
                .reader_handler
                .get_reader_connection(&self.current_topology, &self.sync)
                .await;
            let (Some(reader_host), Some(reader_connection)) = (reader.new_host, reader.new_connection) else {
                break;
            };
            debug!("Watching topology through reader {}", reader_host);

            let done = self.watch_topology(&reader_host, reader_connection.clone()).await;
            if !done.reuses_reader {
                reader_connection.close().await;
            }
            if done.finished {
                return;
            }
        }
        self.sync.mark_as_complete(false);
    }

    async fn watch_topology(&self, reader_host: &HostInfo, reader: Arc<dyn ConnectionProxy>) -> WatchOutcome {
        while !self.sync.is_completed() {
            if !reader.is_connected() {
                return WatchOutcome::retry();
            }
            let Some(topology) = self.topology_service.refresh_topology(reader.as_ref()).await else {
                return WatchOutcome::retry();
            };

            if let Some(writer) = topology.get_writer() {
                if !writer.is_host_same(&self.original_writer) {
                    let reuses_reader = writer.is_host_same(reader_host);
                    let connection = if reuses_reader {
                        Some(reader.clone())
                    } else {
                        self.connect(&writer).await
                    };

                    if let Some(connection) = connection {
                        let result = WriterFailoverResult {
                            connected: true,
                            is_new_host: true,
                            new_topology: Some(topology.clone()),
                            new_connection: Some(connection.clone()),
                            task: Some(WriterTask::WaitForNewWriter),
                        };
                        if self.publish(result) {
                            debug!("Connected to new writer {}", writer);
                            self.sync.mark_as_complete(true);
                            return WatchOutcome {
                                finished: true,
                                reuses_reader,
                            };
                        }
                        if !reuses_reader {
                            connection.close().await;
                        }
                        return WatchOutcome::finished();
                    }
                }
            }

            tokio::time::sleep(self.read_topology_interval).await;
        }
        WatchOutcome::finished()
    }
}

struct WatchOutcome {
    finished: bool,
    reuses_reader: bool,
}

impl WatchOutcome {
    fn retry() -> Self {
        Self {
            finished: false,
            reuses_reader: false,
        }
    }

    fn finished() -> Self {
        Self {
            finished: true,
            reuses_reader: false,
        }
    }
}

pub struct FailoverWriterHandler {
    topology_service: Arc<dyn TopologyServiceInterface>,
    connection_handler: Arc<dyn ConnectionHandler>,
    reader_handler: Arc<FailoverReaderHandler>,
    failover_timeout: Duration,
    reconnect_interval: Duration,
    read_topology_interval: Duration,
    connect_timeout: Duration,
    metrics: Arc<dyn MetricsContainer>,
}

impl FailoverWriterHandler {
    pub fn new(
        topology_service: Arc<dyn TopologyServiceInterface>,
        connection_handler: Arc<dyn ConnectionHandler>,
        reader_handler: Arc<FailoverReaderHandler>,
        failover_timeout: Duration,
        reconnect_interval: Duration,
        read_topology_interval: Duration,
    ) -> Self {
        Self {
            topology_service,
            connection_handler,
            reader_handler,
            failover_timeout,
            reconnect_interval,
            read_topology_interval,
            connect_timeout: DEFAULT_READER_CONNECT_TIMEOUT,
            metrics: Arc::new(NoopMetrics),
        }
    }

    pub fn with_connect_timeout(mut self, connect_timeout: Duration) -> Self {
        self.connect_timeout = connect_timeout;
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<dyn MetricsContainer>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Race the reconnect and new-writer tasks for at most the failover
    /// timeout. A new writer rejected by the host filter fails the failover.
    pub async fn failover(&self, current_topology: Arc<ClusterTopologyInfo>) -> WriterFailoverResult {
        let started = Instant::now();
        let Some(original_writer) = current_topology.get_writer() else {
            warn!("Writer failover impossible: topology has no writer");
            return WriterFailoverResult::failed();
        };
        info!("Starting writer failover from {}", original_writer);

        let context = Arc::new(RaceContext {
            topology_service: self.topology_service.clone(),
            connection_handler: self.connection_handler.clone(),
            reader_handler: self.reader_handler.clone(),
            original_writer,
            current_topology,
            reconnect_interval: self.reconnect_interval,
            read_topology_interval: self.read_topology_interval,
            connect_timeout: self.connect_timeout,
            metrics: self.metrics.clone(),
            sync: FailoverSync::new(2),
            slot: Mutex::new(WriterSlot::default()),
        });

        tokio::spawn(context.clone().reconnect_to_writer());
        tokio::spawn(context.clone().wait_for_new_writer());

        context.sync.wait_and_complete(self.failover_timeout).await;
        let result = {
            let mut slot = context.slot.lock();
            slot.decided = true;
            slot.result.take()
        };

        let result = match result {
            Some(result) => self.check_host_filter(result).await,
            None => {
                info!("Writer failover timed out after {:?}", started.elapsed());
                WriterFailoverResult::failed()
            }
        };

        self.metrics.register_writer_failover_procedure_time(started.elapsed());
        if result.connected {
            info!(
                "Writer failover connected to {} (new host: {})",
                result
                    .new_writer()
                    .map(|w| w.to_string())
                    .unwrap_or_default(),
                result.is_new_host
            );
        }
        result
    }

    async fn check_host_filter(&self, result: WriterFailoverResult) -> WriterFailoverResult {
        if !result.is_new_host {
            return result;
        }
        let (Some(topology), Some(writer)) = (result.new_topology.clone(), result.new_writer()) else {
            return result;
        };

        let allowed = self.topology_service.get_filtered_topology(topology);
        if allowed.contains_instance(&writer.instance_name) {
            return result;
        }

        warn!("New writer {} is not allowed by the host filter", writer);
        if let Some(connection) = &result.new_connection {
            connection.close().await;
        }
        WriterFailoverResult::failed()
    }
}
