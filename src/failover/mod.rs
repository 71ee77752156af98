/// Cluster-aware failover
///
/// `FailoverHandler` classifies the endpoint a client connects to, keeps the
/// topology of its cluster up to date and, when a statement fails with a
/// connection exception, moves the client to another instance through the
/// reader or writer failover races.
pub mod reader;
pub mod sync;
pub mod writer;

pub use reader::{FailoverReaderHandler, ReaderFailoverResult};
pub use sync::FailoverSync;
pub use writer::{FailoverWriterHandler, WriterFailoverResult, WriterTask};

use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use crate::config::FailoverConfig;
use crate::connection::{query_scalar, ConnectionHandler, ConnectionProxy};
use crate::error::{
    is_connection_exception, ClusterError, ClusterResult, DriverError, SQLSTATE_CONNECTION_CHANGED,
    SQLSTATE_CONNECTION_LOST, SQLSTATE_TRANSACTION_RESOLUTION_UNKNOWN, SQLSTATE_UNABLE_TO_CONNECT,
};
use crate::host::{ClusterTopologyInfo, HostInfo};
use crate::metrics::{MetricsContainer, NoopMetrics};
use crate::topology::{TopologyServiceInterface, HOST_TEMPLATE_PLACEHOLDER, RETRIEVE_TOPOLOGY_SQL};
use crate::utils::generate_id;
use crate::utils::rds::{self, EndpointClass};

/// Returns the id of the instance a connection landed on
pub const INSTANCE_ID_SQL: &str = "SELECT @@aurora_server_id";

/// What the connecting host turned out to be
#[derive(Debug, Clone)]
pub struct ClusterInfo {
    pub endpoint: EndpointClass,
    pub cluster_id: String,
    /// Template used to build instance hosts; `None` when failover is
    /// impossible for this endpoint
    pub instance_template: Option<HostInfo>,
}

/// Result of `trigger_failover_if_needed`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailoverOutcome {
    /// Error not handled by failover; surface it unchanged
    NotTriggered,
    /// Failover succeeded, session state must be restored by the caller
    ConnectionChanged,
    /// Failover could not find any instance
    ConnectionLost,
    /// Failover succeeded while a transaction was open
    TransactionResolutionUnknown,
}

impl FailoverOutcome {
    pub fn sqlstate(&self) -> Option<&'static str> {
        match self {
            FailoverOutcome::NotTriggered => None,
            FailoverOutcome::ConnectionChanged => Some(SQLSTATE_CONNECTION_CHANGED),
            FailoverOutcome::ConnectionLost => Some(SQLSTATE_CONNECTION_LOST),
            FailoverOutcome::TransactionResolutionUnknown => Some(SQLSTATE_TRANSACTION_RESOLUTION_UNKNOWN),
        }
    }

    pub fn message(&self) -> &'static str {
        match self {
            FailoverOutcome::NotTriggered => "",
            FailoverOutcome::ConnectionChanged => {
                "The active connection has changed due to a connection failure. Please re-configure session state if required."
            }
            FailoverOutcome::ConnectionLost => "Unable to establish a connection to any cluster instance.",
            FailoverOutcome::TransactionResolutionUnknown => {
                "Transaction resolution unknown. Please re-configure session state if required and try restarting the transaction."
            }
        }
    }

    /// Error to hand back to the caller, `Ok` when failover did not run
    pub fn into_result(self) -> ClusterResult<()> {
        match self.sqlstate() {
            None => Ok(()),
            Some(sqlstate) => Err(ClusterError::failover(sqlstate, self.message())),
        }
    }
}

impl fmt::Display for FailoverOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.sqlstate() {
            None => write!(f, "not triggered"),
            Some(sqlstate) => write!(f, "[{}] {}", sqlstate, self.message()),
        }
    }
}

#[derive(Default)]
struct HandlerState {
    cluster: Option<ClusterInfo>,
    connection: Option<Arc<dyn ConnectionProxy>>,
    current_host: Option<HostInfo>,
    in_transaction: bool,
}

/// Orchestrates classification, connect and error-triggered failover for
/// one client connection
pub struct FailoverHandler {
    config: FailoverConfig,
    topology_service: Arc<dyn TopologyServiceInterface>,
    connection_handler: Arc<dyn ConnectionHandler>,
    reader_handler: Arc<FailoverReaderHandler>,
    writer_handler: FailoverWriterHandler,
    metrics: Arc<dyn MetricsContainer>,
    state: Mutex<HandlerState>,
}

impl FailoverHandler {
    pub fn new(
        config: FailoverConfig,
        topology_service: Arc<dyn TopologyServiceInterface>,
        connection_handler: Arc<dyn ConnectionHandler>,
        metrics: Arc<dyn MetricsContainer>,
    ) -> Self {
        let metrics: Arc<dyn MetricsContainer> = if config.gather_metrics {
            metrics
        } else {
            Arc::new(NoopMetrics)
        };
        let reader_handler = Arc::new(
            FailoverReaderHandler::new(
                topology_service.clone(),
                connection_handler.clone(),
                config.failover_timeout(),
                config.reader_connect_timeout(),
            )
            .with_writer_fallback(config.allow_writer_fallback)
            .with_metrics(metrics.clone()),
        );
        let writer_handler = FailoverWriterHandler::new(
            topology_service.clone(),
            connection_handler.clone(),
            reader_handler.clone(),
            config.failover_timeout(),
            config.writer_reconnect_interval(),
            config.topology_read_interval(),
        )
        .with_connect_timeout(config.reader_connect_timeout())
        .with_metrics(metrics.clone());

        Self {
            config,
            topology_service,
            connection_handler,
            reader_handler,
            writer_handler,
            metrics,
            state: Mutex::new(HandlerState::default()),
        }
    }

    pub fn cluster_info(&self) -> Option<ClusterInfo> {
        self.state.lock().cluster.clone()
    }

    pub fn current_connection(&self) -> Option<Arc<dyn ConnectionProxy>> {
        self.state.lock().connection.clone()
    }

    pub fn current_host(&self) -> Option<HostInfo> {
        self.state.lock().current_host.clone()
    }

    pub fn set_transaction_open(&self, open: bool) {
        self.state.lock().in_transaction = open;
    }

    /// Failover can run for the classified endpoint
    pub fn is_failover_enabled(&self) -> bool {
        let state = self.state.lock();
        self.config.enabled
            && state.cluster.as_ref().map_or(false, |c| {
                c.endpoint != EndpointClass::RdsProxy && c.instance_template.is_some()
            })
    }

    /// Classify the configured host and configure the topology service.
    ///
    /// Runs once; later calls return the stored classification. An unusable
    /// host pattern is a configuration error.
    pub fn init_cluster_info(&self) -> ClusterResult<ClusterInfo> {
        if let Some(cluster) = self.cluster_info() {
            return Ok(cluster);
        }

        let host = self.config.host.as_str();
        let endpoint = rds::classify_endpoint(host);

        let instance_template = match &self.config.host_pattern {
            Some(pattern) => Some(self.validate_host_pattern(pattern)?),
            None if endpoint == EndpointClass::IpAddress || endpoint == EndpointClass::CustomDomain => None,
            None => rds::get_rds_instance_host_pattern(host).map(|p| HostInfo::new(p, self.config.port)),
        };

        let cluster_id = match &self.config.cluster_id {
            Some(id) => id.clone(),
            None => match endpoint {
                EndpointClass::RdsWriterCluster | EndpointClass::RdsReaderCluster => rds::get_rds_cluster_host_url(host)
                    .map(|url| format!("{}:{}", url, self.config.port))
                    .unwrap_or_else(|| generate_id("cluster")),
                _ => generate_id("cluster"),
            },
        };

        self.topology_service.set_cluster_id(&cluster_id);
        self.topology_service.set_refresh_rate(self.config.topology_refresh_rate());
        if let Some(template) = &instance_template {
            self.topology_service.set_cluster_instance_template(template.clone());
        }

        debug!(
            "Classified {} as {} (cluster id {}, template {:?})",
            host,
            endpoint,
            cluster_id,
            instance_template.as_ref().map(|t| t.host().to_string())
        );

        let cluster = ClusterInfo {
            endpoint,
            cluster_id,
            instance_template,
        };
        self.state.lock().cluster = Some(cluster.clone());
        Ok(cluster)
    }

    fn validate_host_pattern(&self, pattern: &str) -> ClusterResult<HostInfo> {
        if pattern.matches(HOST_TEMPLATE_PLACEHOLDER).count() != 1 {
            return Err(ClusterError::config(format!(
                "host pattern '{}' must contain exactly one '{}'",
                pattern, HOST_TEMPLATE_PLACEHOLDER
            )));
        }
        let sample = pattern.replacen(HOST_TEMPLATE_PLACEHOLDER, "instance", 1);
        match rds::classify_endpoint(&sample) {
            EndpointClass::RdsWriterCluster | EndpointClass::RdsReaderCluster => Err(ClusterError::config(
                format!("host pattern '{}' cannot be a cluster endpoint", pattern),
            )),
            EndpointClass::RdsCustomCluster => Err(ClusterError::config(format!(
                "host pattern '{}' cannot be a custom cluster endpoint",
                pattern
            ))),
            EndpointClass::RdsProxy => Err(ClusterError::config(format!(
                "host pattern '{}' cannot be a proxy endpoint",
                pattern
            ))),
            _ => Ok(HostInfo::new(pattern, self.config.port)),
        }
    }

    /// Open the initial connection.
    ///
    /// When the cluster endpoint resolved to an instance that is no longer
    /// the writer, the connection is moved to the actual writer before it is
    /// returned.
    pub async fn connect(&self) -> ClusterResult<Arc<dyn ConnectionProxy>> {
        let cluster = self.init_cluster_info()?;
        let initial_host = HostInfo::new(self.config.host.clone(), self.config.port);

        let Some(connection) = self.open(&initial_host).await else {
            return self.connect_after_initial_failure(&initial_host).await;
        };

        if cluster.instance_template.is_none() {
            self.ensure_standalone(&cluster, connection.as_ref()).await?;
            self.set_current(connection.clone(), initial_host);
            return Ok(connection);
        }

        let Some(topology) = self.topology_service.get_topology(connection.as_ref(), false).await else {
            self.set_current(connection.clone(), initial_host);
            return Ok(connection);
        };

        let connected_instance = query_scalar(connection.as_ref(), INSTANCE_ID_SQL)
            .await
            .ok()
            .flatten();
        let connected_host = connected_instance
            .as_deref()
            .and_then(|id| topology.get_instances().into_iter().find(|h| h.instance_name == id));

        if cluster.endpoint == EndpointClass::RdsWriterCluster {
            if let Some(writer) = topology.get_writer() {
                let on_writer = connected_host.as_ref().map_or(false, |h| h.is_host_same(&writer));
                self.metrics.register_invalid_initial_connection(!on_writer);
                if !on_writer {
                    return self.reconnect_to_writer(connection, writer).await;
                }
            }
        }

        self.set_current(connection.clone(), connected_host.unwrap_or(initial_host));
        Ok(connection)
    }

    async fn open(&self, host: &HostInfo) -> Option<Arc<dyn ConnectionProxy>> {
        timeout(self.config.connect_timeout(), self.connection_handler.connect(host, None))
            .await
            .ok()
            .flatten()
    }

    /// The cluster endpoint pointed at a stale writer; connect to the
    /// writer the topology reports instead
    async fn reconnect_to_writer(
        &self,
        stale: Arc<dyn ConnectionProxy>,
        writer: HostInfo,
    ) -> ClusterResult<Arc<dyn ConnectionProxy>> {
        warn!("Cluster endpoint resolved to a stale writer, reconnecting to {}", writer);
        stale.close().await;

        match self.open(&writer).await {
            Some(connection) => {
                self.topology_service.mark_host_up(&writer);
                self.topology_service.get_topology(connection.as_ref(), true).await;
                self.set_current(connection.clone(), writer);
                Ok(connection)
            }
            None => {
                self.topology_service.mark_host_down(&writer);
                Err(DriverError::new(
                    SQLSTATE_UNABLE_TO_CONNECT,
                    format!("unable to connect to writer {}", writer.host_port_pair()),
                )
                .into())
            }
        }
    }

    /// A host without instance template must not front a cluster
    async fn ensure_standalone(&self, cluster: &ClusterInfo, connection: &dyn ConnectionProxy) -> ClusterResult<()> {
        if cluster.endpoint == EndpointClass::RdsProxy {
            return Ok(());
        }
        match connection.query(RETRIEVE_TOPOLOGY_SQL).await {
            Ok(rows) if !rows.is_empty() => {
                error!("{} is part of a cluster but no host pattern is configured", self.config.host);
                Err(ClusterError::config(format!(
                    "{} fronts a cluster; configure a host pattern to enable failover",
                    self.config.host
                )))
            }
            _ => Ok(()),
        }
    }

    async fn connect_after_initial_failure(&self, host: &HostInfo) -> ClusterResult<Arc<dyn ConnectionProxy>> {
        let unable = || -> ClusterError {
            DriverError::new(
                SQLSTATE_UNABLE_TO_CONNECT,
                format!("unable to connect to {}", host.host_port_pair()),
            )
            .into()
        };
        if !self.is_failover_enabled() {
            return Err(unable());
        }
        let Some(topology) = self.topology_service.get_cached_topology() else {
            return Err(unable());
        };

        info!("Initial connection to {} failed, failing over", host);
        match self.run_failover(topology).await {
            Some(connection) => Ok(connection),
            None => Err(unable()),
        }
    }

    fn set_current(&self, connection: Arc<dyn ConnectionProxy>, host: HostInfo) {
        let mut state = self.state.lock();
        state.connection = Some(connection);
        state.current_host = Some(host);
    }

    /// React to a failed statement.
    ///
    /// Only SQLSTATE class `08` triggers failover, and only when it is
    /// enabled, a topology is known and the endpoint is not a proxy.
    pub async fn trigger_failover_if_needed(&self, sqlstate: &str) -> FailoverOutcome {
        if !is_connection_exception(sqlstate) {
            return FailoverOutcome::NotTriggered;
        }
        if !self.is_failover_enabled() {
            debug!("Failover not enabled for {}, ignoring [{}]", self.config.host, sqlstate);
            return FailoverOutcome::NotTriggered;
        }
        let Some(topology) = self.topology_service.get_cached_topology() else {
            debug!("No topology available, ignoring [{}]", sqlstate);
            return FailoverOutcome::NotTriggered;
        };
        if topology.total_hosts() == 0 {
            return FailoverOutcome::NotTriggered;
        }

        let (old_connection, old_host) = {
            let mut state = self.state.lock();
            (state.connection.take(), state.current_host.clone())
        };
        if let Some(host) = &old_host {
            self.topology_service.mark_host_down(host);
        }
        if let Some(connection) = old_connection {
            connection.close().await;
        }

        let outcome = match self.run_failover(topology).await {
            None => FailoverOutcome::ConnectionLost,
            Some(_) => {
                let mut state = self.state.lock();
                if state.in_transaction {
                    state.in_transaction = false;
                    FailoverOutcome::TransactionResolutionUnknown
                } else {
                    FailoverOutcome::ConnectionChanged
                }
            }
        };
        info!("Failover after [{}] finished: {}", sqlstate, outcome);
        outcome
    }

    /// Writer failover in strict-writer mode or on single-host clusters,
    /// reader failover otherwise
    async fn run_failover(&self, topology: Arc<ClusterTopologyInfo>) -> Option<Arc<dyn ConnectionProxy>> {
        let topology = self.topology_service.get_filtered_topology(topology);

        if self.config.strict_writer || topology.total_hosts() == 1 {
            let result = self.writer_handler.failover(topology).await;
            let (Some(connection), Some(writer)) = (result.new_connection.clone(), result.new_writer()) else {
                return None;
            };
            self.set_current(connection.clone(), writer);
            Some(connection)
        } else {
            let result = self.reader_handler.failover(&topology).await;
            let (Some(connection), Some(host)) = (result.new_connection, result.new_host) else {
                return None;
            };
            if !host.is_host_writer() {
                topology.set_last_used_reader(host.clone());
            }
            self.set_current(connection.clone(), host);
            Some(connection)
        }
    }
}
