/// Entry point used by connections to start and stop node monitoring
use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use tracing::debug;

use super::container::MonitorThreadContainer;
use super::context::MonitorConnectionContext;
use super::MonitorSettings;
use crate::config::MonitoringConfig;
use crate::connection::{ConnectionHandler, ConnectionProxy, DataSource};
use crate::error::{ClusterError, ClusterResult, DriverError};
use crate::host::HostInfo;
use crate::metrics::{MetricsContainer, NoopMetrics};

pub struct MonitorService {
    container: Arc<MonitorThreadContainer>,
    metrics: Arc<dyn MetricsContainer>,
    enabled: bool,
}

impl MonitorService {
    pub fn new(
        connection_handler: Arc<dyn ConnectionHandler>,
        datasource: DataSource,
        settings: &MonitorSettings,
    ) -> Self {
        Self::with_container(MonitorThreadContainer::new(
            connection_handler,
            datasource,
            settings.failure_detection_timeout,
        ))
    }

    /// Service for `config`; a disabled service runs operations unmonitored
    pub fn from_config(
        connection_handler: Arc<dyn ConnectionHandler>,
        datasource: DataSource,
        config: &MonitoringConfig,
    ) -> Self {
        let mut service = Self::new(connection_handler, datasource, &config.settings());
        service.enabled = config.enabled;
        service
    }

    /// Share an existing monitor registry
    pub fn with_container(container: Arc<MonitorThreadContainer>) -> Self {
        Self {
            container,
            metrics: Arc::new(NoopMetrics),
            enabled: true,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn with_metrics(mut self, metrics: Arc<dyn MetricsContainer>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn container(&self) -> &Arc<MonitorThreadContainer> {
        &self.container
    }

    /// Start monitoring `connection` against the node known as `node_keys`
    pub fn start_monitoring(
        &self,
        connection: Arc<dyn ConnectionProxy>,
        node_keys: HashSet<String>,
        host: &HostInfo,
        settings: &MonitorSettings,
    ) -> ClusterResult<Arc<MonitorConnectionContext>> {
        if node_keys.is_empty() {
            return Err(ClusterError::invalid_argument(format!(
                "empty node keys for monitored host {}",
                host
            )));
        }

        let context = Arc::new(
            MonitorConnectionContext::new(
                connection,
                node_keys,
                settings.failure_detection_time,
                settings.failure_detection_interval,
                settings.failure_detection_count,
            )
            .with_metrics(self.metrics.clone()),
        );

        // a monitor that stopped after the lookup refuses the context
        let monitor = loop {
            let monitor = self
                .container
                .get_or_create_monitor(context.node_keys(), host, settings.disposal_time);
            if monitor.start_monitoring(context.clone()) {
                break monitor;
            }
            debug!("Monitor {} stopped before {:?} attached, retrying", monitor.id(), context.node_keys());
        };
        debug!("Started monitoring {:?} on monitor {}", context.node_keys(), monitor.id());
        Ok(context)
    }

    /// Deactivate `context` and detach it from the monitor it was attached to
    pub fn stop_monitoring(&self, context: &Arc<MonitorConnectionContext>) {
        context.invalidate();
        match context.monitor() {
            Some(monitor) => {
                monitor.stop_monitoring(context);
                debug!(
                    "Stopped monitoring {:?}, monitor {} has {} contexts left",
                    context.node_keys(),
                    monitor.id(),
                    monitor.context_count()
                );
            }
            None => debug!("Monitor of {:?} already released", context.node_keys()),
        }
    }

    /// Drop every context of the node known as `node_keys`
    pub fn stop_monitoring_for_all_connections(&self, node_keys: &HashSet<String>) {
        if let Some(monitor) = self.container.get_monitor(node_keys) {
            monitor.clear_contexts();
        }
    }

    /// Run `operation` while `connection` is monitored.
    ///
    /// When the node is declared dead while the operation runs, the
    /// operation's own result is replaced by a connection-lost error.
    /// A disabled service just runs the operation.
    pub async fn execute_monitored<T, F, Fut>(
        &self,
        connection: Arc<dyn ConnectionProxy>,
        node_keys: HashSet<String>,
        host: &HostInfo,
        settings: &MonitorSettings,
        operation: F,
    ) -> ClusterResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = ClusterResult<T>>,
    {
        if !self.enabled {
            return operation().await;
        }
        let context = self.start_monitoring(connection, node_keys, host, settings)?;
        let result = operation().await;
        let node_dead = context.is_node_unhealthy();
        self.stop_monitoring(&context);

        if node_dead {
            return Err(DriverError::connection_lost(format!(
                "node {} is unavailable",
                host.host_port_pair()
            ))
            .into());
        }
        result
    }

    /// Stop every monitor of this service's registry
    pub async fn release_resources(&self) {
        self.container.release_all().await;
    }
}
