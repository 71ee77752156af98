/// Per-connection failure tracking fed by a node monitor
use parking_lot::Mutex;
use std::collections::HashSet;
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::time::Instant;

use super::node::Monitor;
use crate::connection::ConnectionProxy;
use crate::metrics::{MetricsContainer, NoopMetrics};

/// Lifecycle of a monitored connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextStatus {
    /// Last check succeeded
    Healthy,
    /// Failures counted, still below the threshold
    Suspect,
    /// Node declared dead, connection aborted
    Unhealthy,
    /// Caller stopped monitoring
    Invalidated,
}

impl fmt::Display for ContextStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ContextStatus::Healthy => write!(f, "Healthy"),
            ContextStatus::Suspect => write!(f, "Suspect"),
            ContextStatus::Unhealthy => write!(f, "Unhealthy"),
            ContextStatus::Invalidated => write!(f, "Invalidated"),
        }
    }
}

struct ContextState {
    status: ContextStatus,
    start_monitor_time: Instant,
    failure_count: u32,
    invalid_since: Option<Instant>,
}

/// Monitoring request of one connection against one node.
///
/// The state lock also serialises the socket abort, so the connection is
/// force-closed at most once.
pub struct MonitorConnectionContext {
    node_keys: HashSet<String>,
    connection: Arc<dyn ConnectionProxy>,
    failure_detection_time: Duration,
    failure_detection_interval: Duration,
    failure_detection_count: i32,
    state: Mutex<ContextState>,
    monitor: Mutex<Weak<Monitor>>,
    metrics: Arc<dyn MetricsContainer>,
}

impl MonitorConnectionContext {
    pub fn new(
        connection: Arc<dyn ConnectionProxy>,
        node_keys: HashSet<String>,
        failure_detection_time: Duration,
        failure_detection_interval: Duration,
        failure_detection_count: i32,
    ) -> Self {
        Self {
            node_keys,
            connection,
            failure_detection_time,
            failure_detection_interval,
            failure_detection_count,
            state: Mutex::new(ContextState {
                status: ContextStatus::Healthy,
                start_monitor_time: Instant::now(),
                failure_count: 0,
                invalid_since: None,
            }),
            monitor: Mutex::new(Weak::new()),
            metrics: Arc::new(NoopMetrics),
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<dyn MetricsContainer>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn node_keys(&self) -> &HashSet<String> {
        &self.node_keys
    }

    pub fn connection(&self) -> &Arc<dyn ConnectionProxy> {
        &self.connection
    }

    pub fn failure_detection_interval(&self) -> Duration {
        self.failure_detection_interval
    }

    /// Monitor this context is attached to
    pub fn monitor(&self) -> Option<Arc<Monitor>> {
        self.monitor.lock().upgrade()
    }

    pub(crate) fn set_monitor(&self, monitor: &Arc<Monitor>) {
        *self.monitor.lock() = Arc::downgrade(monitor);
    }

    pub fn set_start_monitor_time(&self, at: Instant) {
        self.state.lock().start_monitor_time = at;
    }

    pub fn status(&self) -> ContextStatus {
        self.state.lock().status
    }

    /// Still receiving health-check results
    pub fn is_active(&self) -> bool {
        matches!(self.status(), ContextStatus::Healthy | ContextStatus::Suspect)
    }

    pub fn is_node_unhealthy(&self) -> bool {
        self.status() == ContextStatus::Unhealthy
    }

    pub fn failure_count(&self) -> u32 {
        self.state.lock().failure_count
    }

    /// Stop monitoring; later updates have no effect
    pub fn invalidate(&self) {
        let mut state = self.state.lock();
        if state.status != ContextStatus::Unhealthy {
            state.status = ContextStatus::Invalidated;
        }
    }

    /// Apply one health-check result.
    ///
    /// Ignored once the context is terminal and during the grace period that
    /// follows the start of monitoring. The node is declared dead when the
    /// time spent invalid reaches `interval * max(0, count)`.
    pub fn update_connection_status(&self, check_start: Instant, check_end: Instant, is_valid: bool) {
        let mut state = self.state.lock();
        if matches!(state.status, ContextStatus::Unhealthy | ContextStatus::Invalidated) {
            return;
        }

        let monitored_for = check_end.saturating_duration_since(state.start_monitor_time);
        if monitored_for <= self.failure_detection_time {
            return;
        }

        if is_valid {
            state.failure_count = 0;
            state.invalid_since = None;
            state.status = ContextStatus::Healthy;
            return;
        }

        state.failure_count += 1;
        let invalid_since = *state.invalid_since.get_or_insert(check_start);
        let invalid_for = check_end.saturating_duration_since(invalid_since);
        let max_invalid = self.failure_detection_interval * self.failure_detection_count.max(0) as u32;

        if invalid_for >= max_invalid {
            state.status = ContextStatus::Unhealthy;
            tracing::warn!(
                "Node {:?} declared unhealthy after {} failed checks over {:?}, aborting connection",
                self.node_keys,
                state.failure_count,
                invalid_for
            );
            self.metrics.register_failure_detection_time(invalid_for);
            self.connection.close_socket();
        } else {
            state.status = ContextStatus::Suspect;
            tracing::debug!(
                "Node {:?} failed {} health checks, invalid for {:?}",
                self.node_keys,
                state.failure_count,
                invalid_for
            );
        }
    }
}

impl fmt::Debug for MonitorConnectionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MonitorConnectionContext")
            .field("node_keys", &self.node_keys)
            .field("status", &self.status())
            .field("failure_count", &self.failure_count())
            .finish()
    }
}
