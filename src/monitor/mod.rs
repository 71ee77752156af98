/// Enhanced failure monitoring
///
/// One background `Monitor` per physical node health checks the node on
/// behalf of every connection using it. Each connection registers a
/// `MonitorConnectionContext` that decides, from the shared check results,
/// when the node is dead and aborts that connection.

pub mod container;
pub mod context;
pub mod node;
pub mod service;

use std::time::Duration;

pub use container::MonitorThreadContainer;
pub use context::{ContextStatus, MonitorConnectionContext};
pub use node::{Monitor, MonitorOwner};
pub use service::MonitorService;

/// Failure detection parameters of one monitored connection
#[derive(Debug, Clone, PartialEq)]
pub struct MonitorSettings {
    /// Grace period after monitoring starts during which results are ignored
    pub failure_detection_time: Duration,
    /// Time between two health checks
    pub failure_detection_interval: Duration,
    /// Failed checks needed before the node is declared dead
    pub failure_detection_count: i32,
    /// Idle time after which a monitor without contexts stops
    pub disposal_time: Duration,
    /// Connect and ping timeout of the monitoring connection
    pub failure_detection_timeout: Duration,
}

impl Default for MonitorSettings {
    fn default() -> Self {
        Self {
            failure_detection_time: Duration::from_secs(30),
            failure_detection_interval: Duration::from_secs(5),
            failure_detection_count: 3,
            disposal_time: Duration::from_secs(60),
            failure_detection_timeout: Duration::from_secs(3),
        }
    }
}
