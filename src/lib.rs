/// clusterguard - resilience core for replicated MySQL-compatible database clusters
///
/// The crate tracks the topology of a cluster, watches the health of the
/// instances a client is connected to, and moves clients to another instance
/// when their connection fails:
/// 1. Topology: discovery query, per-cluster snapshot cache, allow/block host filters
/// 2. Monitoring: one background health-check loop per node shared by every connection to it
/// 3. Failover: cancellable reader and writer reconnection races
/// 4. Custom endpoints: membership tracking turned into host filters
///
/// The wire protocol client is not part of this crate. It plugs in through
/// the `ConnectionHandler` and `ConnectionProxy` traits.
pub mod cache;
pub mod config;
pub mod connection;
pub mod custom_endpoint;
pub mod error;
pub mod failover;
pub mod host;
pub mod metrics;
pub mod monitor;
pub mod topology;
pub mod utils;

#[cfg(test)]
pub(crate) mod testing;

pub use cache::{DisposalHooks, ExpiringCache, SlidingExpirationCache};
pub use config::Config;
pub use connection::{ConnectionHandler, ConnectionProxy, DataSource};
pub use custom_endpoint::{CustomEndpointInfo, CustomEndpointMonitor, CustomEndpointRegistry, CustomEndpointSource};
pub use error::{ClusterError, ClusterResult, DriverError};
pub use failover::{FailoverHandler, FailoverOutcome};
pub use host::{ClusterTopologyInfo, HostInfo, HostRole, HostState};
pub use metrics::{ClusterMetrics, MetricsContainer, NoopMetrics};
pub use monitor::{MonitorService, MonitorSettings};
pub use topology::{HostFilter, TopologyCache, TopologyService, TopologyServiceInterface};
