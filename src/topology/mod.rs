/// Cluster topology discovery and caching.
///
/// `TopologyService` runs the discovery query over a live connection, turns
/// the rows into a `ClusterTopologyInfo` snapshot and caches it per cluster
/// id. A failed or empty refresh falls back to the cached snapshot, it is
/// never reported to the caller as an error.
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};
use tracing::{debug, warn};

use crate::connection::{ConnectionProxy, Row};
use crate::host::{ClusterTopologyInfo, HostInfo};
use crate::metrics::{MetricsContainer, NoopMetrics};

/// Discovery query: one row per instance that reported in the last 5 minutes
pub const RETRIEVE_TOPOLOGY_SQL: &str = "SELECT SERVER_ID, SESSION_ID, LAST_UPDATE_TIMESTAMP, REPLICA_LAG_IN_MILLISECONDS \
     FROM information_schema.replica_host_status \
     WHERE time_to_sec(timediff(now(), LAST_UPDATE_TIMESTAMP)) <= 300 \
     ORDER BY LAST_UPDATE_TIMESTAMP DESC";

/// Session marker identifying the writer row
pub const WRITER_SESSION_ID: &str = "MASTER_SESSION_ID";

/// Placeholder replaced by the instance id in host templates
pub const HOST_TEMPLATE_PLACEHOLDER: char = '?';

pub const DEFAULT_REFRESH_RATE: Duration = Duration::from_secs(30);

const COL_SERVER_ID: usize = 0;
const COL_SESSION_ID: usize = 1;
const COL_LAST_UPDATE: usize = 2;
const COL_REPLICA_LAG: usize = 3;

/// Allow/block lists of instance ids
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HostFilter {
    pub allowed: BTreeSet<String>,
    pub blocked: BTreeSet<String>,
}

impl HostFilter {
    pub fn allow<I, S>(hosts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            allowed: hosts.into_iter().map(Into::into).collect(),
            blocked: BTreeSet::new(),
        }
    }

    pub fn block<I, S>(hosts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            allowed: BTreeSet::new(),
            blocked: hosts.into_iter().map(Into::into).collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.allowed.is_empty() && self.blocked.is_empty()
    }

    /// Instance accepted by both lists
    pub fn accepts(&self, host: &HostInfo) -> bool {
        let id = host.instance_name.as_str();
        (self.allowed.is_empty() || self.allowed.contains(id)) && !self.blocked.contains(id)
    }
}

/// Cluster id to snapshot map, shareable between services
#[derive(Clone, Default)]
pub struct TopologyCache {
    inner: Arc<Mutex<HashMap<String, Arc<ClusterTopologyInfo>>>>,
}

impl TopologyCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, cluster_id: &str) -> Option<Arc<ClusterTopologyInfo>> {
        self.inner.lock().get(cluster_id).cloned()
    }

    pub fn put(&self, cluster_id: &str, topology: Arc<ClusterTopologyInfo>) {
        self.inner.lock().insert(cluster_id.to_string(), topology);
    }

    pub fn remove(&self, cluster_id: &str) {
        self.inner.lock().remove(cluster_id);
    }

    pub fn clear(&self) {
        self.inner.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }
}

/// Topology operations used by failover and custom endpoint tracking
#[async_trait]
pub trait TopologyServiceInterface: Send + Sync {
    fn set_cluster_id(&self, cluster_id: &str);

    fn set_cluster_instance_template(&self, template: HostInfo);

    fn set_refresh_rate(&self, refresh_rate: Duration);

    /// Cached snapshot, refreshed through `connection` when forced or stale
    async fn get_topology(
        &self,
        connection: &dyn ConnectionProxy,
        force_update: bool,
    ) -> Option<Arc<ClusterTopologyInfo>>;

    /// Query the topology through `connection` and cache it. Unlike
    /// `get_topology` a failed query yields `None`, never the cached snapshot.
    async fn refresh_topology(&self, connection: &dyn ConnectionProxy) -> Option<Arc<ClusterTopologyInfo>>;

    fn get_cached_topology(&self) -> Option<Arc<ClusterTopologyInfo>>;

    /// Snapshot restricted by the current host filter
    fn get_filtered_topology(&self, topology: Arc<ClusterTopologyInfo>) -> Arc<ClusterTopologyInfo>;

    fn set_host_filter(&self, filter: HostFilter);

    fn mark_host_down(&self, host: &HostInfo);

    fn mark_host_up(&self, host: &HostInfo);

    /// Drop the snapshot of the current cluster
    fn clear(&self);

    /// Drop every cached snapshot
    fn clear_all(&self);
}

/// Production topology service
pub struct TopologyService {
    cache: TopologyCache,
    cluster_id: RwLock<String>,
    instance_template: RwLock<Option<HostInfo>>,
    refresh_rate: RwLock<Duration>,
    host_filter: RwLock<HostFilter>,
    metrics: Arc<dyn MetricsContainer>,
}

impl TopologyService {
    pub fn new() -> Self {
        Self::with_cache(TopologyCache::new(), Arc::new(NoopMetrics))
    }

    pub fn with_cache(cache: TopologyCache, metrics: Arc<dyn MetricsContainer>) -> Self {
        Self {
            cache,
            cluster_id: RwLock::new(crate::utils::generate_id("cluster")),
            instance_template: RwLock::new(None),
            refresh_rate: RwLock::new(DEFAULT_REFRESH_RATE),
            host_filter: RwLock::new(HostFilter::default()),
            metrics,
        }
    }

    pub fn cluster_id(&self) -> String {
        self.cluster_id.read().clone()
    }

    pub fn host_filter(&self) -> HostFilter {
        self.host_filter.read().clone()
    }

    /// Wall-clock age check; `ts` older than the refresh rate needs a refresh
    pub fn refresh_needed(&self, ts: SystemTime) -> bool {
        let refresh_rate = *self.refresh_rate.read();
        match SystemTime::now().duration_since(ts) {
            Ok(age) => age > refresh_rate,
            Err(_) => false,
        }
    }

    async fn query_for_topology(&self, connection: &dyn ConnectionProxy) -> Option<ClusterTopologyInfo> {
        let started = Instant::now();
        let result = connection.query(RETRIEVE_TOPOLOGY_SQL).await;
        self.metrics.register_topology_query_execution_time(started.elapsed());

        match result {
            Ok(rows) if !rows.is_empty() => {
                self.metrics.register_topology_query(true);
                let template = self.instance_template.read().clone();
                match template {
                    Some(template) => Some(parse_topology(&rows, &template)),
                    None => {
                        warn!("No cluster instance template set, cannot build topology");
                        None
                    }
                }
            }
            Ok(_) => {
                self.metrics.register_topology_query(false);
                debug!("Topology query returned no rows");
                None
            }
            Err(e) => {
                self.metrics.register_topology_query(false);
                debug!("Topology query failed: {}", e);
                None
            }
        }
    }

    /// Query a fresh snapshot and cache it under `cluster_id`, carrying
    /// over the down marks of `previous`
    async fn store_latest(
        &self,
        connection: &dyn ConnectionProxy,
        cluster_id: &str,
        previous: Option<&ClusterTopologyInfo>,
    ) -> Option<Arc<ClusterTopologyInfo>> {
        let latest = self.query_for_topology(connection).await?;
        if let Some(previous) = previous {
            latest.inherit_down_hosts(previous);
        }
        let latest = Arc::new(latest);
        self.cache.put(cluster_id, latest.clone());
        Some(latest)
    }
}

impl Default for TopologyService {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TopologyServiceInterface for TopologyService {
    fn set_cluster_id(&self, cluster_id: &str) {
        *self.cluster_id.write() = cluster_id.to_string();
    }

    fn set_cluster_instance_template(&self, template: HostInfo) {
        *self.instance_template.write() = Some(template);
    }

    fn set_refresh_rate(&self, refresh_rate: Duration) {
        *self.refresh_rate.write() = refresh_rate;
    }

    async fn get_topology(
        &self,
        connection: &dyn ConnectionProxy,
        force_update: bool,
    ) -> Option<Arc<ClusterTopologyInfo>> {
        let cluster_id = self.cluster_id();
        let cached = self.cache.get(&cluster_id);

        if let Some(cached) = &cached {
            if !force_update && !self.refresh_needed(cached.time_last_updated()) {
                self.metrics.register_use_cached_topology(true);
                return Some(cached.clone());
            }
        }

        match self.store_latest(connection, &cluster_id, cached.as_deref()).await {
            Some(latest) => Some(latest),
            None => {
                self.metrics.register_use_cached_topology(cached.is_some());
                cached
            }
        }
    }

    async fn refresh_topology(&self, connection: &dyn ConnectionProxy) -> Option<Arc<ClusterTopologyInfo>> {
        let cluster_id = self.cluster_id();
        let cached = self.cache.get(&cluster_id);
        self.store_latest(connection, &cluster_id, cached.as_deref()).await
    }

    fn get_cached_topology(&self) -> Option<Arc<ClusterTopologyInfo>> {
        self.cache.get(&self.cluster_id())
    }

    fn get_filtered_topology(&self, topology: Arc<ClusterTopologyInfo>) -> Arc<ClusterTopologyInfo> {
        let filter = self.host_filter.read().clone();
        if filter.is_empty() {
            return topology;
        }
        Arc::new(topology.filtered(|host| filter.accepts(host)))
    }

    fn set_host_filter(&self, filter: HostFilter) {
        debug!(
            "Host filter updated: {} allowed, {} blocked",
            filter.allowed.len(),
            filter.blocked.len()
        );
        *self.host_filter.write() = filter;
    }

    fn mark_host_down(&self, host: &HostInfo) {
        if let Some(topology) = self.get_cached_topology() {
            topology.mark_host_down(host);
        }
    }

    fn mark_host_up(&self, host: &HostInfo) {
        if let Some(topology) = self.get_cached_topology() {
            topology.mark_host_up(host);
        }
    }

    fn clear(&self) {
        self.cache.remove(&self.cluster_id());
    }

    fn clear_all(&self) {
        self.cache.clear();
    }
}

/// Build a snapshot from discovery rows.
///
/// Among writer rows only the most recently updated one survives; the others
/// are dropped. Readers are deduplicated by instance id.
pub fn parse_topology(rows: &[Row], template: &HostInfo) -> ClusterTopologyInfo {
    let mut writer: Option<HostInfo> = None;
    let mut readers: Vec<HostInfo> = Vec::new();

    for row in rows {
        let Some(host) = create_host(row, template) else {
            continue;
        };

        if host.is_host_writer() {
            let newer = writer
                .as_ref()
                .map_or(true, |current| host.last_updated > current.last_updated);
            if newer {
                writer = Some(host);
            }
        } else if !readers.iter().any(|r| r.instance_name == host.instance_name) {
            readers.push(host);
        }
    }

    let mut topology = ClusterTopologyInfo::new();
    match writer {
        Some(writer) => {
            readers.retain(|r| r.instance_name != writer.instance_name);
            topology.add_host(writer);
        }
        None => warn!("Invalid topology: no writer instance detected"),
    }
    for reader in readers {
        topology.add_host(reader);
    }
    topology
}

fn create_host(row: &Row, template: &HostInfo) -> Option<HostInfo> {
    let column = |idx: usize| row.get(idx).cloned().flatten();

    let instance_name = column(COL_SERVER_ID)?;
    if instance_name.is_empty() {
        return None;
    }
    let session_id = column(COL_SESSION_ID).unwrap_or_default();
    let last_updated = column(COL_LAST_UPDATE).unwrap_or_default();
    let replica_lag = column(COL_REPLICA_LAG)
        .and_then(|lag| lag.parse::<f64>().ok())
        .unwrap_or(0.0);

    let host = template
        .host()
        .replacen(HOST_TEMPLATE_PLACEHOLDER, &instance_name, 1);
    let is_writer = session_id == WRITER_SESSION_ID;

    Some(HostInfo::from_discovery(
        host,
        template.port(),
        instance_name,
        session_id,
        last_updated,
        replica_lag,
        is_writer,
    ))
}
