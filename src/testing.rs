/// Test doubles for the wire-protocol seams
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::connection::{ConnectionHandler, ConnectionProxy, DataSource, Row};
use crate::error::{DriverError, DriverResult};
use crate::host::{ClusterTopologyInfo, HostInfo};
use crate::topology::{HostFilter, TopologyServiceInterface, WRITER_SESSION_ID};

pub const TEST_TEMPLATE: &str = "?.xyz.us-east-2.rds.amazonaws.com";

/// Discovery row for `instance`
pub fn topology_row(instance: &str, writer: bool, last_updated: &str) -> Row {
    let session = if writer {
        WRITER_SESSION_ID.to_string()
    } else {
        format!("session-{}", instance)
    };
    vec![
        Some(instance.to_string()),
        Some(session),
        Some(last_updated.to_string()),
        Some("0".to_string()),
    ]
}

/// Host named after the test template
pub fn test_host(instance: &str) -> HostInfo {
    let mut host = HostInfo::new(TEST_TEMPLATE.replacen('?', instance, 1), 3306);
    host.instance_name = instance.to_string();
    host
}

/// Topology with one writer and the given readers
pub fn test_topology(writer: &str, readers: &[&str]) -> ClusterTopologyInfo {
    let mut topology = ClusterTopologyInfo::new();
    let mut w = test_host(writer);
    w.mark_as_writer(true);
    topology.add_host(w);
    for reader in readers {
        topology.add_host(test_host(reader));
    }
    topology
}

pub struct MockConnection {
    name: String,
    connected: AtomicBool,
    ping_ok: AtomicBool,
    query_ok: AtomicBool,
    rows: Arc<Mutex<Vec<Row>>>,
    queries: AtomicUsize,
    closes: AtomicUsize,
    socket_closes: AtomicUsize,
}

impl MockConnection {
    pub fn new(name: &str) -> Self {
        Self::with_shared_rows(name, Arc::new(Mutex::new(Vec::new())))
    }

    pub fn with_shared_rows(name: &str, rows: Arc<Mutex<Vec<Row>>>) -> Self {
        Self {
            name: name.to_string(),
            connected: AtomicBool::new(true),
            ping_ok: AtomicBool::new(true),
            query_ok: AtomicBool::new(true),
            rows,
            queries: AtomicUsize::new(0),
            closes: AtomicUsize::new(0),
            socket_closes: AtomicUsize::new(0),
        }
    }

    pub fn set_rows(&self, rows: Vec<Row>) {
        *self.rows.lock() = rows;
    }

    pub fn rows(&self) -> Vec<Row> {
        self.rows.lock().clone()
    }

    pub fn set_ping_ok(&self, ok: bool) {
        self.ping_ok.store(ok, Ordering::SeqCst);
    }

    pub fn set_query_ok(&self, ok: bool) {
        self.query_ok.store(ok, Ordering::SeqCst);
    }

    pub fn query_count(&self) -> usize {
        self.queries.load(Ordering::SeqCst)
    }

    pub fn close_count(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    pub fn socket_close_count(&self) -> usize {
        self.socket_closes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ConnectionProxy for MockConnection {
    async fn query(&self, _sql: &str) -> DriverResult<Vec<Row>> {
        self.queries.fetch_add(1, Ordering::SeqCst);
        if !self.is_connected() || !self.query_ok.load(Ordering::SeqCst) {
            return Err(DriverError::connection_lost(format!("{} is unreachable", self.name)));
        }
        Ok(self.rows.lock().clone())
    }

    async fn ping(&self) -> DriverResult<()> {
        if self.is_connected() && self.ping_ok.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(DriverError::connection_lost("ping failed"))
        }
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn close(&self) {
        self.closes.fetch_add(1, Ordering::SeqCst);
        self.connected.store(false, Ordering::SeqCst);
    }

    fn close_socket(&self) {
        self.socket_closes.fetch_add(1, Ordering::SeqCst);
        self.connected.store(false, Ordering::SeqCst);
    }
}

struct HostBehavior {
    available: bool,
    delay: Duration,
    query_ok: bool,
    rows: Arc<Mutex<Vec<Row>>>,
}

/// Hands out a fresh `MockConnection` per successful connect
#[derive(Default)]
pub struct MockConnectionHandler {
    hosts: Mutex<HashMap<String, HostBehavior>>,
    attempts: Mutex<HashMap<String, usize>>,
    opened: Mutex<Vec<(String, Arc<MockConnection>)>>,
}

impl MockConnectionHandler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `host` reachable; its connections answer queries with `rows`
    pub fn add_host(&self, host: &str, rows: Vec<Row>) {
        let mut hosts = self.hosts.lock();
        let behavior = hosts.entry(host.to_string()).or_insert_with(|| HostBehavior {
            available: true,
            delay: Duration::ZERO,
            query_ok: true,
            rows: Arc::new(Mutex::new(Vec::new())),
        });
        behavior.available = true;
        *behavior.rows.lock() = rows;
    }

    /// Update the rows seen by existing and future connections to `host`
    pub fn set_rows(&self, host: &str, rows: Vec<Row>) {
        if let Some(behavior) = self.hosts.lock().get(host) {
            *behavior.rows.lock() = rows;
        }
    }

    pub fn set_available(&self, host: &str, available: bool) {
        if let Some(behavior) = self.hosts.lock().get_mut(host) {
            behavior.available = available;
        }
    }

    pub fn set_delay(&self, host: &str, delay: Duration) {
        if let Some(behavior) = self.hosts.lock().get_mut(host) {
            behavior.delay = delay;
        }
    }

    /// Queries on connections opened from now on fail
    pub fn set_query_ok(&self, host: &str, ok: bool) {
        if let Some(behavior) = self.hosts.lock().get_mut(host) {
            behavior.query_ok = ok;
        }
    }

    pub fn attempts(&self, host: &str) -> usize {
        self.attempts.lock().get(host).copied().unwrap_or(0)
    }

    pub fn opened(&self, host: &str) -> Vec<Arc<MockConnection>> {
        self.opened
            .lock()
            .iter()
            .filter(|(h, _)| h == host)
            .map(|(_, c)| c.clone())
            .collect()
    }
}

#[async_trait]
impl ConnectionHandler for MockConnectionHandler {
    async fn connect(
        &self,
        host: &HostInfo,
        _settings: Option<&DataSource>,
    ) -> Option<Arc<dyn ConnectionProxy>> {
        let name = host.host().to_string();
        *self.attempts.lock().entry(name.clone()).or_insert(0) += 1;

        let behavior = {
            let hosts = self.hosts.lock();
            hosts
                .get(&name)
                .map(|b| (b.available, b.delay, b.query_ok, b.rows.clone()))
        };
        let (available, delay, query_ok, rows) = behavior?;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if !available {
            return None;
        }

        let conn = Arc::new(MockConnection::with_shared_rows(&name, rows));
        conn.set_query_ok(query_ok);
        self.opened.lock().push((name, conn.clone()));
        Some(conn)
    }
}

/// Topology service double recording filter updates; it never knows a
/// topology
#[derive(Default)]
pub struct RecordingTopologyService {
    filters: Mutex<Vec<HostFilter>>,
    down: Mutex<Vec<String>>,
    up: Mutex<Vec<String>>,
}

impl RecordingTopologyService {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn filter_updates(&self) -> Vec<HostFilter> {
        self.filters.lock().clone()
    }

    pub fn marked_down(&self) -> Vec<String> {
        self.down.lock().clone()
    }

    pub fn marked_up(&self) -> Vec<String> {
        self.up.lock().clone()
    }
}

#[async_trait]
impl TopologyServiceInterface for RecordingTopologyService {
    fn set_cluster_id(&self, _cluster_id: &str) {}

    fn set_cluster_instance_template(&self, _template: HostInfo) {}

    fn set_refresh_rate(&self, _refresh_rate: Duration) {}

    async fn get_topology(
        &self,
        _connection: &dyn ConnectionProxy,
        _force_update: bool,
    ) -> Option<Arc<ClusterTopologyInfo>> {
        None
    }

    async fn refresh_topology(&self, _connection: &dyn ConnectionProxy) -> Option<Arc<ClusterTopologyInfo>> {
        None
    }

    fn get_cached_topology(&self) -> Option<Arc<ClusterTopologyInfo>> {
        None
    }

    fn get_filtered_topology(&self, topology: Arc<ClusterTopologyInfo>) -> Arc<ClusterTopologyInfo> {
        topology
    }

    fn set_host_filter(&self, filter: HostFilter) {
        self.filters.lock().push(filter);
    }

    fn mark_host_down(&self, host: &HostInfo) {
        self.down.lock().push(host.host_port_pair());
    }

    fn mark_host_up(&self, host: &HostInfo) {
        self.up.lock().push(host.host_port_pair());
    }

    fn clear(&self) {}

    fn clear_all(&self) {}
}
