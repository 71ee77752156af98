/// Aggregate view of one cluster as returned by a single discovery query
use std::collections::HashSet;
use std::time::SystemTime;

use parking_lot::Mutex;

use super::{HostInfo, HostState};

/// Mutable view state layered on an otherwise immutable snapshot
#[derive(Debug, Clone, Default)]
struct ViewState {
    current_reader: Option<usize>,
    last_used_reader: Option<HostInfo>,
    down_hosts: HashSet<String>,
}

/// Cluster topology snapshot.
///
/// Host lists keep the insertion order of the discovery query. The reader
/// cursor, the last used reader and the down-host marks may change after the
/// snapshot has been cached; everything else is fixed once built.
#[derive(Debug)]
pub struct ClusterTopologyInfo {
    writers: Vec<HostInfo>,
    readers: Vec<HostInfo>,
    last_updated: SystemTime,
    view: Mutex<ViewState>,
}

impl ClusterTopologyInfo {
    pub fn new() -> Self {
        Self {
            writers: Vec::new(),
            readers: Vec::new(),
            last_updated: SystemTime::now(),
            view: Mutex::new(ViewState::default()),
        }
    }

    /// Add a host to the writer or reader list according to its role
    pub fn add_host(&mut self, host: HostInfo) {
        if host.is_host_writer() {
            self.writers.push(host);
        } else {
            self.readers.push(host);
        }
    }

    pub fn total_hosts(&self) -> usize {
        self.writers.len() + self.readers.len()
    }

    pub fn num_readers(&self) -> usize {
        self.readers.len()
    }

    /// The authoritative writer, the first writer entry
    pub fn get_writer(&self) -> Option<HostInfo> {
        self.writers.first().map(|w| self.with_state(w))
    }

    pub fn get_writers(&self) -> Vec<HostInfo> {
        self.writers.iter().map(|w| self.with_state(w)).collect()
    }

    pub fn get_readers(&self) -> Vec<HostInfo> {
        self.readers.iter().map(|r| self.with_state(r)).collect()
    }

    pub fn get_reader(&self, index: usize) -> Option<HostInfo> {
        self.readers.get(index).map(|r| self.with_state(r))
    }

    /// Writers first, then readers, both in discovery order
    pub fn get_instances(&self) -> Vec<HostInfo> {
        self.writers
            .iter()
            .chain(self.readers.iter())
            .map(|h| self.with_state(h))
            .collect()
    }

    /// Round-robin over the readers
    pub fn get_next_reader(&self) -> Option<HostInfo> {
        if self.readers.is_empty() {
            return None;
        }
        let next = {
            let mut view = self.view.lock();
            let next = match view.current_reader {
                Some(current) => (current + 1) % self.readers.len(),
                None => 0,
            };
            view.current_reader = Some(next);
            next
        };
        self.get_reader(next)
    }

    pub fn is_multi_writer_cluster(&self) -> bool {
        self.writers.len() > 1
    }

    pub fn contains_instance(&self, instance_name: &str) -> bool {
        self.writers
            .iter()
            .chain(self.readers.iter())
            .any(|h| h.instance_name == instance_name)
    }

    pub fn get_last_used_reader(&self) -> Option<HostInfo> {
        self.view.lock().last_used_reader.clone()
    }

    pub fn set_last_used_reader(&self, reader: HostInfo) {
        self.view.lock().last_used_reader = Some(reader);
    }

    pub fn mark_host_down(&self, host: &HostInfo) {
        self.view.lock().down_hosts.insert(host.host_port_pair());
    }

    pub fn mark_host_up(&self, host: &HostInfo) {
        self.view.lock().down_hosts.remove(&host.host_port_pair());
    }

    pub fn is_host_down(&self, host: &HostInfo) -> bool {
        self.view.lock().down_hosts.contains(&host.host_port_pair())
    }

    pub fn get_down_hosts(&self) -> HashSet<String> {
        self.view.lock().down_hosts.clone()
    }

    /// Carry down-host marks over from the snapshot this one replaces
    pub fn inherit_down_hosts(&self, previous: &ClusterTopologyInfo) {
        let down = previous.get_down_hosts();
        let mut view = self.view.lock();
        for host in self.writers.iter().chain(self.readers.iter()) {
            let key = host.host_port_pair();
            if down.contains(&key) {
                view.down_hosts.insert(key);
            }
        }
    }

    pub fn time_last_updated(&self) -> SystemTime {
        self.last_updated
    }

    pub fn set_time_last_updated(&mut self, at: SystemTime) {
        self.last_updated = at;
    }

    /// Copy of this snapshot holding only the hosts accepted by `keep`
    pub fn filtered<F>(&self, keep: F) -> ClusterTopologyInfo
    where
        F: Fn(&HostInfo) -> bool,
    {
        let view = self.view.lock().clone();
        let readers: Vec<HostInfo> = self.readers.iter().filter(|h| keep(*h)).cloned().collect();
        ClusterTopologyInfo {
            writers: self.writers.iter().filter(|h| keep(*h)).cloned().collect(),
            last_updated: self.last_updated,
            view: Mutex::new(ViewState {
                current_reader: view.current_reader.filter(|i| *i < readers.len()),
                last_used_reader: view.last_used_reader,
                down_hosts: view.down_hosts,
            }),
            readers,
        }
    }

    fn with_state(&self, host: &HostInfo) -> HostInfo {
        let mut host = host.clone();
        if self.is_host_down(&host) {
            host.set_host_state(HostState::Down);
        } else {
            host.set_host_state(HostState::Up);
        }
        host
    }
}

impl Default for ClusterTopologyInfo {
    fn default() -> Self {
        Self::new()
    }
}

impl Clone for ClusterTopologyInfo {
    fn clone(&self) -> Self {
        Self {
            writers: self.writers.clone(),
            readers: self.readers.clone(),
            last_updated: self.last_updated,
            view: Mutex::new(self.view.lock().clone()),
        }
    }
}
