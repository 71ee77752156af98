/// Registry of node monitors keyed by node alias
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::debug;

use super::node::{Monitor, MonitorOwner};
use crate::connection::{ConnectionHandler, DataSource};
use crate::host::HostInfo;

#[derive(Default)]
struct ContainerState {
    monitor_map: HashMap<String, Arc<Monitor>>,
    tasks: HashMap<u64, JoinHandle<()>>,
    available: VecDeque<Arc<Monitor>>,
}

/// Maps every node key to the monitor of its physical node, tracks the
/// running monitor tasks and keeps a pool of idle monitors for reuse.
pub struct MonitorThreadContainer {
    connection_handler: Arc<dyn ConnectionHandler>,
    datasource: DataSource,
    failure_detection_timeout: Duration,
    state: Mutex<ContainerState>,
}

impl MonitorThreadContainer {
    pub fn new(
        connection_handler: Arc<dyn ConnectionHandler>,
        datasource: DataSource,
        failure_detection_timeout: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            connection_handler,
            datasource,
            failure_detection_timeout,
            state: Mutex::new(ContainerState::default()),
        })
    }

    /// Running monitor registered under any of `node_keys`
    pub fn get_monitor(&self, node_keys: &HashSet<String>) -> Option<Arc<Monitor>> {
        let state = self.state.lock();
        Self::find_running(&state, node_keys)
    }

    fn find_running(state: &ContainerState, node_keys: &HashSet<String>) -> Option<Arc<Monitor>> {
        node_keys
            .iter()
            .filter_map(|key| state.monitor_map.get(key))
            .find(|monitor| !monitor.is_stopped())
            .cloned()
    }

    /// Monitor for the node named by `node_keys`, created or reused on demand
    /// and registered under every key of the set. A monitor taken from the
    /// pool is retargeted to `host`.
    pub fn get_or_create_monitor(
        self: &Arc<Self>,
        node_keys: &HashSet<String>,
        host: &HostInfo,
        disposal_time: Duration,
    ) -> Arc<Monitor> {
        let mut state = self.state.lock();

        let monitor = match Self::find_running(&state, node_keys) {
            Some(monitor) => monitor,
            None => match Self::pop_available(&mut state) {
                Some(monitor) => {
                    debug!("Reusing idle monitor {} for {:?}", monitor.id(), node_keys);
                    monitor.retarget(host);
                    monitor
                }
                None => {
                    let owner: Arc<dyn MonitorOwner> = self.clone();
                    let monitor = Arc::new(Monitor::new(
                        host.clone(),
                        self.connection_handler.clone(),
                        self.datasource.clone(),
                        self.failure_detection_timeout,
                        disposal_time,
                        Arc::downgrade(&owner),
                    ));
                    let handle = tokio::spawn(monitor.clone().run());
                    state.tasks.insert(monitor.id(), handle);
                    debug!("Started monitor {} for {:?}", monitor.id(), node_keys);
                    monitor
                }
            },
        };

        for key in node_keys {
            state.monitor_map.insert(key.clone(), monitor.clone());
        }
        monitor
    }

    fn pop_available(state: &mut ContainerState) -> Option<Arc<Monitor>> {
        while let Some(monitor) = state.available.pop_front() {
            if !monitor.is_stopped() {
                return Some(monitor);
            }
        }
        None
    }

    /// Unregister all keys of `monitor` and park it in the reuse pool
    pub fn reset_resource(&self, monitor: &Arc<Monitor>) {
        let mut state = self.state.lock();
        state.monitor_map.retain(|_, m| !Arc::ptr_eq(m, monitor));
        if !monitor.is_stopped() && !state.available.iter().any(|m| Arc::ptr_eq(m, monitor)) {
            state.available.push_back(monitor.clone());
        }
    }

    /// Forget `monitor` entirely
    pub fn release_resource(&self, monitor: &Arc<Monitor>) {
        let mut state = self.state.lock();
        state.monitor_map.retain(|_, m| !Arc::ptr_eq(m, monitor));
        state.available.retain(|m| !Arc::ptr_eq(m, monitor));
        state.tasks.remove(&monitor.id());
    }

    pub fn monitor_count(&self) -> usize {
        self.state.lock().tasks.len()
    }

    pub fn available_count(&self) -> usize {
        self.state.lock().available.len()
    }

    /// Stop every monitor and wait for the loops to end
    pub async fn release_all(&self) {
        let (monitors, handles): (Vec<Arc<Monitor>>, Vec<JoinHandle<()>>) = {
            let mut state = self.state.lock();
            let mut monitors: Vec<Arc<Monitor>> = state.monitor_map.drain().map(|(_, m)| m).collect();
            monitors.extend(state.available.drain(..));
            let handles = state.tasks.drain().map(|(_, h)| h).collect();
            (monitors, handles)
        };
        for monitor in &monitors {
            monitor.stop();
        }
        futures::future::join_all(handles).await;
    }
}

impl MonitorOwner for MonitorThreadContainer {
    fn notify_unused(&self, monitor: &Arc<Monitor>) {
        self.reset_resource(monitor);
    }

    fn notify_stopped(&self, monitor: &Arc<Monitor>) {
        self.release_resource(monitor);
    }
}
