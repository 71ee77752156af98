/// Cluster member descriptions shared by topology, monitoring and failover
pub mod topology;

pub use topology::ClusterTopologyInfo;

use std::fmt;

/// Role of an instance inside the cluster
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HostRole {
    Writer,
    Reader,
}

/// Reachability as last observed by this client
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HostState {
    Up,
    Down,
}

/// One cluster member as reported by the discovery query
#[derive(Debug, Clone, PartialEq)]
pub struct HostInfo {
    host: String,
    port: u16,
    role: HostRole,
    state: HostState,
    pub instance_name: String,
    pub session_id: String,
    pub last_updated: String,
    pub replica_lag: f64,
}

impl HostInfo {
    pub fn new<S: Into<String>>(host: S, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            role: HostRole::Reader,
            state: HostState::Up,
            instance_name: String::new(),
            session_id: String::new(),
            last_updated: String::new(),
            replica_lag: 0.0,
        }
    }

    /// Host built from a discovery row
    pub fn from_discovery<S: Into<String>>(
        host: S,
        port: u16,
        instance_name: String,
        session_id: String,
        last_updated: String,
        replica_lag: f64,
        is_writer: bool,
    ) -> Self {
        let mut info = Self::new(host, port);
        info.instance_name = instance_name;
        info.session_id = session_id;
        info.last_updated = last_updated;
        info.replica_lag = replica_lag;
        info.mark_as_writer(is_writer);
        info
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn role(&self) -> HostRole {
        self.role
    }

    pub fn state(&self) -> HostState {
        self.state
    }

    /// `host:port`, the identifier used for up/down bookkeeping
    pub fn host_port_pair(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn is_host_up(&self) -> bool {
        self.state == HostState::Up
    }

    pub fn is_host_down(&self) -> bool {
        self.state == HostState::Down
    }

    pub fn set_host_state(&mut self, state: HostState) {
        self.state = state;
    }

    pub fn is_host_writer(&self) -> bool {
        self.role == HostRole::Writer
    }

    pub fn mark_as_writer(&mut self, writer: bool) {
        self.role = if writer { HostRole::Writer } else { HostRole::Reader };
    }

    /// Two descriptions name the same instance. Instance names win when both
    /// sides carry one, otherwise the endpoint is compared.
    pub fn is_host_same(&self, other: &HostInfo) -> bool {
        if !self.instance_name.is_empty() && !other.instance_name.is_empty() {
            return self.instance_name == other.instance_name;
        }
        self.host.eq_ignore_ascii_case(&other.host) && self.port == other.port
    }
}

impl fmt::Display for HostInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let role = match self.role {
            HostRole::Writer => "writer",
            HostRole::Reader => "reader",
        };
        let state = match self.state {
            HostState::Up => "up",
            HostState::Down => "down",
        };
        write!(f, "{}:{} ({}, {}", self.host, self.port, role, state)?;
        if !self.instance_name.is_empty() {
            write!(f, ", {}", self.instance_name)?;
        }
        write!(f, ")")
    }
}
