//! Container specification and runtime-reported attributes

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;

/// Default Docker Engine socket
pub const DEFAULT_SOCKET_PATH: &str = "/var/run/docker.sock";

/// Connection settings for the container runtime
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Primary Unix socket address
    pub socket_path: PathBuf,
    /// Transport timeout in seconds
    pub timeout_secs: u64,
    /// Grace period given to a container on stop, in seconds
    pub stop_timeout_secs: i64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            socket_path: PathBuf::from(DEFAULT_SOCKET_PATH),
            timeout_secs: 120,
            stop_timeout_secs: 10,
        }
    }
}

/// Everything the runtime needs to create one container
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerSpec {
    /// Container name
    pub name: String,
    /// Image name/tag
    pub image: String,
    /// Command override, empty for the image default
    pub cmd: Vec<String>,
    /// Environment variables
    pub env: BTreeMap<String, String>,
    /// Published ports
    pub ports: Vec<PortSpec>,
    /// Resource limits
    pub resources: ResourceLimits,
    /// Network to attach to, `None` for the runtime default
    pub network: Option<String>,
    /// Container labels
    pub labels: HashMap<String, String>,
}

impl ContainerSpec {
    /// Create a new container specification
    pub fn new(name: &str, image: &str) -> Self {
        Self {
            name: name.to_string(),
            image: image.to_string(),
            cmd: Vec::new(),
            env: BTreeMap::new(),
            ports: Vec::new(),
            resources: ResourceLimits::default(),
            network: None,
            labels: HashMap::new(),
        }
    }

    /// Set command to run
    pub fn cmd(mut self, cmd: Vec<String>) -> Self {
        self.cmd = cmd;
        self
    }

    /// Add environment variable
    pub fn env(mut self, key: &str, value: &str) -> Self {
        self.env.insert(key.to_string(), value.to_string());
        self
    }

    /// Publish a container port on a runtime-assigned host port
    pub fn port(mut self, container_port: u16) -> Self {
        self.ports.push(PortSpec {
            container_port,
            protocol: Protocol::Tcp,
            host_port: None,
        });
        self
    }

    /// Set resource limits
    pub fn resources(mut self, resources: ResourceLimits) -> Self {
        self.resources = resources;
        self
    }

    /// Attach to a named network
    pub fn network(mut self, network: Option<String>) -> Self {
        self.network = network;
        self
    }

    /// Add label
    pub fn label(mut self, key: &str, value: &str) -> Self {
        self.labels.insert(key.to_string(), value.to_string());
        self
    }

    /// Environment in `KEY=value` form
    pub fn env_list(&self) -> Vec<String> {
        self.env
            .iter()
            .map(|(key, value)| format!("{}={}", key, value))
            .collect()
    }
}

/// Port publication
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortSpec {
    pub container_port: u16,
    pub protocol: Protocol,
    /// Fixed host port, `None` lets the runtime pick one
    pub host_port: Option<u16>,
}

impl PortSpec {
    /// Engine key for this port, e.g. `8080/tcp`
    pub fn key(&self) -> String {
        port_key(self.container_port, self.protocol)
    }
}

/// Engine key for a container port
pub fn port_key(port: u16, protocol: Protocol) -> String {
    format!("{}/{}", port, protocol)
}

/// Network protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Tcp,
    Udp,
}

impl std::fmt::Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Protocol::Tcp => write!(f, "tcp"),
            Protocol::Udp => write!(f, "udp"),
        }
    }
}

/// Resource limits
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceLimits {
    /// Memory limit in bytes
    pub memory_limit: Option<u64>,
    /// CPU quota in microseconds per period
    pub cpu_quota: Option<i64>,
    /// CPU period in microseconds
    pub cpu_period: Option<i64>,
}

/// Handle to a created container
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerHandle {
    pub id: String,
    pub name: String,
}

/// Outcome of an idempotent teardown call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Teardown {
    /// The runtime acted on the container
    Done,
    /// The container did not exist
    AlreadyGone,
}

/// Network attributes reported by the runtime for one container
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkAttributes {
    /// Network name to assigned address, `None` while unassigned
    pub networks: BTreeMap<String, Option<String>>,
    /// Port key (`8080/tcp`) to host ports bound for it
    pub port_bindings: BTreeMap<String, Vec<u16>>,
}

impl NetworkAttributes {
    /// First assigned address across attached networks
    pub fn primary_ip(&self) -> Option<String> {
        self.networks
            .values()
            .flatten()
            .find(|ip| !ip.is_empty())
            .cloned()
    }

    /// First host port bound for the given container port
    pub fn host_port(&self, container_port: u16, protocol: Protocol) -> Option<u16> {
        self.port_bindings
            .get(&port_key(container_port, protocol))
            .and_then(|ports| ports.first().copied())
    }
}

/// One resource-usage sample
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    pub cpu_percent: Option<f64>,
    pub memory_usage: Option<u64>,
    pub memory_limit: Option<u64>,
    pub network_rx_bytes: u64,
    pub network_tx_bytes: u64,
    pub pids: Option<u64>,
    /// The sample exactly as the engine reported it
    pub raw: serde_json::Value,
}

impl StatsSnapshot {
    /// Summarize an engine stats document
    pub fn from_raw(raw: serde_json::Value) -> Self {
        let u64_at = |pointer: &str| raw.pointer(pointer).and_then(|v| v.as_u64());

        let cpu_percent = match (
            u64_at("/cpu_stats/cpu_usage/total_usage"),
            u64_at("/precpu_stats/cpu_usage/total_usage"),
            u64_at("/cpu_stats/system_cpu_usage"),
            u64_at("/precpu_stats/system_cpu_usage"),
        ) {
            (Some(total), Some(pre_total), Some(system), Some(pre_system))
                if system > pre_system =>
            {
                let cpus = u64_at("/cpu_stats/online_cpus").unwrap_or(1).max(1) as f64;
                let cpu_delta = total.saturating_sub(pre_total) as f64;
                let system_delta = (system - pre_system) as f64;
                Some(cpu_delta / system_delta * cpus * 100.0)
            }
            _ => None,
        };

        let (network_rx_bytes, network_tx_bytes) = raw
            .get("networks")
            .and_then(|n| n.as_object())
            .map(|networks| {
                networks.values().fold((0u64, 0u64), |(rx, tx), iface| {
                    (
                        rx + iface.get("rx_bytes").and_then(|v| v.as_u64()).unwrap_or(0),
                        tx + iface.get("tx_bytes").and_then(|v| v.as_u64()).unwrap_or(0),
                    )
                })
            })
            .unwrap_or((0, 0));

        Self {
            cpu_percent,
            memory_usage: u64_at("/memory_stats/usage"),
            memory_limit: u64_at("/memory_stats/limit"),
            network_rx_bytes,
            network_tx_bytes,
            pids: u64_at("/pids_stats/current"),
            raw,
        }
    }
}
