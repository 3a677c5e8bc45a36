//! Compose definition types
//!
//! Only the parts of the compose format that affect single-container
//! provisioning are modelled; unknown keys are ignored.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

/// Compose file configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ComposeConfig {
    /// Compose file version
    #[serde(default)]
    pub version: Option<String>,
    /// Services, ordered by name
    #[serde(default)]
    pub services: BTreeMap<String, ServiceConfig>,
}

/// Service configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// Image name
    #[serde(default)]
    pub image: Option<String>,
    /// Command to run
    #[serde(default)]
    pub command: Option<CommandConfig>,
    /// Environment variables
    #[serde(default)]
    pub environment: Option<EnvironmentConfig>,
    /// Exposed ports
    #[serde(default)]
    pub expose: Option<Vec<PortConfig>>,
    /// Port mappings
    #[serde(default)]
    pub ports: Option<Vec<PortConfig>>,
}

impl ServiceConfig {
    /// Command in exec form
    pub fn command_args(&self) -> Vec<String> {
        match &self.command {
            Some(CommandConfig::Shell(s)) => {
                vec!["/bin/sh".to_string(), "-c".to_string(), s.clone()]
            }
            Some(CommandConfig::Exec(arr)) => arr.clone(),
            None => Vec::new(),
        }
    }

    /// Environment as key/value pairs; keys without a value are skipped
    pub fn env_pairs(&self) -> Vec<(String, String)> {
        match &self.environment {
            Some(EnvironmentConfig::Array(arr)) => arr
                .iter()
                .filter_map(|item| item.split_once('='))
                .map(|(key, value)| (key.to_string(), value.to_string()))
                .collect(),
            Some(EnvironmentConfig::Map(map)) => {
                let mut pairs: Vec<(String, String)> = map
                    .iter()
                    .filter_map(|(key, value)| value.as_ref().map(|v| (key.clone(), v.clone())))
                    .collect();
                pairs.sort();
                pairs
            }
            None => Vec::new(),
        }
    }

    /// Container-side ports named by `ports` and `expose`
    pub fn container_ports(&self) -> Vec<u16> {
        self.ports
            .iter()
            .chain(self.expose.iter())
            .flatten()
            .filter_map(PortConfig::container_port)
            .collect()
    }
}

/// Command configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CommandConfig {
    /// Shell command string
    Shell(String),
    /// Exec form array
    Exec(Vec<String>),
}

/// Environment configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EnvironmentConfig {
    /// Array of KEY=value strings
    Array(Vec<String>),
    /// Map of key to value
    Map(HashMap<String, Option<String>>),
}

/// Port configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PortConfig {
    /// Bare number: 80
    Number(u16),
    /// Short syntax: "8080:80", "127.0.0.1:8080:80/tcp"
    Short(String),
    /// Long syntax
    Long(PortConfigLong),
}

impl PortConfig {
    /// The port inside the container
    pub fn container_port(&self) -> Option<u16> {
        match self {
            PortConfig::Number(port) => Some(*port),
            PortConfig::Short(s) => {
                let without_proto = s.split('/').next().unwrap_or(s);
                without_proto.rsplit(':').next()?.trim().parse().ok()
            }
            PortConfig::Long(long) => Some(long.target),
        }
    }
}

/// Long port configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PortConfigLong {
    /// Target port in container
    pub target: u16,
    /// Published port on host
    pub published: Option<String>,
    /// Protocol (tcp/udp)
    pub protocol: Option<String>,
}
