//! Compose definition parser

use super::config::{ComposeConfig, ServiceConfig};
use crate::error::{LabError, Result};

/// Compose definition parser
pub struct ComposeParser;

impl ComposeParser {
    /// Parse a compose definition. JSON is accepted as a YAML subset.
    pub fn parse_str(content: &str) -> Result<ComposeConfig> {
        let config: ComposeConfig = serde_yaml::from_str(content)
            .map_err(|e| LabError::Compose(format!("Failed to parse definition: {}", e)))?;

        if config.services.is_empty() {
            return Err(LabError::Compose("Definition has no services".to_string()));
        }

        Ok(config)
    }
}

/// The single service a compose-defined lab is provisioned from
#[derive(Debug, Clone)]
pub struct PrimaryService {
    pub name: String,
    pub service: ServiceConfig,
    /// Services in the definition that will not be started
    pub dropped: Vec<String>,
}

impl PrimaryService {
    /// Pick the service publishing `target_port`, else the first by name
    pub fn select(config: &ComposeConfig, target_port: Option<u16>) -> Result<Self> {
        let by_port = target_port.and_then(|port| {
            config
                .services
                .iter()
                .find(|(_, service)| service.container_ports().contains(&port))
        });

        let (name, service) = by_port
            .or_else(|| config.services.iter().next())
            .ok_or_else(|| LabError::Compose("Definition has no services".to_string()))?;

        let dropped = config
            .services
            .keys()
            .filter(|other| *other != name)
            .cloned()
            .collect();

        Ok(Self {
            name: name.clone(),
            service: service.clone(),
            dropped,
        })
    }
}
