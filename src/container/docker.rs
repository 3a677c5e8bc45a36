//! Docker Engine implementation of the container runtime

use super::config::{
    ContainerHandle, ContainerSpec, NetworkAttributes, RuntimeConfig, StatsSnapshot, Teardown,
};
use super::runtime::ContainerRuntime;
use crate::error::{LabError, Result};
use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, InspectContainerOptions, LogOutput, LogsOptions,
    RemoveContainerOptions, StartContainerOptions, StatsOptions, StopContainerOptions,
};
use bollard::errors::Error as DockerError;
use bollard::models::{ContainerInspectResponse, HostConfig, PortBinding};
use bollard::network::InspectNetworkOptions;
use bollard::{Docker, API_DEFAULT_VERSION};
use futures::{StreamExt, TryStreamExt};
use std::collections::HashMap;
use tracing::{debug, error, info, warn};

/// Container runtime backed by a Docker Engine connection.
///
/// The connection is made once, in [`DockerRuntime::connect`]. When neither
/// the configured socket nor the environment yields a responsive engine the
/// runtime stays unavailable for its whole lifetime.
pub struct DockerRuntime {
    docker: Option<Docker>,
    config: RuntimeConfig,
}

impl DockerRuntime {
    /// Connect to the engine, trying the configured socket first and the
    /// environment (`DOCKER_HOST` or platform defaults) second
    pub async fn connect(config: RuntimeConfig) -> Self {
        let docker = match Self::connect_socket(&config).await {
            Ok(docker) => Some(docker),
            Err(e) => {
                debug!(
                    "Docker socket {} not usable ({}), trying environment",
                    config.socket_path.display(),
                    e
                );
                match Self::connect_env().await {
                    Ok(docker) => Some(docker),
                    Err(e) => {
                        error!("Failed to connect to Docker: {}", e);
                        None
                    }
                }
            }
        };

        if docker.is_some() {
            info!("Connected to Docker engine");
        }

        Self { docker, config }
    }

    /// A runtime that never connects
    pub fn unavailable(config: RuntimeConfig) -> Self {
        Self {
            docker: None,
            config,
        }
    }

    async fn connect_socket(config: &RuntimeConfig) -> std::result::Result<Docker, DockerError> {
        let path = config.socket_path.to_string_lossy();
        let docker = Docker::connect_with_unix(&path, config.timeout_secs, API_DEFAULT_VERSION)?;
        docker.ping().await?;
        Ok(docker)
    }

    async fn connect_env() -> std::result::Result<Docker, DockerError> {
        let docker = Docker::connect_with_local_defaults()?;
        docker.ping().await?;
        Ok(docker)
    }

    fn client(&self) -> Result<&Docker> {
        self.docker.as_ref().ok_or(LabError::RuntimeUnavailable)
    }
}

fn status_code(e: &DockerError) -> Option<u16> {
    match e {
        DockerError::DockerResponseServerError { status_code, .. } => Some(*status_code),
        _ => None,
    }
}

/// Map an engine stop/remove response onto a teardown outcome.
/// Not found means already gone; not modified (stop) means already stopped.
fn teardown_outcome(
    result: std::result::Result<(), DockerError>,
    container_id: &str,
) -> Result<Teardown> {
    match result {
        Ok(()) => Ok(Teardown::Done),
        Err(e) => match status_code(&e) {
            Some(404) => Ok(Teardown::AlreadyGone),
            Some(304) => Ok(Teardown::Done),
            _ => Err(LabError::TeardownFailed {
                container: container_id.to_string(),
                message: e.to_string(),
            }),
        },
    }
}

fn runtime_error(e: DockerError) -> LabError {
    LabError::Runtime(e.to_string())
}

fn create_config(spec: &ContainerSpec) -> Config<String> {
    let mut exposed_ports = HashMap::new();
    let mut port_bindings = HashMap::new();
    for port in &spec.ports {
        exposed_ports.insert(port.key(), HashMap::new());
        port_bindings.insert(
            port.key(),
            Some(vec![PortBinding {
                host_ip: None,
                host_port: port.host_port.map(|p| p.to_string()),
            }]),
        );
    }

    let host_config = HostConfig {
        memory: spec
            .resources
            .memory_limit
            .and_then(|m| i64::try_from(m).ok()),
        cpu_quota: spec.resources.cpu_quota,
        cpu_period: spec.resources.cpu_period,
        port_bindings: Some(port_bindings),
        network_mode: spec.network.clone(),
        ..Default::default()
    };

    Config {
        image: Some(spec.image.clone()),
        cmd: if spec.cmd.is_empty() {
            None
        } else {
            Some(spec.cmd.clone())
        },
        env: Some(spec.env_list()),
        exposed_ports: Some(exposed_ports),
        labels: Some(spec.labels.clone()),
        host_config: Some(host_config),
        ..Default::default()
    }
}

fn network_attributes(info: ContainerInspectResponse) -> NetworkAttributes {
    let settings = info.network_settings.unwrap_or_default();

    let networks = settings
        .networks
        .unwrap_or_default()
        .into_iter()
        .map(|(name, endpoint)| (name, endpoint.ip_address.filter(|ip| !ip.is_empty())))
        .collect();

    let port_bindings = settings
        .ports
        .unwrap_or_default()
        .into_iter()
        .map(|(key, bindings)| {
            let host_ports = bindings
                .unwrap_or_default()
                .iter()
                .filter_map(|b| b.host_port.as_deref())
                .filter_map(|p| p.parse().ok())
                .collect();
            (key, host_ports)
        })
        .collect();

    NetworkAttributes {
        networks,
        port_bindings,
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    fn is_available(&self) -> bool {
        self.docker.is_some()
    }

    async fn create_container(&self, spec: &ContainerSpec) -> Result<ContainerHandle> {
        let docker = self.client()?;

        let options = CreateContainerOptions {
            name: spec.name.clone(),
            platform: None,
        };
        let response = docker
            .create_container(Some(options), create_config(spec))
            .await
            .map_err(|e| LabError::InstanceCreationFailed(e.to_string()))?;

        for warning in &response.warnings {
            warn!("Docker warning for {}: {}", spec.name, warning);
        }

        if let Err(e) = docker
            .start_container(&response.id, None::<StartContainerOptions<String>>)
            .await
        {
            let force = RemoveContainerOptions {
                force: true,
                ..Default::default()
            };
            if let Err(cleanup) = docker.remove_container(&response.id, Some(force)).await {
                warn!(
                    "Failed to remove unstarted container {}: {}",
                    response.id, cleanup
                );
            }
            return Err(LabError::InstanceCreationFailed(e.to_string()));
        }

        debug!("Started container {} ({})", spec.name, response.id);

        Ok(ContainerHandle {
            id: response.id,
            name: spec.name.clone(),
        })
    }

    async fn inspect(&self, container_id: &str) -> Result<NetworkAttributes> {
        let docker = self.client()?;
        let info = docker
            .inspect_container(container_id, None::<InspectContainerOptions>)
            .await
            .map_err(runtime_error)?;

        Ok(network_attributes(info))
    }

    async fn stop(&self, container_id: &str) -> Result<Teardown> {
        let docker = self.client()?;
        let options = StopContainerOptions {
            t: self.config.stop_timeout_secs,
        };

        let result = docker.stop_container(container_id, Some(options)).await;
        teardown_outcome(result, container_id)
    }

    async fn remove(&self, container_id: &str) -> Result<Teardown> {
        let docker = self.client()?;
        let options = RemoveContainerOptions {
            force: true,
            ..Default::default()
        };

        let result = docker.remove_container(container_id, Some(options)).await;
        teardown_outcome(result, container_id)
    }

    async fn logs(&self, container_id: &str, tail: usize) -> Result<String> {
        let docker = self.client()?;
        let options = LogsOptions::<String> {
            stdout: true,
            stderr: true,
            tail: tail.to_string(),
            ..Default::default()
        };

        let chunks: Vec<LogOutput> = docker
            .logs(container_id, Some(options))
            .try_collect()
            .await
            .map_err(runtime_error)?;

        let mut text = String::new();
        for chunk in chunks {
            text.push_str(&String::from_utf8_lossy(&chunk.into_bytes()));
        }
        Ok(text)
    }

    async fn stats(&self, container_id: &str) -> Result<StatsSnapshot> {
        let docker = self.client()?;
        let options = StatsOptions {
            stream: false,
            one_shot: true,
        };

        let mut stream = Box::pin(docker.stats(container_id, Some(options)));
        let sample = stream
            .next()
            .await
            .ok_or_else(|| LabError::Runtime(format!("No stats sample for {}", container_id)))?
            .map_err(runtime_error)?;

        Ok(StatsSnapshot::from_raw(serde_json::to_value(&sample)?))
    }

    async fn network_exists(&self, name: &str) -> Result<bool> {
        let docker = self.client()?;

        match docker
            .inspect_network(name, None::<InspectNetworkOptions<String>>)
            .await
        {
            Ok(_) => Ok(true),
            Err(e) if status_code(&e) == Some(404) => Ok(false),
            Err(e) => Err(runtime_error(e)),
        }
    }
}
