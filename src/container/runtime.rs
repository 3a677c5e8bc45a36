//! Container runtime capability

use super::config::{ContainerHandle, ContainerSpec, NetworkAttributes, StatsSnapshot, Teardown};
use crate::error::Result;
use async_trait::async_trait;

/// Operations the lab manager needs from a container engine.
///
/// Containers are addressed by the opaque id the runtime returned from
/// [`ContainerRuntime::create_container`]. Implementations that lost (or never
/// had) their engine connection fail every call with
/// [`LabError::RuntimeUnavailable`](crate::LabError::RuntimeUnavailable).
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Whether an engine connection was established
    fn is_available(&self) -> bool;

    /// Create and start a detached container
    async fn create_container(&self, spec: &ContainerSpec) -> Result<ContainerHandle>;

    /// Refreshed network attributes; fields may be empty while unassigned
    async fn inspect(&self, container_id: &str) -> Result<NetworkAttributes>;

    /// Stop a container. A missing container is [`Teardown::AlreadyGone`].
    async fn stop(&self, container_id: &str) -> Result<Teardown>;

    /// Remove a container. A missing container is [`Teardown::AlreadyGone`].
    async fn remove(&self, container_id: &str) -> Result<Teardown>;

    /// The last `tail` lines of combined stdout/stderr
    async fn logs(&self, container_id: &str, tail: usize) -> Result<String>;

    /// A single resource-usage sample
    async fn stats(&self, container_id: &str) -> Result<StatsSnapshot>;

    /// Check if a named network exists
    async fn network_exists(&self, name: &str) -> Result<bool>;
}
