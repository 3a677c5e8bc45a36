//! Scripted in-process runtime for tests

use super::config::{
    ContainerHandle, ContainerSpec, NetworkAttributes, StatsSnapshot, Teardown,
};
use super::runtime::ContainerRuntime;
use crate::error::{LabError, Result};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

#[derive(Default)]
struct FakeState {
    next_id: u64,
    running: HashMap<String, ContainerSpec>,
    created: Vec<(String, ContainerSpec)>,
    stops: Vec<String>,
    removes: Vec<String>,
    networks: HashSet<String>,
    fail_create: bool,
    fail_inspect: bool,
    fail_teardown: HashSet<String>,
    ip: Option<String>,
    host_port: Option<u16>,
}

/// Runtime that keeps containers in memory and records every call
pub struct FakeRuntime {
    available: bool,
    state: Mutex<FakeState>,
}

impl FakeRuntime {
    pub fn new() -> Self {
        let state = FakeState {
            ip: Some("172.20.0.2".to_string()),
            host_port: Some(49153),
            ..Default::default()
        };
        Self {
            available: true,
            state: Mutex::new(state),
        }
    }

    pub fn unavailable() -> Self {
        Self {
            available: false,
            state: Mutex::new(FakeState::default()),
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, FakeState> {
        self.state.lock().unwrap()
    }

    pub fn with_network(self, name: &str) -> Self {
        self.state().networks.insert(name.to_string());
        self
    }

    pub fn set_fail_create(&self, fail: bool) {
        self.state().fail_create = fail;
    }

    pub fn set_fail_inspect(&self, fail: bool) {
        self.state().fail_inspect = fail;
    }

    pub fn set_address(&self, ip: Option<&str>, host_port: Option<u16>) {
        let mut state = self.state();
        state.ip = ip.map(str::to_string);
        state.host_port = host_port;
    }

    /// Make teardown of one container fail with an engine error
    pub fn fail_teardown(&self, container_id: &str) {
        self.state().fail_teardown.insert(container_id.to_string());
    }

    /// Remove a container behind the manager's back
    pub fn vanish(&self, container_id: &str) {
        self.state().running.remove(container_id);
    }

    pub fn created(&self) -> Vec<(String, ContainerSpec)> {
        self.state().created.clone()
    }

    pub fn created_count(&self) -> usize {
        self.state().created.len()
    }

    pub fn stops(&self) -> Vec<String> {
        self.state().stops.clone()
    }

    pub fn removes(&self) -> Vec<String> {
        self.state().removes.clone()
    }

    pub fn is_running(&self, container_id: &str) -> bool {
        self.state().running.contains_key(container_id)
    }

    fn check(&self) -> Result<()> {
        if self.available {
            Ok(())
        } else {
            Err(LabError::RuntimeUnavailable)
        }
    }

    fn teardown(&self, container_id: &str, remove: bool) -> Result<Teardown> {
        self.check()?;
        let mut state = self.state();
        if remove {
            state.removes.push(container_id.to_string());
        } else {
            state.stops.push(container_id.to_string());
        }

        if state.fail_teardown.contains(container_id) {
            return Err(LabError::TeardownFailed {
                container: container_id.to_string(),
                message: "engine error".to_string(),
            });
        }

        if !state.running.contains_key(container_id) {
            return Ok(Teardown::AlreadyGone);
        }
        if remove {
            state.running.remove(container_id);
        }
        Ok(Teardown::Done)
    }
}

#[async_trait]
impl ContainerRuntime for FakeRuntime {
    fn is_available(&self) -> bool {
        self.available
    }

    async fn create_container(&self, spec: &ContainerSpec) -> Result<ContainerHandle> {
        self.check()?;
        let mut state = self.state();
        if state.fail_create {
            return Err(LabError::InstanceCreationFailed(format!(
                "image {} not found",
                spec.image
            )));
        }

        state.next_id += 1;
        let id = format!("c{:011}", state.next_id);
        state.running.insert(id.clone(), spec.clone());
        state.created.push((id.clone(), spec.clone()));

        Ok(ContainerHandle {
            id,
            name: spec.name.clone(),
        })
    }

    async fn inspect(&self, container_id: &str) -> Result<NetworkAttributes> {
        self.check()?;
        let state = self.state();
        if state.fail_inspect {
            return Err(LabError::Runtime("inspect failed".to_string()));
        }
        let spec = state
            .running
            .get(container_id)
            .ok_or_else(|| LabError::Runtime(format!("No such container: {}", container_id)))?;

        let mut attrs = NetworkAttributes::default();
        let network = spec.network.clone().unwrap_or_else(|| "bridge".to_string());
        attrs.networks.insert(network, state.ip.clone());
        for port in &spec.ports {
            attrs
                .port_bindings
                .insert(port.key(), state.host_port.into_iter().collect());
        }
        Ok(attrs)
    }

    async fn stop(&self, container_id: &str) -> Result<Teardown> {
        self.teardown(container_id, false)
    }

    async fn remove(&self, container_id: &str) -> Result<Teardown> {
        self.teardown(container_id, true)
    }

    async fn logs(&self, container_id: &str, tail: usize) -> Result<String> {
        self.check()?;
        let state = self.state();
        let spec = state
            .running
            .get(container_id)
            .ok_or_else(|| LabError::Runtime(format!("No such container: {}", container_id)))?;
        let lines: Vec<String> = (1..=3)
            .map(|i| format!("{} line {}", spec.name, i))
            .collect();
        let start = lines.len().saturating_sub(tail);
        Ok(lines[start..].join("\n"))
    }

    async fn stats(&self, container_id: &str) -> Result<StatsSnapshot> {
        self.check()?;
        if !self.state().running.contains_key(container_id) {
            return Err(LabError::Runtime(format!("No such container: {}", container_id)));
        }
        Ok(StatsSnapshot::from_raw(serde_json::json!({
            "memory_stats": { "usage": 4096, "limit": 536870912 },
            "pids_stats": { "current": 1 }
        })))
    }

    async fn network_exists(&self, name: &str) -> Result<bool> {
        self.check()?;
        Ok(self.state().networks.contains(name))
    }
}
