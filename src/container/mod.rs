//! Container runtime module
//!
//! This module defines the capability surface the lab manager consumes from
//! a container engine, the Docker Engine implementation of it, and the
//! container specification types passed across that boundary.

pub mod config;
pub mod docker;
pub mod runtime;

#[cfg(test)]
pub(crate) mod fake;

pub use config::{
    ContainerHandle, ContainerSpec, NetworkAttributes, PortSpec, Protocol, ResourceLimits,
    RuntimeConfig, StatsSnapshot, Teardown,
};
pub use docker::DockerRuntime;
pub use runtime::ContainerRuntime;
