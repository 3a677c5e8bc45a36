//! Lab instance management
//!
//! The [`LabManager`] hands each user at most one live container per lab,
//! recording every instance in an [`InstanceStore`](crate::store::InstanceStore)
//! and reclaiming instances once their lifetime runs out.

pub mod config;
pub mod locks;
pub mod manager;

pub use config::{parse_memory, LabConfig, LOGS_NOT_AVAILABLE};
pub use manager::{container_name, LabManager, SweepReport};
