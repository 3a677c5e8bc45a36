//! Compose-defined labs
//!
//! A lab may describe its environment as a compose definition. Instances are
//! still single containers: the primary service is provisioned and the rest
//! of the topology is reported as dropped.

pub mod config;
pub mod parser;

pub use config::{ComposeConfig, ServiceConfig};
pub use parser::{ComposeParser, PrimaryService};
