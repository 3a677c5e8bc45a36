//! labrune - per-user lab containers for training platforms
//!
//! labrune gives every user their own disposable container for each lab
//! (challenge) they open, and reclaims it when its time runs out. It provides:
//!
//! - Idempotent acquisition: at most one live instance per lab and user
//! - Stop, reset and periodic expiry sweeps
//! - Best-effort logs and resource statistics
//! - A Docker Engine runtime adapter
//! - SQLite and in-memory instance stores
//! - Single-service provisioning of compose-defined labs

pub mod compose;
pub mod config;
pub mod container;
pub mod error;
pub mod lab;
pub mod store;

pub use error::{LabError, Result};
pub use lab::{LabConfig, LabManager};
