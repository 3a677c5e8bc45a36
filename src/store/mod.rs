//! Instance store
//!
//! Durable records of labs, users and lab instances. Labs and users are
//! read-only to the lab manager; instance rows are written only by it and are
//! never deleted, only deactivated.

pub mod memory;
pub mod model;
pub mod sqlite;

pub use memory::MemoryStore;
pub use model::{Lab, LabInstance, NewLab, NewLabInstance, User};
pub use sqlite::SqliteStore;

use crate::error::Result;
use chrono::{DateTime, Utc};

/// Record operations the lab manager relies on.
///
/// Every mutating call is its own transaction: it either commits entirely or
/// leaves the store untouched.
pub trait InstanceStore: Send + Sync {
    /// Get a lab by ID
    fn lab(&self, lab_id: i64) -> Result<Option<Lab>>;

    /// Get a user by ID
    fn user(&self, user_id: i64) -> Result<Option<User>>;

    /// Get an instance by ID
    fn instance(&self, instance_id: i64) -> Result<Option<LabInstance>>;

    /// The active instance for a lab/user pair, if any
    fn active_instance(&self, lab_id: i64, user_id: i64) -> Result<Option<LabInstance>>;

    /// Record a new active instance and return the stored row
    fn insert_instance(&self, instance: NewLabInstance) -> Result<LabInstance>;

    /// Mark an instance inactive
    fn deactivate(&self, instance_id: i64) -> Result<()>;

    /// Active instances whose expiry is strictly before `now`
    fn expired_instances(&self, now: DateTime<Utc>) -> Result<Vec<LabInstance>>;

    /// Number of active instances across all labs and users
    fn active_count(&self) -> Result<usize>;

    /// All active instances, oldest first
    fn active_instances(&self) -> Result<Vec<LabInstance>>;

    /// Active instances owned by a user
    fn user_active_instances(&self, user_id: i64) -> Result<Vec<LabInstance>>;

    /// Create a lab
    fn insert_lab(&self, lab: NewLab) -> Result<Lab>;

    /// List all labs
    fn labs(&self) -> Result<Vec<Lab>>;

    /// Create a user
    fn insert_user(&self, username: &str) -> Result<User>;
}
