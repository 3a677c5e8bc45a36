//! In-memory instance store

use super::model::{Lab, LabInstance, NewLab, NewLabInstance, User};
use super::InstanceStore;
use crate::error::{LabError, Result};
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

#[derive(Default)]
struct Tables {
    labs: BTreeMap<i64, Lab>,
    users: BTreeMap<i64, User>,
    instances: BTreeMap<i64, LabInstance>,
}

impl Tables {
    fn next_id<T>(rows: &BTreeMap<i64, T>) -> i64 {
        rows.keys().next_back().map_or(1, |last| last + 1)
    }
}

/// Instance store kept entirely in process memory
#[derive(Clone, Default)]
pub struct MemoryStore {
    tables: Arc<RwLock<Tables>>,
}

impl MemoryStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> Result<std::sync::RwLockReadGuard<'_, Tables>> {
        self.tables
            .read()
            .map_err(|_| LabError::Lock("Failed to acquire read lock".to_string()))
    }

    fn write(&self) -> Result<std::sync::RwLockWriteGuard<'_, Tables>> {
        self.tables
            .write()
            .map_err(|_| LabError::Lock("Failed to acquire write lock".to_string()))
    }
}

impl InstanceStore for MemoryStore {
    fn lab(&self, lab_id: i64) -> Result<Option<Lab>> {
        Ok(self.read()?.labs.get(&lab_id).cloned())
    }

    fn user(&self, user_id: i64) -> Result<Option<User>> {
        Ok(self.read()?.users.get(&user_id).cloned())
    }

    fn instance(&self, instance_id: i64) -> Result<Option<LabInstance>> {
        Ok(self.read()?.instances.get(&instance_id).cloned())
    }

    fn active_instance(&self, lab_id: i64, user_id: i64) -> Result<Option<LabInstance>> {
        let tables = self.read()?;
        let found = tables
            .instances
            .values()
            .rev()
            .find(|i| i.is_active && i.lab_id == lab_id && i.user_id == user_id)
            .cloned();
        Ok(found)
    }

    fn insert_instance(&self, instance: NewLabInstance) -> Result<LabInstance> {
        let mut tables = self.write()?;

        if !tables.labs.contains_key(&instance.lab_id) {
            return Err(LabError::LabNotFound(instance.lab_id));
        }
        if !tables.users.contains_key(&instance.user_id) {
            return Err(LabError::UserNotFound(instance.user_id));
        }

        let id = Tables::next_id(&tables.instances);
        let row = instance.into_instance(id);
        tables.instances.insert(id, row.clone());
        Ok(row)
    }

    fn deactivate(&self, instance_id: i64) -> Result<()> {
        let mut tables = self.write()?;
        let row = tables
            .instances
            .get_mut(&instance_id)
            .ok_or(LabError::InstanceNotFound(instance_id))?;
        row.is_active = false;
        Ok(())
    }

    fn expired_instances(&self, now: DateTime<Utc>) -> Result<Vec<LabInstance>> {
        let tables = self.read()?;
        let rows = tables
            .instances
            .values()
            .filter(|i| i.is_active && i.expires_at.is_some_and(|e| e < now))
            .cloned()
            .collect();
        Ok(rows)
    }

    fn active_count(&self) -> Result<usize> {
        let tables = self.read()?;
        Ok(tables.instances.values().filter(|i| i.is_active).count())
    }

    fn active_instances(&self) -> Result<Vec<LabInstance>> {
        let tables = self.read()?;
        Ok(tables
            .instances
            .values()
            .filter(|i| i.is_active)
            .cloned()
            .collect())
    }

    fn user_active_instances(&self, user_id: i64) -> Result<Vec<LabInstance>> {
        let tables = self.read()?;
        let rows = tables
            .instances
            .values()
            .filter(|i| i.is_active && i.user_id == user_id)
            .cloned()
            .collect();
        Ok(rows)
    }

    fn insert_lab(&self, lab: NewLab) -> Result<Lab> {
        let mut tables = self.write()?;
        let id = Tables::next_id(&tables.labs);
        let row = Lab {
            id,
            name: lab.name,
            docker_image: lab.docker_image,
            docker_compose: lab.docker_compose,
            target_port: lab.target_port,
            flag: lab.flag,
            time_limit: lab.time_limit,
            created_at: Utc::now(),
        };
        tables.labs.insert(id, row.clone());
        Ok(row)
    }

    fn labs(&self) -> Result<Vec<Lab>> {
        Ok(self.read()?.labs.values().cloned().collect())
    }

    fn insert_user(&self, username: &str) -> Result<User> {
        let mut tables = self.write()?;
        if tables.users.values().any(|u| u.username == username) {
            return Err(LabError::Store(format!("User {} already exists", username)));
        }
        let id = Tables::next_id(&tables.users);
        let row = User {
            id,
            username: username.to_string(),
            created_at: Utc::now(),
        };
        tables.users.insert(id, row.clone());
        Ok(row)
    }
}
