//! Per lab/user acquisition locks

use crate::error::{LabError, Result};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

type PairKey = (i64, i64);

/// Serializes acquisitions for the same `(lab_id, user_id)` pair while
/// leaving different pairs independent
#[derive(Default)]
pub struct PairLocks {
    locks: Mutex<HashMap<PairKey, Arc<tokio::sync::Mutex<()>>>>,
}

impl PairLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// The lock for a pair. Entries no caller holds any more are pruned.
    pub fn get(&self, lab_id: i64, user_id: i64) -> Result<Arc<tokio::sync::Mutex<()>>> {
        let mut locks = self
            .locks
            .lock()
            .map_err(|_| LabError::Lock("Failed to acquire pair lock table".to_string()))?;

        locks.retain(|_, lock| Arc::strong_count(lock) > 1);

        let lock = locks
            .entry((lab_id, user_id))
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())));
        Ok(Arc::clone(lock))
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.locks.lock().map(|l| l.len()).unwrap_or(0)
    }
}
