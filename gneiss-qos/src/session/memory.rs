/*
 * Copyright Bret Ambrose. All Rights Reserved.
 * SPDX-License-Identifier: Apache-2.0.
 */

use crate::error::{GneissError, GneissResult};
use crate::session::{Repository, StorageRecord};

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

/// Repository backend that keeps every record in process memory.  Contents do not survive a
/// restart.
pub struct InMemoryRepository<T> {
    records: Mutex<HashMap<String, T>>,
}

impl<T: StorageRecord> InMemoryRepository<T> {

    /// Creates an empty repository
    pub fn new() -> Self {
        InMemoryRepository {
            records: Mutex::new(HashMap::new()),
        }
    }

    /// Returns the number of stored records
    pub fn len(&self) -> usize {
        self.lock_records().map_or(0, |records| records.len())
    }

    /// Returns true if no records are stored
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock_records(&self) -> GneissResult<MutexGuard<'_, HashMap<String, T>>> {
        self.records.lock().map_err(|_| { GneissError::new_storage_failure("in-memory repository lock poisoned") })
    }
}

impl<T: StorageRecord> Default for InMemoryRepository<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: StorageRecord> Repository<T> for InMemoryRepository<T> {

    fn read(&self, id: &str) -> GneissResult<Option<T>> {
        Ok(self.lock_records()?.get(id).cloned())
    }

    fn create(&self, record: T) -> GneissResult<()> {
        let mut records = self.lock_records()?;
        if records.contains_key(record.id()) {
            return Err(GneissError::new_storage_failure(format!("record \"{}\" already exists", record.id())));
        }

        records.insert(record.id().to_string(), record);
        Ok(())
    }

    fn update(&self, record: T) -> GneissResult<()> {
        let mut records = self.lock_records()?;
        match records.get_mut(record.id()) {
            Some(existing) => {
                *existing = record;
                Ok(())
            }
            None => {
                Err(GneissError::new_storage_failure(format!("record \"{}\" does not exist", record.id())))
            }
        }
    }

    fn delete(&self, id: &str) -> GneissResult<bool> {
        Ok(self.lock_records()?.remove(id).is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::ConnectionWill;
    use crate::mqtt::Will;
    use assert_matches::assert_matches;

    fn make_will(client_id: &str, topic: &str) -> ConnectionWill {
        ConnectionWill {
            client_id: client_id.to_string(),
            will: Will {
                topic: topic.to_string(),
                ..Default::default()
            }
        }
    }

    #[test]
    fn create_read_update_delete() {
        let repository = InMemoryRepository::<ConnectionWill>::new();
        assert!(repository.is_empty());

        assert_matches!(repository.create(make_will("a", "first")), Ok(()));
        assert_matches!(repository.create(make_will("a", "again")), Err(GneissError::StorageFailure(_)));
        assert_matches!(repository.read("a"), Ok(Some(will)) => {
            assert_eq!("first", will.will.topic);
        });

        assert_matches!(repository.update(make_will("a", "second")), Ok(()));
        assert_matches!(repository.update(make_will("b", "missing")), Err(GneissError::StorageFailure(_)));
        assert_matches!(repository.read("a"), Ok(Some(will)) => {
            assert_eq!("second", will.will.topic);
        });

        assert_matches!(repository.delete("a"), Ok(true));
        assert_matches!(repository.delete("a"), Ok(false));
        assert_matches!(repository.read("a"), Ok(None));
    }
}
