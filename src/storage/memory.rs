//! In-memory entity store
//!
//! A HashMap behind a read-write lock, with a monotonic id counter. Fast,
//! volatile, and deliberately unserializable: handing one of these to a
//! worker process is a configuration error the executor refuses up front.

use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;
use rustc_hash::FxHashMap;

use crate::errors::StorageError;

use super::{Entity, EntityStore};

pub struct InMemoryStore<T: Entity> {
    entries: RwLock<FxHashMap<u64, T>>,
    next_id: AtomicU64,
}

impl<T: Entity> InMemoryStore<T> {
    pub fn new() -> Self {
        InMemoryStore {
            entries: RwLock::new(FxHashMap::default()),
            next_id: AtomicU64::new(1),
        }
    }
}

impl<T: Entity> Default for InMemoryStore<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Entity> EntityStore<T> for InMemoryStore<T> {
    fn get(&self, id: u64) -> Result<T, StorageError> {
        self.entries
            .read()
            .get(&id)
            .cloned()
            .ok_or(StorageError::NotFound { kind: T::KIND, id })
    }

    fn get_by_name(&self, name: &str) -> Result<T, StorageError> {
        let entries = self.entries.read();
        let mut matches: Vec<&T> = entries
            .values()
            .filter(|e| e.entity_name() == name)
            .collect();
        matches.sort_by_key(|e| e.entity_id());
        matches
            .first()
            .map(|e| (*e).clone())
            .ok_or_else(|| StorageError::NameNotFound {
                kind: T::KIND,
                name: name.to_string(),
            })
    }

    fn list(&self) -> Result<Vec<T>, StorageError> {
        let mut entries: Vec<T> = self.entries.read().values().cloned().collect();
        entries.sort_by_key(Entity::entity_id);
        Ok(entries)
    }

    fn put(&self, mut entity: T) -> Result<u64, StorageError> {
        let id = if entity.entity_id() == 0 {
            let id = self.next_id.fetch_add(1, Ordering::SeqCst);
            entity.set_entity_id(id);
            id
        } else {
            entity.entity_id()
        };

        let mut entries = self.entries.write();
        if entries.contains_key(&id) {
            return Err(StorageError::Conflict { kind: T::KIND, id });
        }
        entries.insert(id, entity);

        // Keep the counter ahead of externally-assigned ids
        self.next_id.fetch_max(id + 1, Ordering::SeqCst);
        Ok(id)
    }

    fn update(&self, entity: &T) -> Result<(), StorageError> {
        let id = entity.entity_id();
        let mut entries = self.entries.write();
        if !entries.contains_key(&id) {
            return Err(StorageError::NotFound { kind: T::KIND, id });
        }
        entries.insert(id, entity.clone());
        Ok(())
    }

    fn delete(&self, id: u64) -> Result<(), StorageError> {
        self.entries
            .write()
            .remove(&id)
            .map(|_| ())
            .ok_or(StorageError::NotFound { kind: T::KIND, id })
    }
}
