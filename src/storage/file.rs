//! Directory-backed entity store
//!
//! One JSON document per entity under `<root>/<kind>/<id>.json`. The root
//! path is the connection string: a worker process re-opens the same
//! storage from the path alone, which is what makes this backend usable
//! with the process-pool executor. Writes go through a per-store mutex so
//! read-modify-write sequences from one process are serialized; the on-disk
//! layout itself is the transaction boundary across processes.

use std::fs;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

use crate::errors::StorageError;

use super::{Entity, EntityStore};

pub struct FileModelStorage<T: Entity> {
    dir: PathBuf,
    write_lock: Mutex<()>,
    next_id: AtomicU64,
    _marker: PhantomData<fn() -> T>,
}

impl<T: Entity> FileModelStorage<T> {
    /// Open (creating if needed) the store for `T` under `root`
    pub fn open(root: impl AsRef<Path>) -> Result<Self, StorageError> {
        let dir = root.as_ref().join(T::KIND);
        fs::create_dir_all(&dir)?;

        // Resume the id sequence past anything already on disk
        let mut max_id = 0;
        for entry in fs::read_dir(&dir)? {
            if let Some(id) = id_of_path(&entry?.path()) {
                max_id = max_id.max(id);
            }
        }

        Ok(FileModelStorage {
            dir,
            write_lock: Mutex::new(()),
            next_id: AtomicU64::new(max_id + 1),
            _marker: PhantomData,
        })
    }

    fn path_of(&self, id: u64) -> PathBuf {
        self.dir.join(format!("{}.json", id))
    }

    fn read_entity(&self, path: &Path) -> Result<T, StorageError> {
        let bytes = fs::read(path)?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    fn write_entity(&self, entity: &T) -> Result<(), StorageError> {
        let path = self.path_of(entity.entity_id());
        let bytes = serde_json::to_vec_pretty(entity)?;
        // Write-then-rename keeps readers from observing torn documents
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, bytes)?;
        fs::rename(&tmp, &path)?;
        Ok(())
    }
}

fn id_of_path(path: &Path) -> Option<u64> {
    if path.extension()? != "json" {
        return None;
    }
    path.file_stem()?.to_str()?.parse().ok()
}

impl<T: Entity> EntityStore<T> for FileModelStorage<T> {
    fn get(&self, id: u64) -> Result<T, StorageError> {
        let path = self.path_of(id);
        if !path.exists() {
            return Err(StorageError::NotFound { kind: T::KIND, id });
        }
        self.read_entity(&path)
    }

    fn get_by_name(&self, name: &str) -> Result<T, StorageError> {
        self.list()?
            .into_iter()
            .find(|e| e.entity_name() == name)
            .ok_or_else(|| StorageError::NameNotFound {
                kind: T::KIND,
                name: name.to_string(),
            })
    }

    fn list(&self) -> Result<Vec<T>, StorageError> {
        let mut ids: Vec<u64> = fs::read_dir(&self.dir)?
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| id_of_path(&entry.path()))
            .collect();
        ids.sort_unstable();

        ids.into_iter().map(|id| self.get(id)).collect()
    }

    fn put(&self, mut entity: T) -> Result<u64, StorageError> {
        let _guard = self.write_lock.lock();

        let id = if entity.entity_id() == 0 {
            let id = self.next_id.fetch_add(1, Ordering::SeqCst);
            entity.set_entity_id(id);
            id
        } else {
            entity.entity_id()
        };

        if self.path_of(id).exists() {
            return Err(StorageError::Conflict { kind: T::KIND, id });
        }
        self.write_entity(&entity)?;
        self.next_id.fetch_max(id + 1, Ordering::SeqCst);
        Ok(id)
    }

    fn update(&self, entity: &T) -> Result<(), StorageError> {
        let _guard = self.write_lock.lock();

        let id = entity.entity_id();
        if !self.path_of(id).exists() {
            return Err(StorageError::NotFound { kind: T::KIND, id });
        }
        self.write_entity(entity)
    }

    fn delete(&self, id: u64) -> Result<(), StorageError> {
        let _guard = self.write_lock.lock();

        let path = self.path_of(id);
        if !path.exists() {
            return Err(StorageError::NotFound { kind: T::KIND, id });
        }
        fs::remove_file(path)?;
        Ok(())
    }
}
