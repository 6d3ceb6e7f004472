//! Resource storage
//!
//! A binary blob store for artifacts, keyed by resource kind and entry id.
//! Operations see it read-only; uploads happen before a workflow starts.
//! The directory-backed implementation's root path is its serializable
//! connection string, mirroring the model storage.

use std::fs;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::errors::StorageError;

/// The resource kinds served by a resource storage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceKind {
    Blueprint,
    Deployment,
    Plugin,
    Snapshot,
}

impl ResourceKind {
    pub fn dir_name(self) -> &'static str {
        match self {
            ResourceKind::Blueprint => "blueprint",
            ResourceKind::Deployment => "deployment",
            ResourceKind::Plugin => "plugin",
            ResourceKind::Snapshot => "snapshot",
        }
    }
}

/// Serializable pointer to a resource storage backend
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceSpec {
    pub api: String,
    pub directory: String,
}

/// Storage contract for binary resources
pub trait ResourceStorage: Send + Sync {
    /// Copy a file or directory tree into the store under `entry_id`
    fn upload(&self, kind: ResourceKind, entry_id: &str, path: &Path) -> Result<(), StorageError>;

    /// Copy an entry out of the store to `dest`
    fn download(&self, kind: ResourceKind, entry_id: &str, dest: &Path)
        -> Result<(), StorageError>;

    /// Read a single file from an entry
    fn read(
        &self,
        kind: ResourceKind,
        entry_id: &str,
        relative_path: &str,
    ) -> Result<Vec<u8>, StorageError>;

    /// Remove an entry entirely
    fn delete(&self, kind: ResourceKind, entry_id: &str) -> Result<(), StorageError>;

    /// The serializable pointer to this storage, if it has one
    fn serial_spec(&self) -> Option<ResourceSpec>;
}

/// Directory-backed resource storage
pub struct FileResourceStorage {
    root: PathBuf,
}

impl FileResourceStorage {
    pub fn open(root: impl AsRef<Path>) -> Result<Self, StorageError> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root)?;
        Ok(FileResourceStorage { root })
    }

    /// Rebuild from a serialized spec (worker side of IPC)
    pub fn from_spec(spec: &ResourceSpec) -> Result<Arc<dyn ResourceStorage>, StorageError> {
        match spec.api.as_str() {
            "file" => Ok(Arc::new(Self::open(&spec.directory)?)),
            other => Err(StorageError::NameNotFound {
                kind: "resource api",
                name: other.to_string(),
            }),
        }
    }

    fn entry_dir(&self, kind: ResourceKind, entry_id: &str) -> PathBuf {
        self.root.join(kind.dir_name()).join(entry_id)
    }
}

impl ResourceStorage for FileResourceStorage {
    fn upload(&self, kind: ResourceKind, entry_id: &str, path: &Path) -> Result<(), StorageError> {
        let dir = self.entry_dir(kind, entry_id);
        fs::create_dir_all(&dir)?;
        if path.is_dir() {
            copy_tree(path, &dir)
        } else {
            let file_name = path.file_name().ok_or_else(|| {
                StorageError::ResourceNotFound {
                    entry: entry_id.to_string(),
                    path: path.display().to_string(),
                }
            })?;
            fs::copy(path, dir.join(file_name))?;
            Ok(())
        }
    }

    fn download(
        &self,
        kind: ResourceKind,
        entry_id: &str,
        dest: &Path,
    ) -> Result<(), StorageError> {
        let dir = self.entry_dir(kind, entry_id);
        if !dir.exists() {
            return Err(StorageError::ResourceNotFound {
                entry: entry_id.to_string(),
                path: String::new(),
            });
        }
        fs::create_dir_all(dest)?;
        copy_tree(&dir, dest)
    }

    fn read(
        &self,
        kind: ResourceKind,
        entry_id: &str,
        relative_path: &str,
    ) -> Result<Vec<u8>, StorageError> {
        let rel = Path::new(relative_path);
        // Entries are sandboxed under their own directory
        if rel
            .components()
            .any(|c| matches!(c, Component::ParentDir | Component::RootDir | Component::Prefix(_)))
        {
            return Err(StorageError::ResourceNotFound {
                entry: entry_id.to_string(),
                path: relative_path.to_string(),
            });
        }

        let path = self.entry_dir(kind, entry_id).join(rel);
        if !path.is_file() {
            return Err(StorageError::ResourceNotFound {
                entry: entry_id.to_string(),
                path: relative_path.to_string(),
            });
        }
        Ok(fs::read(path)?)
    }

    fn delete(&self, kind: ResourceKind, entry_id: &str) -> Result<(), StorageError> {
        let dir = self.entry_dir(kind, entry_id);
        if !dir.exists() {
            return Err(StorageError::ResourceNotFound {
                entry: entry_id.to_string(),
                path: String::new(),
            });
        }
        fs::remove_dir_all(dir)?;
        Ok(())
    }

    fn serial_spec(&self) -> Option<ResourceSpec> {
        Some(ResourceSpec {
            api: "file".to_string(),
            directory: self.root.to_string_lossy().into_owned(),
        })
    }
}

fn copy_tree(from: &Path, to: &Path) -> Result<(), StorageError> {
    for entry in fs::read_dir(from)? {
        let entry = entry?;
        let target = to.join(entry.file_name());
        if entry.path().is_dir() {
            fs::create_dir_all(&target)?;
            copy_tree(&entry.path(), &target)?;
        } else {
            fs::copy(entry.path(), target)?;
        }
    }
    Ok(())
}
