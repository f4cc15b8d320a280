//! Persistent container metadata and the store that loads and saves it.

use chrono::{DateTime, Utc};
use fd_lock::RwLock;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("container {reference:?} not found")]
    NotFound { reference: String },

    #[error("container {id:?} is in use by another process")]
    Locked { id: String },

    #[error("failed to access {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse container record {}: {source}", path.display())]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// A recorded operation applied to a container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryEntry {
    /// `<shell> <command...>`, e.g. `/bin/sh -c echo hi`.
    pub created_by: String,
    pub shell: String,
    pub created: DateTime<Utc>,
}

impl HistoryEntry {
    pub fn new(shell: &[String], command: &[String]) -> Self {
        let shell = shell.join(" ");
        Self {
            created_by: format!("{} {}", shell, command.join(" ")),
            shell,
            created: Utc::now(),
        }
    }
}

/// Defaults the container was configured with; a run may override them.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerConfig {
    #[serde(default)]
    pub shell: Vec<String>,
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub working_dir: Option<String>,
    #[serde(default)]
    pub env: Vec<String>,
    #[serde(default)]
    pub hostname: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerRecord {
    pub id: String,
    pub name: String,
    pub rootfs: PathBuf,
    #[serde(default)]
    pub config: ContainerConfig,
    #[serde(default)]
    pub history: Vec<HistoryEntry>,
}

/// An opened container. Changes stay in memory until [`Container::save`].
pub trait Container {
    fn record(&self) -> &ContainerRecord;

    fn add_history(&mut self, entry: HistoryEntry);

    fn save(&mut self) -> Result<(), StoreError>;

    fn id(&self) -> &str {
        &self.record().id
    }

    fn shell(&self) -> &[String] {
        &self.record().config.shell
    }
}

/// Opens containers by id or name. Implementations own any locking needed
/// to keep one writer per container.
pub trait ContainerStore {
    type Container: Container;

    fn open(&self, reference: &str) -> Result<Self::Container, StoreError>;
}

/// One JSON file per container under `<root>/containers`.
#[derive(Debug, Clone)]
pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn containers_dir(&self) -> PathBuf {
        self.root.join("containers")
    }

    fn record_path(&self, id: &str) -> PathBuf {
        self.containers_dir().join(format!("{id}.json"))
    }

    fn lock_path(&self, id: &str) -> PathBuf {
        self.containers_dir().join(format!("{id}.lock"))
    }

    /// Writes a new record and returns it opened.
    pub fn insert(&self, record: ContainerRecord) -> Result<FileContainer, StoreError> {
        let lock = self.lock(&record.id)?;
        let mut container = FileContainer {
            path: self.record_path(&record.id),
            record,
            _lock: lock,
        };
        container.save()?;
        Ok(container)
    }

    /// Takes the exclusive writer lock for `id`. It is released when the
    /// returned handle is dropped and its file closed.
    fn lock(&self, id: &str) -> Result<RwLock<File>, StoreError> {
        let dir = self.containers_dir();
        fs::create_dir_all(&dir).map_err(|source| StoreError::Io {
            path: dir.clone(),
            source,
        })?;

        let path = self.lock_path(id);
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(&path)
            .map_err(|source| StoreError::Io {
                path: path.clone(),
                source,
            })?;

        let mut lock = RwLock::new(file);
        match lock.try_write() {
            // Unlocking happens when the file closes, not when the guard drops.
            Ok(guard) => std::mem::forget(guard),
            Err(err) if err.kind() == ErrorKind::WouldBlock => {
                return Err(StoreError::Locked { id: id.to_string() })
            }
            Err(source) => return Err(StoreError::Io { path, source }),
        }
        Ok(lock)
    }

    fn load(path: &Path) -> Result<ContainerRecord, StoreError> {
        let data = fs::read_to_string(path).map_err(|source| StoreError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&data).map_err(|source| StoreError::Corrupt {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Id of the record named `name`. Records that cannot be read are
    /// skipped.
    fn find_by_name(&self, name: &str) -> Result<Option<String>, StoreError> {
        let dir = self.containers_dir();
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
            Err(source) => return Err(StoreError::Io { path: dir, source }),
        };

        let mut paths: Vec<PathBuf> = entries
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| path.extension().is_some_and(|ext| ext == "json"))
            .collect();
        paths.sort();

        for path in paths {
            match Self::load(&path) {
                Ok(record) if record.name == name => return Ok(Some(record.id)),
                Ok(_) => {}
                Err(err) => warn!(error = %err, "skipping unreadable container record"),
            }
        }
        Ok(None)
    }

    fn resolve_id(&self, reference: &str) -> Result<String, StoreError> {
        let looks_like_id = !reference.is_empty()
            && !reference.contains(['/', '\\'])
            && reference != "."
            && reference != "..";

        if looks_like_id && self.record_path(reference).is_file() {
            return Ok(reference.to_string());
        }

        match self.find_by_name(reference)? {
            Some(id) => {
                debug!(container = %id, name = reference, "resolved container name");
                Ok(id)
            }
            None => Err(StoreError::NotFound {
                reference: reference.to_string(),
            }),
        }
    }
}

impl ContainerStore for FileStore {
    type Container = FileContainer;

    /// Resolves `reference`, locks the container, then reads its record so
    /// the record cannot change underneath the returned handle.
    fn open(&self, reference: &str) -> Result<FileContainer, StoreError> {
        let id = self.resolve_id(reference)?;
        let lock = self.lock(&id)?;
        let path = self.record_path(&id);
        let record = Self::load(&path)?;
        debug!(container = %record.id, "opened container");
        Ok(FileContainer {
            record,
            path,
            _lock: lock,
        })
    }
}

/// An open container holding the store's writer lock for its id.
pub struct FileContainer {
    record: ContainerRecord,
    path: PathBuf,
    _lock: RwLock<File>,
}

impl fmt::Debug for FileContainer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileContainer")
            .field("record", &self.record)
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

impl FileContainer {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Container for FileContainer {
    fn record(&self) -> &ContainerRecord {
        &self.record
    }

    fn add_history(&mut self, entry: HistoryEntry) {
        self.record.history.push(entry);
    }

    /// Replaces the record file atomically: write a sibling temp file, then
    /// rename it over the old one.
    fn save(&mut self) -> Result<(), StoreError> {
        let io_err = |path: &Path| {
            let path = path.to_path_buf();
            move |source: std::io::Error| StoreError::Io { path, source }
        };

        let dir = self
            .path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        fs::create_dir_all(&dir).map_err(io_err(&dir))?;

        let json = serde_json::to_vec_pretty(&self.record).map_err(|source| {
            StoreError::Corrupt {
                path: self.path.clone(),
                source,
            }
        })?;

        let mut tmp = NamedTempFile::new_in(&dir).map_err(io_err(&dir))?;
        tmp.write_all(&json).map_err(io_err(tmp.path()))?;
        tmp.as_file().sync_all().map_err(io_err(tmp.path()))?;
        tmp.persist(&self.path)
            .map_err(|err| StoreError::Io {
                path: self.path.clone(),
                source: err.error,
            })?;

        debug!(container = %self.record.id, path = %self.path.display(), "saved container");
        Ok(())
    }
}
