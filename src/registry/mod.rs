//! Persisted worktree registry.
//!
//! The registry is a single JSON document keyed by worktree id and is the
//! single source of truth: every operation reads the current file rather
//! than a cached snapshot, and every mutation happens under the file lock
//! (see [`lock`]) with the document reloaded after acquisition so
//! concurrent processes never interleave read-modify-write cycles.
//!
//! Writes are backup-and-rollback: the previous document is copied aside,
//! the new one written, and the backup restored if the write fails, so a
//! failed save never silently loses records.

pub mod lock;

use std::fs::{self, OpenOptions};
use std::io::Write as _;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::errors::{ErrorSource, FleetError};
use lock::{LockGuard, LockOptions};

const REGISTRY_VERSION: &str = "1.0.0";
const BACKUP_SUFFIX: &str = ".backup";

/// Lifecycle state of a managed worktree.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display, strum::EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum WorktreeStatus {
    /// Under active development. Initial state on creation.
    Active,
    /// No successful sync within the stale threshold.
    Stale,
    /// Branch integrated into its base. Terminal until removal.
    Merged,
}

/// One registry entry per managed working tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorktreeRecord {
    /// Unit-of-work identifier; registry key and on-disk directory leaf.
    pub id: String,
    /// Branch checked out in this worktree.
    pub branch: String,
    /// Branch this worktree synchronizes against.
    pub base_branch: String,
    /// Absolute filesystem location; unique across all records.
    pub path: PathBuf,
    pub status: WorktreeStatus,
    pub created_at: DateTime<Utc>,
    /// Most recent successful synchronization, absent if never synced.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_sync: Option<DateTime<Utc>>,
}

/// The full persisted collection of worktree records.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Registry {
    pub version: String,
    pub created_at: DateTime<Utc>,
    pub last_updated: DateTime<Utc>,
    /// Records keyed by id, in insertion order.
    pub worktrees: IndexMap<String, WorktreeRecord>,
}

impl Registry {
    fn new() -> Self {
        let now = Utc::now();
        Self {
            version: REGISTRY_VERSION.into(),
            created_at: now,
            last_updated: now,
            worktrees: IndexMap::new(),
        }
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

fn backup_path(registry_path: &Path) -> PathBuf {
    let mut path = registry_path.as_os_str().to_os_string();
    path.push(BACKUP_SUFFIX);
    PathBuf::from(path)
}

/// Handle to a registry file.
///
/// Holds no document state: reads go to disk every time, and mutations run
/// through [`RegistryStore::with_lock`] which reloads under the lock.
#[derive(Debug)]
pub struct RegistryStore {
    path: PathBuf,
    lock_options: LockOptions,
}

impl RegistryStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock_options: LockOptions::default(),
        }
    }

    /// Override the lock tunables (mainly for tests and CI).
    pub fn with_lock_options(mut self, lock_options: LockOptions) -> Self {
        self.lock_options = lock_options;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn lock_options(&self) -> &LockOptions {
        &self.lock_options
    }

    /// Ensure the registry file and its parent directory exist.
    ///
    /// Creates an empty registry if absent. Never destructive: an existing
    /// file is left untouched, including one created concurrently between
    /// the existence check and the write.
    pub fn init(&self) -> anyhow::Result<()> {
        if self.path.exists() {
            return Ok(());
        }
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .map_err(|err| self.error("Failed to create registry directory", "init", err))?;
        }
        let bytes = serde_json::to_vec_pretty(&Registry::new())
            .map_err(|err| self.error("Failed to encode registry", "init", err))?;
        match OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&self.path)
        {
            Ok(mut file) => {
                file.write_all(&bytes)
                    .map_err(|err| self.error("Failed to write registry", "init", err))?;
                log::info!("initialized registry at {}", self.path.display());
                Ok(())
            }
            Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => Ok(()),
            Err(err) => Err(self.error("Failed to create registry", "init", err)),
        }
    }

    /// Read the current document. A missing file reads as an empty registry.
    pub fn load(&self) -> anyhow::Result<Registry> {
        if !self.path.exists() {
            return Ok(Registry::new());
        }
        let bytes = fs::read(&self.path)
            .map_err(|err| self.error("Failed to read registry", "load", err))?;
        serde_json::from_slice(&bytes)
            .map_err(|err| self.error("Invalid registry format", "load", err))
    }

    /// Write the document, assuming the lock is already held.
    ///
    /// Bumps `last_updated`, copies the previous file to a `.backup`
    /// sidecar, and rolls back to it if the write fails.
    fn save(&self, registry: &mut Registry) -> anyhow::Result<()> {
        registry.last_updated = Utc::now();
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .map_err(|err| self.error("Failed to create registry directory", "save", err))?;
        }

        let backup = backup_path(&self.path);
        let had_previous = self.path.exists();
        if had_previous {
            fs::copy(&self.path, &backup)
                .map_err(|err| self.error("Failed to back up registry", "save", err))?;
        }

        let bytes = serde_json::to_vec_pretty(registry)
            .map_err(|err| self.error("Failed to encode registry", "save", err))?;
        match fs::write(&self.path, bytes) {
            Ok(()) => {
                if had_previous {
                    let _ = fs::remove_file(&backup);
                }
                Ok(())
            }
            Err(err) => {
                if had_previous {
                    let _ = fs::copy(&backup, &self.path);
                    let _ = fs::remove_file(&backup);
                }
                Err(self.error("Failed to write registry", "save", err))
            }
        }
    }

    /// Run a read-modify-write cycle under the registry lock.
    ///
    /// Acquires the lock (timeout surfaces as [`FleetError::Registry`]),
    /// reloads the document so the mutation sees the latest state, applies
    /// `mutate`, and saves. The lock is released on every exit path via the
    /// guard's `Drop`, including when `mutate` or the save fails.
    pub fn with_lock<T>(
        &self,
        mutate: impl FnOnce(&mut Registry) -> anyhow::Result<T>,
    ) -> anyhow::Result<T> {
        let _guard = LockGuard::acquire(&self.path, &self.lock_options)?;
        let mut registry = self.load()?;
        let value = mutate(&mut registry)?;
        self.save(&mut registry)?;
        Ok(value)
    }

    /// Insert a new record, enforcing id and path uniqueness.
    pub fn add(&self, record: WorktreeRecord) -> anyhow::Result<()> {
        self.with_lock(|registry| {
            if registry.worktrees.contains_key(&record.id) {
                return Err(FleetError::validation(
                    format!("Worktree {} already exists", record.id),
                    Some("id"),
                )
                .into());
            }
            if let Some(occupant) = registry
                .worktrees
                .values()
                .find(|existing| existing.path == record.path)
            {
                return Err(FleetError::validation(
                    format!(
                        "Path {} is already registered to {}",
                        record.path.display(),
                        occupant.id
                    ),
                    Some("path"),
                )
                .into());
            }
            log::info!("registering worktree {} at {}", record.id, record.path.display());
            registry.worktrees.insert(record.id.clone(), record);
            Ok(())
        })
    }

    /// Apply an in-place update to an existing record.
    pub fn update(
        &self,
        id: &str,
        apply: impl FnOnce(&mut WorktreeRecord),
    ) -> anyhow::Result<()> {
        self.with_lock(|registry| {
            let record = registry.worktrees.get_mut(id).ok_or_else(|| {
                anyhow::Error::from(FleetError::validation(
                    format!("Worktree {id} not found"),
                    Some("id"),
                ))
            })?;
            apply(record);
            Ok(())
        })
    }

    /// Delete a record, returning it.
    pub fn remove(&self, id: &str) -> anyhow::Result<WorktreeRecord> {
        self.with_lock(|registry| {
            registry.worktrees.shift_remove(id).ok_or_else(|| {
                anyhow::Error::from(FleetError::validation(
                    format!("Worktree {id} not found"),
                    Some("id"),
                ))
            })
        })
    }

    fn error(
        &self,
        message: &str,
        operation: &str,
        source: impl Into<ErrorSource>,
    ) -> anyhow::Error {
        FleetError::Registry {
            message: message.into(),
            registry_path: self.path.clone(),
            operation: operation.into(),
            source: Some(source.into()),
        }
        .into()
    }
}
