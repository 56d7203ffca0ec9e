//! File-based mutual exclusion for the registry.
//!
//! Callers run in independent OS processes, so exclusion uses only
//! filesystem primitives: a JSON sidecar at `<registry>.lock` created with
//! exclusive-create semantics. Existence and age are the entire protocol.
//! A lock older than the stale timeout — or one that cannot be parsed — is
//! treated as abandoned by a crashed holder and deleted, failing open toward
//! availability rather than leaving the registry permanently wedged.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::errors::FleetError;

/// Fixed suffix appended to the registry path to derive the lock path.
pub const LOCK_SUFFIX: &str = ".lock";

/// Contents of the lock sidecar. The holder identity is advisory; only the
/// file's existence and `acquired_at` age participate in the protocol.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockState {
    pub pid: u32,
    /// Acquisition time in epoch milliseconds.
    pub acquired_at: i64,
}

/// Tunables for lock acquisition.
#[derive(Debug, Clone)]
pub struct LockOptions {
    /// Give up acquiring after this long.
    pub timeout: Duration,
    /// Locks older than this are treated as abandoned.
    pub stale_timeout: Duration,
    /// Sleep between acquisition attempts.
    pub poll_interval: Duration,
}

impl Default for LockOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            stale_timeout: Duration::from_secs(60),
            poll_interval: Duration::from_millis(100),
        }
    }
}

/// Lock sidecar path for a registry file: the registry path plus [`LOCK_SUFFIX`].
pub fn lock_path(registry_path: &Path) -> PathBuf {
    let mut path = registry_path.as_os_str().to_os_string();
    path.push(LOCK_SUFFIX);
    PathBuf::from(path)
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Whether the lock file at `lock_path` is stale. A corrupted or unreadable
/// lock file counts as stale.
fn is_stale(lock_path: &Path, stale_timeout: Duration) -> bool {
    let state = fs::read(lock_path)
        .ok()
        .and_then(|bytes| serde_json::from_slice::<LockState>(&bytes).ok());
    match state {
        Some(state) => {
            let age = now_ms().saturating_sub(state.acquired_at);
            age > stale_timeout.as_millis() as i64
        }
        None => true,
    }
}

/// Attempt to acquire the lock for `registry_path`.
///
/// Atomically creates the sidecar with exclusive-create semantics. When a
/// lock already exists, a stale one is deleted and creation retried
/// immediately; a fresh one is polled until `options.timeout` elapses.
/// Returns `false` on timeout.
pub fn acquire(registry_path: &Path, options: &LockOptions) -> bool {
    let lock_path = lock_path(registry_path);
    if let Some(parent) = lock_path.parent() {
        let _ = fs::create_dir_all(parent);
    }

    let start = Instant::now();
    loop {
        if lock_path.exists() && is_stale(&lock_path, options.stale_timeout) {
            log::debug!("removing stale lock at {}", lock_path.display());
            let _ = fs::remove_file(&lock_path);
        }

        match OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&lock_path)
        {
            Ok(mut file) => {
                let state = LockState {
                    pid: std::process::id(),
                    acquired_at: now_ms(),
                };
                if serde_json::to_writer(&mut file, &state).is_ok() {
                    let _ = file.flush();
                }
                return true;
            }
            Err(_) => {
                if start.elapsed() >= options.timeout {
                    return false;
                }
                std::thread::sleep(options.poll_interval);
            }
        }
    }
}

/// Release the lock for `registry_path`.
///
/// Returns `false` (not an error) when no lock existed.
pub fn release(registry_path: &Path) -> bool {
    let lock_path = lock_path(registry_path);
    if !lock_path.exists() {
        return false;
    }
    fs::remove_file(&lock_path).is_ok()
}

/// Read-only check: is the registry currently locked?
///
/// A missing sidecar means unlocked; an existing one counts as locked only
/// while its age is within `stale_timeout`.
pub fn is_locked(registry_path: &Path, stale_timeout: Duration) -> bool {
    let lock_path = lock_path(registry_path);
    lock_path.exists() && !is_stale(&lock_path, stale_timeout)
}

/// RAII lock over a registry file.
///
/// Releasing on `Drop` guarantees the lock is freed on every exit path,
/// including `?` propagation and panics, so a failed operation never leaves
/// the registry permanently locked.
#[derive(Debug)]
pub struct LockGuard {
    registry_path: PathBuf,
}

impl LockGuard {
    /// Acquire the lock or fail with a [`FleetError::Registry`] on timeout.
    ///
    /// A timeout is a normal "try again" signal for the caller, not a crash.
    pub fn acquire(registry_path: &Path, options: &LockOptions) -> anyhow::Result<Self> {
        if acquire(registry_path, options) {
            Ok(Self {
                registry_path: registry_path.to_path_buf(),
            })
        } else {
            Err(FleetError::registry(
                format!(
                    "Timed out waiting for registry lock after {:?}",
                    options.timeout
                ),
                registry_path,
                "acquire_lock",
            )
            .into())
        }
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        release(&self.registry_path);
    }
}
