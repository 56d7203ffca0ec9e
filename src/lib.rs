//! Registry and synchronization engine for fleets of git worktrees.
//!
//! Each unit of work gets its own working tree on its own branch, tracked in
//! a JSON registry shared by every process operating on the repository.
//! [`WorktreeManager`] is the entry point: it provisions worktrees, keeps
//! their lifecycle status current, reconciles branches with their base, and
//! cleans up what is merged or abandoned. Registry mutations are serialized
//! across processes by a file lock with staleness recovery.
//!
//! The command-line surface, the configuration store, and git itself are
//! external collaborators; this crate shells out to `git` and hands back
//! typed results and classified errors.

pub mod config;
pub mod errors;
pub mod git;
pub mod manager;
pub mod path;
pub mod registry;
pub mod spec_id;

pub use config::{SyncStrategy, WorktreeConfig};
pub use errors::{FleetError, ValidationIssue, report};
pub use git::Repository;
pub use manager::{
    CleanCriteria, CleanReport, CreateOptions, SyncOutcome, SyncStatus, WorktreeManager,
};
pub use registry::{Registry, RegistryStore, WorktreeRecord, WorktreeStatus};
