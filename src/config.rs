//! Typed settings consumed by the worktree manager.
//!
//! The configuration store itself (where these scalars live on disk and how
//! the user edits them) is an external collaborator. This module only defines
//! the typed view handed to [`WorktreeManager`](crate::manager::WorktreeManager),
//! with the same keys and defaults as the store.

use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::errors::FleetError;

/// How a worktree branch is reconciled with its base branch.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display, strum::EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum SyncStrategy {
    Merge,
    Rebase,
}

impl SyncStrategy {
    /// Parse a user-supplied strategy name.
    ///
    /// Anything other than `merge` or `rebase` is a [`FleetError::Validation`].
    pub fn parse(value: &str) -> anyhow::Result<Self> {
        SyncStrategy::from_str(value).map_err(|_| {
            FleetError::validation(
                format!("Unsupported sync strategy '{value}' (expected 'merge' or 'rebase')"),
                Some("strategy"),
            )
            .into()
        })
    }
}

/// Worktree fleet settings.
///
/// Every field has a serde default so a partial document deserializes into
/// the same values the store would create on first run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorktreeConfig {
    /// Root template for worktree paths. May start with `~` and may contain
    /// `{HOME}`, `{USER}`, and `{PROJECT_NAME}` placeholders.
    pub worktree_root: String,
    /// Branch new worktrees are based on and synchronized against.
    pub default_base: String,
    /// Whether the command surface synchronizes right after creation.
    pub auto_sync: bool,
    /// Whether cleanup removes worktrees once their branch is merged.
    pub cleanup_merged: bool,
    /// Default strategy when the caller does not specify one.
    pub sync_strategy: SyncStrategy,
    /// Soft cap on the number of registered worktrees, enforced by `create`.
    pub max_worktrees: usize,
    /// Days without a successful sync before a worktree is considered stale.
    pub stale_threshold_days: u64,
}

impl Default for WorktreeConfig {
    fn default() -> Self {
        Self {
            worktree_root: "~/worktrees/{PROJECT_NAME}/".into(),
            default_base: "master".into(),
            auto_sync: false,
            cleanup_merged: true,
            sync_strategy: SyncStrategy::Merge,
            max_worktrees: 10,
            stale_threshold_days: 30,
        }
    }
}
