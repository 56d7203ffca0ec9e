//! Worktree lifecycle orchestration and synchronization.
//!
//! [`WorktreeManager`] owns the registry's on-disk view and exposes the
//! lifecycle contract consumed by the command surface: `initialize`, `list`,
//! `get_status`, `sync`, `create`, `remove`, plus `clean` for bulk cleanup.
//! Every mutation runs a lock-protected read-modify-write through
//! [`RegistryStore::with_lock`]; reads are lock-free and best-effort
//! consistent with concurrent writers.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::config::{SyncStrategy, WorktreeConfig};
use crate::errors::FleetError;
use crate::git::Repository;
use crate::path::resolve_worktree_path;
use crate::registry::lock::LockOptions;
use crate::registry::{RegistryStore, WorktreeRecord, WorktreeStatus};

/// Relationship between a worktree's branch and its base at the moment of
/// computation. Never persisted; recomputed on every status request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SyncStatus {
    /// Commits on the branch but not on its base.
    pub ahead: u64,
    /// Commits on the base but not on the branch.
    pub behind: u64,
    /// Uncommitted local changes in the working tree.
    pub uncommitted_changes: usize,
}

/// What a successful `sync` did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcome {
    /// Nothing to pull in; the sync was a no-op (still a success).
    UpToDate,
    /// The branch was reconciled with its base.
    Synced,
}

/// Options for [`WorktreeManager::create`].
#[derive(Debug, Clone, Default)]
pub struct CreateOptions {
    /// Branch name; defaults to `feature/<id>`.
    pub branch: Option<String>,
    /// Base branch; defaults to `config.default_base`.
    pub base: Option<String>,
}

/// Which worktrees [`WorktreeManager::clean`] targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CleanCriteria {
    /// Only worktrees whose branch is integrated into its base.
    MergedOnly,
    /// Worktrees without a successful sync in the given number of days.
    StaleDays(u64),
    /// Everything not currently active.
    AllInactive,
}

/// Per-id outcome of a cleanup pass.
#[derive(Debug, Default)]
pub struct CleanReport {
    /// Ids matching the criteria (the full set, also under dry-run).
    pub candidates: Vec<String>,
    pub removed: Vec<String>,
    /// Ids that could not be removed, with the formatted failure report.
    pub failed: Vec<(String, String)>,
}

/// Orchestrator for a fleet of git worktrees bound to one host repository.
#[derive(Debug)]
pub struct WorktreeManager {
    store: RegistryStore,
    config: WorktreeConfig,
    repo: Repository,
}

impl WorktreeManager {
    pub fn new(
        registry_path: impl Into<PathBuf>,
        config: WorktreeConfig,
        repo_path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            store: RegistryStore::new(registry_path),
            config,
            repo: Repository::at(repo_path),
        }
    }

    /// Override the registry lock tunables (mainly for tests and CI).
    pub fn with_lock_options(mut self, lock_options: LockOptions) -> Self {
        self.store = RegistryStore::new(self.store.path().to_path_buf())
            .with_lock_options(lock_options);
        self
    }

    /// Default registry location: inside the repository's common git
    /// directory, shared by all of its worktrees.
    pub fn default_registry_path(repo_path: &Path) -> PathBuf {
        let repo = Repository::at(repo_path);
        let git_dir = repo
            .git_common_dir()
            .unwrap_or_else(|_| repo_path.join(".git"));
        git_dir.join("treefleet").join("registry.json")
    }

    pub fn config(&self) -> &WorktreeConfig {
        &self.config
    }

    /// Ensure the registry file exists. Never destructive.
    pub fn initialize(&self) -> anyhow::Result<()> {
        self.store.init()
    }

    /// List records with freshly recomputed statuses, optionally filtered.
    ///
    /// Lock-free read: a concurrent writer may be observed before or after
    /// its mutation, an accepted trade-off for a local developer tool.
    /// Recomputed statuses are not written back here; durable transitions
    /// happen under the lock in `sync` and `remove`.
    pub fn list(
        &self,
        status_filter: Option<WorktreeStatus>,
    ) -> anyhow::Result<Vec<WorktreeRecord>> {
        let registry = self.store.load()?;
        let now = Utc::now();

        let mut records = Vec::with_capacity(registry.worktrees.len());
        for (_, mut record) in registry.worktrees {
            record.status = self.recompute_status(&record, now);
            if status_filter.is_none_or(|wanted| wanted == record.status) {
                records.push(record);
            }
        }
        Ok(records)
    }

    /// Compute ahead/behind/uncommitted counts for one worktree.
    pub fn get_status(&self, id: &str) -> anyhow::Result<SyncStatus> {
        let registry = self.store.load()?;
        let record = registry
            .worktrees
            .get(id)
            .ok_or_else(|| not_found(id))?;
        self.sync_status(record)
    }

    /// Reconcile a worktree with its base branch.
    ///
    /// With `behind == 0` this is a successful no-op: the version-control
    /// tool is not invoked and `last_sync` still advances. A conflict comes
    /// back as a [`FleetError::GitOperation`] with its conflict label set,
    /// and the registry is left untouched. The lock is released on every
    /// exit path.
    pub fn sync(&self, id: &str, strategy: Option<SyncStrategy>) -> anyhow::Result<SyncOutcome> {
        let strategy = strategy.unwrap_or(self.config.sync_strategy);
        self.store.with_lock(|registry| {
            let record = registry
                .worktrees
                .get_mut(id)
                .ok_or_else(|| not_found(id))?;

            let worktree = Repository::at(&record.path);
            let (_, behind) = worktree.commit_counts(&record.base_branch)?;

            let outcome = if behind == 0 {
                log::debug!("{id} is up to date with {}", record.base_branch);
                SyncOutcome::UpToDate
            } else {
                worktree.sync_with_base(&record.base_branch, strategy)?;
                log::info!(
                    "synced {id} with {} using {strategy}",
                    record.base_branch
                );
                SyncOutcome::Synced
            };

            record.last_sync = Some(Utc::now());
            if record.status != WorktreeStatus::Merged {
                record.status = WorktreeStatus::Active;
            }
            Ok(outcome)
        })
    }

    /// Provision a new worktree and register it.
    ///
    /// The registry precondition checks, the git provisioning, and the
    /// record insert all happen under one lock acquisition, so a failed
    /// provisioning never persists a partial record.
    pub fn create(&self, id: &str, options: CreateOptions) -> anyhow::Result<WorktreeRecord> {
        validate_worktree_id(id)?;

        let branch = options
            .branch
            .unwrap_or_else(|| format!("feature/{id}"));
        let base = options
            .base
            .unwrap_or_else(|| self.config.default_base.clone());
        let path = resolve_worktree_path(id, &self.config, self.repo.path());

        self.store.with_lock(|registry| {
            if registry.worktrees.contains_key(id) {
                return Err(FleetError::validation(
                    format!("Worktree for {id} already exists"),
                    Some("id"),
                )
                .into());
            }
            if registry.worktrees.len() >= self.config.max_worktrees {
                return Err(FleetError::validation(
                    format!(
                        "Worktree limit reached ({} of {})",
                        registry.worktrees.len(),
                        self.config.max_worktrees
                    ),
                    Some("max_worktrees"),
                )
                .into());
            }
            if let Some(occupant) = registry
                .worktrees
                .values()
                .find(|existing| existing.path == path)
            {
                return Err(FleetError::validation(
                    format!(
                        "Path {} is already registered to {}",
                        path.display(),
                        occupant.id
                    ),
                    Some("path"),
                )
                .into());
            }

            self.repo.add_worktree(&branch, &path, &base)?;
            log::info!("created worktree {id} at {}", path.display());

            let record = WorktreeRecord {
                id: id.to_string(),
                branch: branch.clone(),
                base_branch: base.clone(),
                path: path.clone(),
                status: WorktreeStatus::Active,
                created_at: Utc::now(),
                last_sync: None,
            };
            registry.worktrees.insert(id.to_string(), record.clone());
            Ok(record)
        })
    }

    /// Remove a worktree and delete its record.
    ///
    /// Without `force`, a dirty working tree is refused; with it, the
    /// caller is expected to have warned the operator.
    pub fn remove(&self, id: &str, force: bool) -> anyhow::Result<WorktreeRecord> {
        self.store.with_lock(|registry| {
            let record = registry
                .worktrees
                .get(id)
                .cloned()
                .ok_or_else(|| not_found(id))?;

            if !force {
                let dirty = Repository::at(&record.path).uncommitted_count();
                if dirty > 0 {
                    return Err(FleetError::GitOperation {
                        message: format!(
                            "Worktree {id} has {dirty} uncommitted change(s); use force to discard them"
                        ),
                        command: "git status --porcelain".into(),
                        exit_code: None,
                        stderr: String::new(),
                        conflict: false,
                        source: None,
                    }
                    .into());
                }
            }

            self.repo.remove_worktree(&record.path, force)?;
            registry.worktrees.shift_remove(id);
            log::info!("removed worktree {id}");
            Ok(record)
        })
    }

    /// Remove every worktree matching `criteria`.
    ///
    /// With `dry_run`, only reports the candidates. Removal is non-forced;
    /// a dirty candidate lands in `failed` rather than losing work.
    pub fn clean(&self, criteria: CleanCriteria, dry_run: bool) -> anyhow::Result<CleanReport> {
        let records = self.list(None)?;
        let now = Utc::now();

        let mut report = CleanReport {
            candidates: clean_candidates(&records, criteria, now),
            ..CleanReport::default()
        };
        if dry_run {
            return Ok(report);
        }

        for id in report.candidates.clone() {
            match self.remove(&id, false) {
                Ok(_) => report.removed.push(id),
                Err(err) => report.failed.push((id, crate::errors::report(&err))),
            }
        }
        Ok(report)
    }

    fn recompute_status(&self, record: &WorktreeRecord, now: DateTime<Utc>) -> WorktreeStatus {
        let merged = self
            .probe_merged(record)
            .unwrap_or(record.status == WorktreeStatus::Merged);
        evaluate_status(record, now, self.config.stale_threshold_days, merged)
    }

    /// Best-effort merge detection. `None` when git cannot answer (missing
    /// worktree, unborn base), in which case the stored status stands.
    ///
    /// Ancestry is necessary but not sufficient: a fresh worktree on the
    /// base's tip, and an untouched branch whose base has since advanced,
    /// are both ancestors yet integrated nothing. Merged additionally
    /// requires the branch tip to appear as a merged-in parent of a merge
    /// commit reachable from the base.
    fn probe_merged(&self, record: &WorktreeRecord) -> Option<bool> {
        let worktree = Repository::at(&record.path);
        let ancestor = worktree
            .is_merged_into("HEAD", &record.base_branch)
            .ok()?;
        if !ancestor {
            return Some(false);
        }
        let head = worktree.run(&["rev-parse", "HEAD"]).ok()?;
        worktree
            .is_merge_parent(head.trim(), &record.base_branch)
            .ok()
    }

    fn sync_status(&self, record: &WorktreeRecord) -> anyhow::Result<SyncStatus> {
        let worktree = Repository::at(&record.path);
        let (ahead, behind) = worktree.commit_counts(&record.base_branch)?;
        Ok(SyncStatus {
            ahead,
            behind,
            uncommitted_changes: worktree.uncommitted_count(),
        })
    }
}

fn not_found(id: &str) -> anyhow::Error {
    FleetError::validation(format!("Worktree {id} not found"), Some("id")).into()
}

/// Structural check on a worktree id. The id doubles as the on-disk
/// directory leaf, so path separators and whitespace are refused.
fn validate_worktree_id(id: &str) -> anyhow::Result<()> {
    if id.trim().is_empty() {
        return Err(FleetError::validation("Worktree id cannot be empty", Some("id")).into());
    }
    if id.contains(['/', '\\']) || id.chars().any(char::is_whitespace) {
        return Err(FleetError::validation(
            format!("Worktree id '{id}' must not contain path separators or whitespace"),
            Some("id"),
        )
        .into());
    }
    Ok(())
}

/// The status state machine, as a pure function of time and merge detection.
///
/// `merged` is terminal; otherwise a record goes stale once the time since
/// its last successful sync (or its creation, if never synced) exceeds the
/// threshold, and is active again as soon as a sync refreshes `last_sync`.
pub fn evaluate_status(
    record: &WorktreeRecord,
    now: DateTime<Utc>,
    stale_threshold_days: u64,
    merged: bool,
) -> WorktreeStatus {
    if merged || record.status == WorktreeStatus::Merged {
        return WorktreeStatus::Merged;
    }
    let anchor = record.last_sync.unwrap_or(record.created_at);
    if now.signed_duration_since(anchor).num_days() > stale_threshold_days as i64 {
        WorktreeStatus::Stale
    } else {
        WorktreeStatus::Active
    }
}

/// Which of `records` a cleanup pass with `criteria` would remove.
pub fn clean_candidates(
    records: &[WorktreeRecord],
    criteria: CleanCriteria,
    now: DateTime<Utc>,
) -> Vec<String> {
    records
        .iter()
        .filter(|record| match criteria {
            CleanCriteria::MergedOnly => record.status == WorktreeStatus::Merged,
            CleanCriteria::AllInactive => record.status != WorktreeStatus::Active,
            CleanCriteria::StaleDays(days) => match record.last_sync {
                None => true,
                Some(last_sync) => {
                    now.signed_duration_since(last_sync).num_days() >= days as i64
                }
            },
        })
        .map(|record| record.id.clone())
        .collect()
}

#[cfg(test)]
mod tests {
    use std::time::Duration as StdDuration;

    use chrono::Duration;

    use super::*;

    fn fast_lock_options() -> LockOptions {
        LockOptions {
            timeout: StdDuration::from_millis(200),
            stale_timeout: StdDuration::from_secs(60),
            poll_interval: StdDuration::from_millis(5),
        }
    }

    fn manager(dir: &tempfile::TempDir) -> WorktreeManager {
        WorktreeManager::new(
            dir.path().join("registry.json"),
            WorktreeConfig::default(),
            dir.path(),
        )
        .with_lock_options(fast_lock_options())
    }

    fn store(dir: &tempfile::TempDir) -> RegistryStore {
        RegistryStore::new(dir.path().join("registry.json"))
            .with_lock_options(fast_lock_options())
    }

    fn record(id: &str, dir: &tempfile::TempDir) -> WorktreeRecord {
        WorktreeRecord {
            id: id.into(),
            branch: format!("feature/{id}"),
            base_branch: "master".into(),
            path: dir.path().join("worktrees").join(id),
            status: WorktreeStatus::Active,
            created_at: Utc::now(),
            last_sync: None,
        }
    }

    fn assert_validation(err: anyhow::Error, field: &str) {
        match err.downcast_ref::<FleetError>() {
            Some(FleetError::Validation { field: Some(f), .. }) => assert_eq!(f, field),
            other => panic!("expected Validation on {field}, got {other:?}"),
        }
    }

    #[test]
    fn status_goes_stale_past_threshold() {
        let dir = tempfile::tempdir().unwrap();
        let now = Utc::now();
        let mut rec = record("SPEC-1", &dir);
        rec.last_sync = Some(now - Duration::days(40));

        assert_eq!(evaluate_status(&rec, now, 30, false), WorktreeStatus::Stale);
    }

    #[test]
    fn status_stays_active_within_threshold() {
        let dir = tempfile::tempdir().unwrap();
        let now = Utc::now();
        let mut rec = record("SPEC-1", &dir);
        rec.last_sync = Some(now - Duration::days(5));

        assert_eq!(evaluate_status(&rec, now, 30, false), WorktreeStatus::Active);
    }

    #[test]
    fn never_synced_records_age_from_creation() {
        let dir = tempfile::tempdir().unwrap();
        let now = Utc::now();
        let mut rec = record("SPEC-1", &dir);
        rec.created_at = now - Duration::days(31);

        assert_eq!(evaluate_status(&rec, now, 30, false), WorktreeStatus::Stale);
    }

    #[test]
    fn stale_record_recovers_after_fresh_sync() {
        let dir = tempfile::tempdir().unwrap();
        let now = Utc::now();
        let mut rec = record("SPEC-1", &dir);
        rec.status = WorktreeStatus::Stale;
        rec.last_sync = Some(now - Duration::hours(1));

        assert_eq!(evaluate_status(&rec, now, 30, false), WorktreeStatus::Active);
    }

    #[test]
    fn merged_is_terminal() {
        let dir = tempfile::tempdir().unwrap();
        let now = Utc::now();
        let mut rec = record("SPEC-1", &dir);

        assert_eq!(evaluate_status(&rec, now, 30, true), WorktreeStatus::Merged);

        // Once stored as merged, no probe result brings it back.
        rec.status = WorktreeStatus::Merged;
        rec.last_sync = Some(now);
        assert_eq!(evaluate_status(&rec, now, 30, false), WorktreeStatus::Merged);
    }

    #[test]
    fn list_recomputes_and_filters_by_status() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir);
        store.add(record("SPEC-OLD-001", &dir)).unwrap();
        store.add(record("SPEC-NEW-002", &dir)).unwrap();
        store
            .update("SPEC-OLD-001", |rec| {
                rec.last_sync = Some(Utc::now() - Duration::days(40));
            })
            .unwrap();

        let manager = manager(&dir);
        let all = manager.list(None).unwrap();
        assert_eq!(all.len(), 2);

        let stale = manager.list(Some(WorktreeStatus::Stale)).unwrap();
        assert_eq!(stale.len(), 1);
        assert_eq!(stale[0].id, "SPEC-OLD-001");
        assert_eq!(stale[0].status, WorktreeStatus::Stale);

        let active = manager.list(Some(WorktreeStatus::Active)).unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].id, "SPEC-NEW-002");

        // Filters partition the registry.
        let merged = manager.list(Some(WorktreeStatus::Merged)).unwrap();
        assert_eq!(stale.len() + active.len() + merged.len(), all.len());
    }

    #[test]
    fn get_status_rejects_unknown_id() {
        let dir = tempfile::tempdir().unwrap();
        let err = manager(&dir).get_status("SPEC-MISSING-001").unwrap_err();
        assert_validation(err, "id");
    }

    #[test]
    fn sync_rejects_unknown_id() {
        let dir = tempfile::tempdir().unwrap();
        let err = manager(&dir).sync("SPEC-MISSING-001", None).unwrap_err();
        assert_validation(err, "id");
    }

    #[test]
    fn remove_rejects_unknown_id() {
        let dir = tempfile::tempdir().unwrap();
        let err = manager(&dir).remove("SPEC-MISSING-001", false).unwrap_err();
        assert_validation(err, "id");
    }

    #[test]
    fn create_rejects_duplicate_and_leaves_registry_unchanged() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir);
        store.add(record("SPEC-2", &dir)).unwrap();

        let manager = manager(&dir);
        let err = manager.create("SPEC-2", CreateOptions::default()).unwrap_err();
        assert_validation(err, "id");

        let registry = store.load().unwrap();
        assert_eq!(registry.worktrees.len(), 1);
        assert!(registry.worktrees.contains_key("SPEC-2"));
    }

    #[test]
    fn create_rejects_structurally_bad_ids() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(&dir);
        for bad in ["", "   ", "a/b", "a\\b", "has space"] {
            let err = manager.create(bad, CreateOptions::default()).unwrap_err();
            assert_validation(err, "id");
        }
    }

    #[test]
    fn create_enforces_the_worktree_cap() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir);
        store.add(record("SPEC-A-001", &dir)).unwrap();

        let config = WorktreeConfig {
            max_worktrees: 1,
            ..WorktreeConfig::default()
        };
        let manager = WorktreeManager::new(
            dir.path().join("registry.json"),
            config,
            dir.path(),
        )
        .with_lock_options(fast_lock_options());

        let err = manager
            .create("SPEC-B-002", CreateOptions::default())
            .unwrap_err();
        assert_validation(err, "max_worktrees");
    }

    #[test]
    fn failed_provisioning_persists_no_partial_record() {
        // Not a git repository, so `git worktree add` fails after the
        // registry checks pass.
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(&dir);
        manager.initialize().unwrap();

        assert!(manager.create("SPEC-A-001", CreateOptions::default()).is_err());
        let registry = store(&dir).load().unwrap();
        assert!(registry.worktrees.is_empty());
        // And the failure released the lock.
        assert!(!crate::registry::lock::is_locked(
            store(&dir).path(),
            StdDuration::from_secs(60)
        ));
    }

    #[test]
    fn clean_candidates_by_criteria() {
        let dir = tempfile::tempdir().unwrap();
        let now = Utc::now();

        let mut merged = record("SPEC-M-001", &dir);
        merged.status = WorktreeStatus::Merged;
        merged.last_sync = Some(now - Duration::days(10));
        let mut stale = record("SPEC-S-002", &dir);
        stale.status = WorktreeStatus::Stale;
        stale.last_sync = Some(now - Duration::days(45));
        let mut active = record("SPEC-A-003", &dir);
        active.last_sync = Some(now - Duration::days(2));
        let records = vec![merged, stale, active];

        assert_eq!(
            clean_candidates(&records, CleanCriteria::MergedOnly, now),
            vec!["SPEC-M-001"]
        );
        assert_eq!(
            clean_candidates(&records, CleanCriteria::AllInactive, now),
            vec!["SPEC-M-001", "SPEC-S-002"]
        );
        assert_eq!(
            clean_candidates(&records, CleanCriteria::StaleDays(30), now),
            vec!["SPEC-S-002"]
        );
        // Anything at or past the requested age qualifies, regardless of status.
        assert_eq!(
            clean_candidates(&records, CleanCriteria::StaleDays(1), now),
            vec!["SPEC-M-001", "SPEC-S-002", "SPEC-A-003"]
        );
    }

    #[test]
    fn clean_dry_run_reports_without_removing() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir);
        let mut rec = record("SPEC-M-001", &dir);
        rec.status = WorktreeStatus::Merged;
        store.add(rec).unwrap();

        let manager = manager(&dir);
        let report = manager.clean(CleanCriteria::MergedOnly, true).unwrap();
        assert_eq!(report.candidates, vec!["SPEC-M-001"]);
        assert!(report.removed.is_empty());
        assert_eq!(store.load().unwrap().worktrees.len(), 1);
    }

    #[test]
    fn default_registry_path_falls_back_without_git() {
        let dir = tempfile::tempdir().unwrap();
        let path = WorktreeManager::default_registry_path(dir.path());
        assert!(path.ends_with(PathBuf::from("treefleet").join("registry.json")));
    }
}
