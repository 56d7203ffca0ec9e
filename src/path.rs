//! Worktree path resolution.
//!
//! Pure template expansion plus the per-invocation context it feeds on.
//! The configured root template supports a leading `~` and the `{HOME}`,
//! `{USER}`, and `{PROJECT_NAME}` placeholders; the worktree id becomes the
//! final path segment.

use std::path::{Path, PathBuf};

use normalize_path::NormalizePath;

use crate::config::WorktreeConfig;
use crate::git::Repository;

/// Values available to template expansion. Resolved per invocation from the
/// environment and the repository; never persisted.
#[derive(Debug, Clone)]
pub struct PathContext {
    pub home_dir: PathBuf,
    pub user: String,
    pub project_name: String,
}

impl PathContext {
    /// Build a context with an explicit project name (no git invocation).
    pub fn with_project(project_name: impl Into<String>) -> Self {
        Self {
            home_dir: home_dir(),
            user: user_name(),
            project_name: project_name.into(),
        }
    }

    /// Build a context for `cwd`, deriving the project name from the `origin`
    /// remote URL when resolvable, else from the directory basename.
    pub fn detect(cwd: &Path) -> Self {
        Self::with_project(project_name(cwd))
    }
}

/// Expand a root template with context values.
///
/// - a single leading `~` becomes the home directory (only at the start)
/// - `{HOME}`, `{USER}`, `{PROJECT_NAME}` are substituted everywhere
/// - unrecognized placeholders pass through unchanged
/// - an empty template yields an empty result
pub fn expand(template: &str, context: &PathContext) -> String {
    if template.is_empty() {
        return String::new();
    }

    let home = context.home_dir.to_string_lossy();
    let expanded = match template.strip_prefix('~') {
        Some(rest) => format!("{home}{rest}"),
        None => template.to_string(),
    };

    expanded
        .replace("{HOME}", &home)
        .replace("{USER}", &context.user)
        .replace("{PROJECT_NAME}", &context.project_name)
}

/// Resolve the absolute path for a worktree from the configured root template.
///
/// Derives the project name via the `origin` remote (falling back to the
/// directory basename), expands the template, normalizes it to an absolute
/// path against `cwd`, and appends `id`.
pub fn resolve_worktree_path(id: &str, config: &WorktreeConfig, cwd: &Path) -> PathBuf {
    resolve_with_context(id, config, cwd, &PathContext::detect(cwd))
}

/// Variant of [`resolve_worktree_path`] that skips the remote-URL lookup and
/// takes an explicit project name. Useful before a repository exists, or
/// anywhere invoking git is undesirable.
pub fn resolve_worktree_path_with_project(
    id: &str,
    config: &WorktreeConfig,
    cwd: &Path,
    project_name: &str,
) -> PathBuf {
    resolve_with_context(id, config, cwd, &PathContext::with_project(project_name))
}

fn resolve_with_context(
    id: &str,
    config: &WorktreeConfig,
    cwd: &Path,
    context: &PathContext,
) -> PathBuf {
    let root = PathBuf::from(expand(&config.worktree_root, context));
    let absolute = if root.is_absolute() {
        root.normalize()
    } else {
        cwd.join(root).normalize()
    };
    absolute.join(id)
}

/// Derive a project name for `cwd`.
///
/// Best-effort: the `origin` remote URL when the lookup succeeds and parses,
/// otherwise the directory basename. A failed lookup is a deliberate default,
/// never an error.
pub fn project_name(cwd: &Path) -> String {
    Repository::at(cwd)
        .remote_url("origin")
        .and_then(|url| project_name_from_remote(&url))
        .unwrap_or_else(|| dir_basename(cwd))
}

/// Extract the project name from a remote URL: strip a trailing `.git` and
/// take the final path segment.
///
/// Handles `https://host/user/project.git`, `git@host:user/project.git`, and
/// plain `https://host/user/project` forms.
pub fn project_name_from_remote(url: &str) -> Option<String> {
    let trimmed = url.trim().trim_end_matches('/');
    let without_suffix = trimmed.strip_suffix(".git").unwrap_or(trimmed);
    // ':' is for scp-style remotes without a path slash (`git@host:project`);
    // URL forms with ports (`ssh://git@host:2222/team/project`) still resolve
    // through the later '/'.
    let name = without_suffix
        .rsplit(['/', ':'])
        .next()
        .filter(|name| !name.is_empty())?;
    Some(name.to_string())
}

fn dir_basename(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// The user's home directory. Empty path when detection fails, which leaves
/// `~` and `{HOME}` expanding to nothing rather than erroring.
fn home_dir() -> PathBuf {
    home::home_dir().unwrap_or_default()
}

/// The current user name from the environment, `"unknown"` when unset.
fn user_name() -> String {
    std::env::var("USER")
        .or_else(|_| std::env::var("USERNAME"))
        .unwrap_or_else(|_| "unknown".to_string())
}
