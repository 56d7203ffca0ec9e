//! Typed errors for registry and worktree operations.
//!
//! All failure paths above the command surface are uniformly typed as
//! [`FleetError`], a pattern-matchable enum carried inside `anyhow::Error`.
//! Use `.into()` to convert while preserving the type, and `downcast_ref`
//! to branch on the failure kind:
//!
//! ```ignore
//! return Err(FleetError::validation("SPEC id cannot be empty", Some("id")).into());
//!
//! if let Some(FleetError::GitOperation { conflict: true, .. }) = err.downcast_ref() {
//!     // tell the operator to resolve manually and re-run
//! }
//! ```
//!
//! Display produces the multi-line report consumed by the command surface:
//! kind, message, kind-specific fields, then the wrapped cause if present.

use std::path::PathBuf;

/// Boxed underlying cause, kept for diagnostic chaining.
pub type ErrorSource = Box<dyn std::error::Error + Send + Sync + 'static>;

/// One entry in a [`FleetError::Validation`] issue list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationIssue {
    /// Field or path the message applies to (e.g., `"worktree.sync_strategy"`).
    pub path: String,
    pub message: String,
}

/// Classified failures for worktree fleet operations.
///
/// Three discriminants map to the caller-facing failure kinds:
/// validation (bad input, never retried), registry (lock/file access,
/// retryable after backoff), and git-operation (subprocess failure, with
/// conflicts labeled distinctly). [`FleetError::Other`] is the base kind
/// used by [`FleetError::wrap`] when a failure cannot be classified.
#[derive(Debug)]
pub enum FleetError {
    /// A git subprocess exited non-zero or produced an unexpected result.
    GitOperation {
        message: String,
        /// The invoked command line, e.g., `git rebase origin/main`.
        command: String,
        exit_code: Option<i32>,
        /// Captured stderr, trimmed.
        stderr: String,
        /// True when the failure was classified as a merge/rebase conflict.
        /// Conflicts require operator intervention and are never auto-retried.
        conflict: bool,
        source: Option<ErrorSource>,
    },
    /// The registry file or its lock could not be read, written, or acquired.
    Registry {
        message: String,
        registry_path: PathBuf,
        /// The attempted operation, e.g., `"acquire_lock"` or `"save"`.
        operation: String,
        source: Option<ErrorSource>,
    },
    /// Caller-supplied input failed a structural check.
    Validation {
        message: String,
        /// The offending field, when a single one is identifiable.
        field: Option<String>,
        /// Per-field messages for multi-field validation.
        issues: Vec<ValidationIssue>,
    },
    /// Unclassified failure wrapped into the taxonomy by [`FleetError::wrap`].
    Other {
        message: String,
        source: Option<ErrorSource>,
    },
}

impl FleetError {
    /// Machine-readable kind discriminant, also the report header.
    pub fn kind(&self) -> &'static str {
        match self {
            FleetError::GitOperation { .. } => "GitOperationError",
            FleetError::Registry { .. } => "RegistryError",
            FleetError::Validation { .. } => "ValidationError",
            FleetError::Other { .. } => "FleetError",
        }
    }

    /// Construct a validation error for a single field.
    pub fn validation(message: impl Into<String>, field: Option<&str>) -> Self {
        FleetError::Validation {
            message: message.into(),
            field: field.map(str::to_string),
            issues: Vec::new(),
        }
    }

    /// Construct a registry error for an attempted operation on a registry path.
    pub fn registry(
        message: impl Into<String>,
        registry_path: impl Into<PathBuf>,
        operation: impl Into<String>,
    ) -> Self {
        FleetError::Registry {
            message: message.into(),
            registry_path: registry_path.into(),
            operation: operation.into(),
            source: None,
        }
    }

    /// Wrap an arbitrary failure into the base classified type.
    ///
    /// Already-classified errors pass through unchanged, so wrapping is
    /// idempotent at the command-surface boundary.
    pub fn wrap(err: anyhow::Error) -> Self {
        match err.downcast::<FleetError>() {
            Ok(classified) => classified,
            Err(other) => FleetError::Other {
                message: other.to_string(),
                source: Some(other.into()),
            },
        }
    }

    /// True for git-operation failures classified as merge/rebase conflicts.
    pub fn is_conflict(&self) -> bool {
        matches!(self, FleetError::GitOperation { conflict: true, .. })
    }
}

impl std::fmt::Display for FleetError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FleetError::GitOperation {
                message,
                command,
                exit_code,
                stderr,
                ..
            } => {
                write!(f, "[{}] {}", self.kind(), message)?;
                write!(f, "\n  Command: {command}")?;
                if let Some(code) = exit_code {
                    write!(f, "\n  Exit Code: {code}")?;
                }
                if !stderr.is_empty() {
                    write!(f, "\n  Error Output: {stderr}")?;
                }
            }
            FleetError::Registry {
                message,
                registry_path,
                operation,
                ..
            } => {
                write!(f, "[{}] {}", self.kind(), message)?;
                write!(f, "\n  Registry Path: {}", registry_path.display())?;
                write!(f, "\n  Operation: {operation}")?;
            }
            FleetError::Validation {
                message,
                field,
                issues,
            } => {
                write!(f, "[{}] {}", self.kind(), message)?;
                if let Some(field) = field {
                    write!(f, "\n  Field: {field}")?;
                }
                if !issues.is_empty() {
                    write!(f, "\n  Validation Errors:")?;
                    for issue in issues {
                        write!(f, "\n    - {}: {}", issue.path, issue.message)?;
                    }
                }
            }
            FleetError::Other { message, .. } => {
                write!(f, "[{}] {}", self.kind(), message)?;
            }
        }

        if let Some(cause) = self.cause() {
            write!(f, "\n  Caused by: {cause}")?;
        }
        Ok(())
    }
}

impl std::error::Error for FleetError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.cause()
            .map(|s| s as &(dyn std::error::Error + 'static))
    }
}

impl FleetError {
    fn cause(&self) -> Option<&(dyn std::error::Error + Send + Sync + 'static)> {
        match self {
            FleetError::GitOperation { source, .. }
            | FleetError::Registry { source, .. }
            | FleetError::Other { source, .. } => source.as_deref(),
            FleetError::Validation { .. } => None,
        }
    }
}

/// Format any failure as the multi-line human-readable report.
///
/// Classified errors use their structured Display; anything else falls back
/// to the anyhow chain so no context is lost.
pub fn report(err: &anyhow::Error) -> String {
    match err.downcast_ref::<FleetError>() {
        Some(classified) => classified.to_string(),
        None => format!("{err:#}"),
    }
}
