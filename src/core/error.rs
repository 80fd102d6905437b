//! TW-007: Error taxonomy for graph construction, rendering, and execution.
//!
//! Graph and configuration errors surface before any workspace exists.
//! Everything else is scoped to one definition and ends the run fail-fast.

use super::types::{HookEvent, Step};
use std::path::PathBuf;
use thiserror::Error;

/// Every failure the orchestrator can report.
#[derive(Debug, Error)]
pub enum WorkerError {
    /// Invalid configuration or run options.
    #[error("configuration error: {0}")]
    Config(String),

    /// A remote_vars entry is not of the form `source.outputs.path`.
    #[error("definition '{definition}' has invalid remote reference '{reference}': {reason}")]
    InvalidReference {
        definition: String,
        reference: String,
        reason: String,
    },

    /// A remote reference names a definition that is not configured.
    #[error("definition '{definition}' references unknown definition '{reference}'")]
    UnknownReference {
        definition: String,
        reference: String,
    },

    /// Remote references form a cycle. `path` is closed: first == last.
    #[error("dependency cycle detected: {}", path.join(" -> "))]
    Cycle { path: Vec<String> },

    /// Workspace rendering failed.
    #[error("failed to render definition '{definition}': {cause}")]
    Render { definition: String, cause: String },

    /// The provisioning binary exited unexpectedly.
    #[error("terraform {step} failed for '{definition}'{}: {detail}", exit_code.map(|c| format!(" (exit code {c})")).unwrap_or_default())]
    Execution {
        definition: String,
        step: Step,
        exit_code: Option<i32>,
        detail: String,
    },

    /// A hook script exited non-zero.
    #[error("hook {event} ({}) failed for '{definition}' with exit code {exit_code}", script.display())]
    Hook {
        definition: String,
        event: HookEvent,
        script: PathBuf,
        exit_code: i32,
    },

    /// A remote value could not be read for a hook environment.
    #[error("cannot read remote value '{reference}' for '{definition}': {cause}")]
    RemoteState {
        definition: String,
        reference: String,
        cause: String,
    },

    /// Transient backend errors persisted after every retry.
    #[error("backend error during {step} of '{definition}' after {attempts} attempt(s): {detail}")]
    Backend {
        definition: String,
        step: Step,
        attempts: u32,
        detail: String,
    },

    /// Workspace I/O or cleanup failure.
    #[error("workspace error at {}: {source}", path.display())]
    Workspace {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Lifecycle state machine misuse.
    #[error("definition '{definition}' cannot move from {from} to {to}")]
    InvalidTransition {
        definition: String,
        from: String,
        to: String,
    },

    /// The run was interrupted.
    #[error("run cancelled during {step} of '{definition}'")]
    Cancelled { definition: String, step: Step },
}

impl WorkerError {
    /// True for errors raised before any workspace is created.
    pub fn is_graph_error(&self) -> bool {
        matches!(
            self,
            Self::Config(_)
                | Self::InvalidReference { .. }
                | Self::UnknownReference { .. }
                | Self::Cycle { .. }
        )
    }

    pub(crate) fn workspace(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Workspace {
            path: path.into(),
            source,
        }
    }
}

pub type Result<T> = std::result::Result<T, WorkerError>;
