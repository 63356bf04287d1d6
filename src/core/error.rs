//! Typed failures shared by the store, the stages and the orchestrator.

use crate::core::state::{PanelId, PipelineStage, RunState, RunStatus};
use thiserror::Error;

/// Failure reported by a stage collaborator.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StageError {
    /// Rate limits, timeouts, dropped connections. Worth retrying.
    #[error("transient stage failure: {0}")]
    Transient(String),

    /// Malformed or unusable output. Retrying will not help.
    #[error("permanent stage failure: {0}")]
    Permanent(String),
}

impl StageError {
    pub fn transient(msg: impl Into<String>) -> Self {
        StageError::Transient(msg.into())
    }

    pub fn permanent(msg: impl Into<String>) -> Self {
        StageError::Permanent(msg.into())
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, StageError::Transient(_))
    }

    pub fn message(&self) -> &str {
        match self {
            StageError::Transient(m) | StageError::Permanent(m) => m,
        }
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("run {run_id} not found")]
    NotFound { run_id: String },

    #[error("version conflict on run {}: expected {expected}, stored {}", .current.run_id, .current.version)]
    VersionConflict {
        expected: u64,
        current: Box<RunState>,
    },

    #[error("run document {path} is corrupt: {source}")]
    Corrupt {
        path: std::path::PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("gave up saving run {run_id} after {attempts} version conflicts")]
    ConcurrentEditConflict { run_id: String, attempts: u32 },

    #[error("run {run_id} is {status}, expected {expected}")]
    InvalidStatus {
        run_id: String,
        status: RunStatus,
        expected: &'static str,
    },

    #[error("run {run_id} has no open gate at {cursor}")]
    NoOpenGate {
        run_id: String,
        cursor: PipelineStage,
    },

    #[error("panel {panel_id} does not exist in run {run_id}")]
    UnknownPanel { run_id: String, panel_id: PanelId },

    #[error("input text is empty")]
    EmptyInput,

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl PipelineError {
    pub fn is_version_conflict(&self) -> bool {
        matches!(self, PipelineError::Store(StoreError::VersionConflict { .. }))
    }
}
