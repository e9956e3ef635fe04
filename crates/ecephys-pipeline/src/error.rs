//! Error taxonomy for the pipeline orchestrator.

use std::path::PathBuf;

use thiserror::Error;

/// Fatal errors. Any of these aborts the current run (not the batch).
#[derive(Debug, Error)]
pub enum PipelineError {
    /// Symbolic trigger bounds could not be resolved against the run folder.
    #[error("cannot resolve trigger range '{expr}' in {folder:?}: {reason}")]
    Resolution {
        expr: String,
        folder: PathBuf,
        reason: String,
    },

    /// An external stage exited with a non-zero status.
    #[error("stage '{stage}' failed for {session}{} with exit code {exit_code}", probe_suffix(.probe))]
    StageExecution {
        stage: String,
        session: String,
        probe: Option<String>,
        exit_code: i32,
    },

    /// The stage process could not be started at all.
    #[error("stage '{stage}' could not be launched for {session}{}: {source}", probe_suffix(.probe))]
    StageSpawn {
        stage: String,
        session: String,
        probe: Option<String>,
        #[source]
        source: std::io::Error,
    },

    /// The stage reported success but never wrote its output document.
    #[error("stage '{stage}' exited cleanly but wrote no output document at {path:?}")]
    StageOutputMissing { stage: String, path: PathBuf },

    /// The canonical artifact directory already holds data.
    #[error("canonical location {path:?} already exists and is not empty")]
    PathConflict { path: PathBuf },

    /// A stage's default output location is absent after the stage ran.
    #[error("expected artifact at {path:?} was not produced")]
    ArtifactMissing { path: PathBuf },

    /// Invalid configuration, detected before any stage is invoked.
    #[error("configuration error: {0}")]
    Config(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

fn probe_suffix(probe: &Option<String>) -> String {
    match probe {
        Some(p) => format!(" probe {p}"),
        None => String::new(),
    }
}

impl PipelineError {
    /// Stage identity for stage-level failures, used when reporting a failed run.
    pub fn stage(&self) -> Option<&str> {
        match self {
            PipelineError::StageExecution { stage, .. }
            | PipelineError::StageSpawn { stage, .. }
            | PipelineError::StageOutputMissing { stage, .. } => Some(stage),
            _ => None,
        }
    }
}

/// Non-fatal: an edit rate could not be recovered and 0.0 was used instead.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum LogParseWarning {
    #[error("preprocessing log {0:?} is unavailable")]
    LogUnavailable(String),

    #[error("no edit-rate record for {key} probe {probe}")]
    MissingRecord { key: String, probe: String },

    #[error("unparseable edit rate '{value}' for {key} probe {probe}")]
    Unparseable {
        key: String,
        probe: String,
        value: String,
    },
}

/// Result alias for pipeline operations.
pub type Result<T> = std::result::Result<T, PipelineError>;
