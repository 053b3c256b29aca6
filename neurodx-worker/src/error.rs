//! Error types for neurodx-worker
//!
//! Every per-task failure maps onto one [`ErrorCategory`]; the orchestrator
//! records the message against the task and moves on to the next one.

use std::path::PathBuf;
use thiserror::Error;

use crate::services::StorageError;

/// Failure taxonomy used in logs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Download failure, unreadable or malformed volume, unsupported shape
    Input,
    /// Classifier forward/backward failure, shape mismatch, exhausted resources
    Compute,
    /// Localization could not be produced (e.g. missing feature layer)
    Explainability,
    /// Upload or database write failure
    Sink,
}

impl ErrorCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCategory::Input => "input",
            ErrorCategory::Compute => "compute",
            ErrorCategory::Explainability => "explainability",
            ErrorCategory::Sink => "sink",
        }
    }
}

/// Errors raised by the diagnostic pipeline (volume → diagnosis + artifact)
#[derive(Debug, Error)]
pub enum PipelineError {
    /// Volume file could not be parsed
    #[error("Unreadable volume {path}: {reason}")]
    UnreadableVolume { path: PathBuf, reason: String },

    /// Volume rank or extent the pipeline cannot handle
    #[error("Unsupported volume shape {0:?}")]
    UnsupportedShape(Vec<usize>),

    /// Invalid data reaching a pipeline stage
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Classifier failure
    #[error("Classifier error: {0}")]
    Compute(String),

    /// Designated localization layer does not exist in the network
    #[error("Feature layer not found: {0}")]
    MissingLayer(String),

    /// Overlay image could not be produced
    #[error("Artifact rendering failed: {0}")]
    Render(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl PipelineError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            PipelineError::UnreadableVolume { .. }
            | PipelineError::UnsupportedShape(_)
            | PipelineError::InvalidInput(_)
            | PipelineError::Io(_) => ErrorCategory::Input,
            PipelineError::Compute(_) => ErrorCategory::Compute,
            PipelineError::MissingLayer(_) | PipelineError::Render(_) => {
                ErrorCategory::Explainability
            }
        }
    }
}

/// Any failure that ends a task in the `failed` state
#[derive(Debug, Error)]
pub enum TaskError {
    /// Queue message cannot be processed (e.g. unusable object name)
    #[error("Invalid task: {0}")]
    InvalidTask(String),

    /// Volume could not be fetched
    #[error("Download failed: {0}")]
    Download(StorageError),

    /// Pipeline stage failed
    #[error(transparent)]
    Pipeline(#[from] PipelineError),

    /// Pipeline thread panicked or was cancelled
    #[error("Pipeline aborted: {0}")]
    Aborted(String),

    /// Artifact could not be stored
    #[error("Upload failed: {0}")]
    Upload(StorageError),

    /// Result could not be recorded
    #[error("Database write failed: {0}")]
    Persist(neurodx_common::Error),
}

impl TaskError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            TaskError::InvalidTask(_) | TaskError::Download(_) => ErrorCategory::Input,
            TaskError::Pipeline(e) => e.category(),
            TaskError::Aborted(_) => ErrorCategory::Compute,
            TaskError::Upload(_) | TaskError::Persist(_) => ErrorCategory::Sink,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_categories() {
        assert_eq!(
            PipelineError::UnsupportedShape(vec![4, 4, 4, 4, 4]).category(),
            ErrorCategory::Input
        );
        assert_eq!(
            PipelineError::MissingLayer("features.denseblock9".into()).category(),
            ErrorCategory::Explainability
        );
        assert_eq!(
            TaskError::from(PipelineError::Compute("shape".into())).category(),
            ErrorCategory::Compute
        );
        assert_eq!(
            TaskError::Persist(neurodx_common::Error::RecordNotFound(1)).category(),
            ErrorCategory::Sink
        );
    }

    #[test]
    fn test_messages_are_not_empty() {
        let err = TaskError::Upload(StorageError::Upload {
            key: "gradcams/1.png".into(),
            reason: "503".into(),
        });
        let msg = err.to_string();
        assert!(msg.contains("gradcams/1.png"));
        assert!(msg.starts_with("Upload failed"));
    }
}
