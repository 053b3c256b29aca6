//! neurodx-worker library interface
//!
//! Exposes the pipeline, adapters and orchestrator for the binary and for
//! integration tests.

pub mod db;
pub mod error;
pub mod model;
pub mod pipeline;
pub mod services;
pub mod volume;
pub mod worker;

pub use crate::error::{ErrorCategory, PipelineError, TaskError};
pub use crate::pipeline::{DiagnosticPipeline, Diagnosis, PipelineSettings, ScanAnalyzer};
pub use crate::worker::{TaskOrchestrator, WorkDirs, WorkerStats};
