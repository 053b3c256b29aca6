//! # NeuroDx Common Library
//!
//! Shared code for the NeuroDx diagnosis worker:
//! - Error type shared by the worker's adapters
//! - Worker configuration (TOML + environment resolution)
//! - Queue message and task lifecycle models
//! - Diagnosis label set

pub mod config;
pub mod error;
pub mod task;

pub use error::{Error, Result};
pub use task::{DiagnosisClass, ScanTask, TaskStatus};
