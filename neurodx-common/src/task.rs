//! Queue message and task lifecycle models
//!
//! A producer pushes one [`ScanTask`] per uploaded scan; the worker records
//! the outcome against `scan_id` using [`TaskStatus`].

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::{Error, Result};

/// Scan-processing request popped from the task queue
///
/// Wire format: `{"scan_id": 42, "object_name": "scans/42/t1.nii.gz", "created_at": 1700000000}`.
/// Unknown fields are ignored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanTask {
    /// Primary key of the parent scan row
    pub scan_id: i64,
    /// Object key of the uploaded volume in the scan bucket
    pub object_name: String,
    /// Enqueue time (unix seconds), if the producer sent one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<i64>,
}

impl ScanTask {
    pub fn new(scan_id: i64, object_name: impl Into<String>) -> Self {
        Self {
            scan_id,
            object_name: object_name.into(),
            created_at: None,
        }
    }

    /// Parse a raw queue payload
    pub fn from_json(payload: &str) -> Result<Self> {
        serde_json::from_str(payload)
            .map_err(|e| Error::MalformedTask(e.to_string()))
    }

    /// Enqueue time as a timestamp
    pub fn enqueued_at(&self) -> Option<DateTime<Utc>> {
        self.created_at
            .and_then(|secs| Utc.timestamp_opt(secs, 0).single())
    }

    /// File name component of the object key (text after the last `/`)
    ///
    /// Rejects names that would escape the download folder.
    pub fn file_name(&self) -> Result<&str> {
        let name = self
            .object_name
            .rsplit('/')
            .next()
            .unwrap_or_default();

        match name {
            "" | "." | ".." => Err(Error::MalformedTask(format!(
                "Object name has no usable file component: {:?}",
                self.object_name
            ))),
            name => Ok(name),
        }
    }
}

/// Persisted lifecycle status of a result row (and its parent scan)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Processing,
    Done,
    Failed,
}

impl TaskStatus {
    /// Column value used in the `status` columns
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Processing => "processing",
            TaskStatus::Done => "done",
            TaskStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Done | TaskStatus::Failed)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Fixed clinical label set of the classifier output
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DiagnosisClass {
    /// Cognitively normal
    #[serde(rename = "CN")]
    CognitivelyNormal,
    /// Mild cognitive impairment
    #[serde(rename = "MCI")]
    MildCognitiveImpairment,
    /// Alzheimer's disease
    #[serde(rename = "AD")]
    Alzheimers,
}

impl DiagnosisClass {
    /// All classes in output-index order
    pub const ALL: [DiagnosisClass; 3] = [
        DiagnosisClass::CognitivelyNormal,
        DiagnosisClass::MildCognitiveImpairment,
        DiagnosisClass::Alzheimers,
    ];

    /// Number of classifier outputs
    pub const COUNT: usize = Self::ALL.len();

    pub fn from_index(index: usize) -> Option<Self> {
        Self::ALL.get(index).copied()
    }

    pub fn index(&self) -> usize {
        match self {
            DiagnosisClass::CognitivelyNormal => 0,
            DiagnosisClass::MildCognitiveImpairment => 1,
            DiagnosisClass::Alzheimers => 2,
        }
    }

    /// Short clinical code ("CN", "MCI", "AD")
    pub fn code(&self) -> &'static str {
        match self {
            DiagnosisClass::CognitivelyNormal => "CN",
            DiagnosisClass::MildCognitiveImpairment => "MCI",
            DiagnosisClass::Alzheimers => "AD",
        }
    }
}

impl fmt::Display for DiagnosisClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}
