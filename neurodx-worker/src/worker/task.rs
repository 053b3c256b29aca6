//! In-memory task lifecycle
//!
//! `Received → Processing → Done | Failed`. A task whose record cannot even be
//! created goes straight from `Received` to `Failed`.

use chrono::{DateTime, Utc};
use neurodx_common::{ScanTask, TaskStatus};
use serde::Serialize;

use crate::error::{ErrorCategory, TaskError};
use crate::pipeline::Diagnosis;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskState {
    /// Popped from the queue, no record yet
    Received,
    /// Record created; pipeline running
    Processing,
    /// Artifact uploaded and result recorded
    Done,
    /// Stopped by an error; failure recorded when possible
    Failed,
}

impl TaskState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskState::Done | TaskState::Failed)
    }

    fn can_transition_to(&self, next: TaskState) -> bool {
        matches!(
            (self, next),
            (TaskState::Received, TaskState::Processing)
                | (TaskState::Received, TaskState::Failed)
                | (TaskState::Processing, TaskState::Done)
                | (TaskState::Processing, TaskState::Failed)
        )
    }

    /// Persisted status for this state; `Received` has none
    pub fn status(&self) -> Option<TaskStatus> {
        match self {
            TaskState::Received => None,
            TaskState::Processing => Some(TaskStatus::Processing),
            TaskState::Done => Some(TaskStatus::Done),
            TaskState::Failed => Some(TaskStatus::Failed),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StateTransition {
    pub scan_id: i64,
    pub old_state: TaskState,
    pub new_state: TaskState,
    pub transitioned_at: DateTime<Utc>,
}

/// One scan's processing run
#[derive(Debug, Clone, Serialize)]
pub struct Task {
    pub scan_id: i64,
    pub object_name: String,
    pub state: TaskState,
    pub received_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub diagnosis: Option<Diagnosis>,
    /// Object key of the uploaded artifact
    pub artifact_key: Option<String>,
    pub error_message: Option<String>,
    #[serde(skip)]
    pub error_category: Option<ErrorCategory>,
    pub transitions: Vec<StateTransition>,
}

impl Task {
    pub fn received(scan: &ScanTask) -> Self {
        Self {
            scan_id: scan.scan_id,
            object_name: scan.object_name.clone(),
            state: TaskState::Received,
            received_at: Utc::now(),
            started_at: None,
            completed_at: None,
            diagnosis: None,
            artifact_key: None,
            error_message: None,
            error_category: None,
            transitions: Vec::new(),
        }
    }

    /// Move to `new_state`; `None` (and no change) if the move is not allowed
    pub fn transition_to(&mut self, new_state: TaskState) -> Option<StateTransition> {
        if !self.state.can_transition_to(new_state) {
            tracing::warn!(
                scan_id = self.scan_id,
                from = ?self.state,
                to = ?new_state,
                "Ignoring invalid task transition"
            );
            return None;
        }

        let transition = StateTransition {
            scan_id: self.scan_id,
            old_state: self.state,
            new_state,
            transitioned_at: Utc::now(),
        };
        self.state = new_state;

        match new_state {
            TaskState::Processing => self.started_at = Some(transition.transitioned_at),
            TaskState::Done | TaskState::Failed => self.completed_at = Some(transition.transitioned_at),
            TaskState::Received => {}
        }

        self.transitions.push(transition.clone());
        Some(transition)
    }

    pub fn complete(&mut self, diagnosis: Diagnosis, artifact_key: String) {
        if self.transition_to(TaskState::Done).is_some() {
            self.diagnosis = Some(diagnosis);
            self.artifact_key = Some(artifact_key);
        }
    }

    pub fn fail(&mut self, error: &TaskError) {
        if self.transition_to(TaskState::Failed).is_some() {
            self.error_message = Some(error.to_string());
            self.error_category = Some(error.category());
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }
}
