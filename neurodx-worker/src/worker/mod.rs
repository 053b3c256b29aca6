//! Task orchestrator
//!
//! Pops one task at a time and drives it to a terminal, recorded state:
//! record → download → analyze → upload → complete, or fail on the first
//! error. Local files are removed whatever the outcome.

pub mod files;
pub mod task;

pub use files::TaskFiles;
pub use task::{StateTransition, Task, TaskState};

use neurodx_common::config::PathsConfig;
use neurodx_common::ScanTask;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::db::TaskStore;
use crate::error::TaskError;
use crate::pipeline::{Diagnosis, ScanAnalyzer};
use crate::services::{ObjectStore, QueueError, TaskQueue};

/// Object key of a scan's uploaded artifact
pub fn artifact_key(scan_id: i64) -> String {
    format!("gradcams/{}.png", scan_id)
}

/// Local folders for downloaded volumes and rendered artifacts
#[derive(Debug, Clone)]
pub struct WorkDirs {
    pub scan_dir: PathBuf,
    pub artifact_dir: PathBuf,
}

impl WorkDirs {
    pub fn create_all(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.scan_dir)?;
        std::fs::create_dir_all(&self.artifact_dir)
    }

    pub fn artifact_path(&self, scan_id: i64) -> PathBuf {
        self.artifact_dir.join(format!("{}_gradcam.png", scan_id))
    }
}

impl From<&PathsConfig> for WorkDirs {
    fn from(config: &PathsConfig) -> Self {
        Self {
            scan_dir: config.scan_dir.clone(),
            artifact_dir: config.artifact_dir.clone(),
        }
    }
}

/// Counters reported when the loop stops
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct WorkerStats {
    pub received: u64,
    pub done: u64,
    pub failed: u64,
    /// Malformed queue messages
    pub skipped: u64,
    pub queue_errors: u64,
}

pub struct TaskOrchestrator {
    queue: Arc<dyn TaskQueue>,
    objects: Arc<dyn ObjectStore>,
    records: Arc<dyn TaskStore>,
    analyzer: Arc<dyn ScanAnalyzer>,
    dirs: WorkDirs,
    reconnect_delay: Duration,
}

impl TaskOrchestrator {
    pub fn new(
        queue: Arc<dyn TaskQueue>,
        objects: Arc<dyn ObjectStore>,
        records: Arc<dyn TaskStore>,
        analyzer: Arc<dyn ScanAnalyzer>,
        dirs: WorkDirs,
    ) -> Self {
        Self {
            queue,
            objects,
            records,
            analyzer,
            dirs,
            reconnect_delay: Duration::from_secs(1),
        }
    }

    /// Pause after a failed queue pop
    pub fn with_reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect_delay = delay;
        self
    }

    /// Process tasks until `cancel` fires
    ///
    /// Cancellation is checked between tasks; an in-flight task always runs
    /// to completion.
    pub async fn run(&self, cancel: CancellationToken) -> WorkerStats {
        let mut stats = WorkerStats::default();
        tracing::info!("Worker listening for tasks");

        while !cancel.is_cancelled() {
            match self.queue.next_task().await {
                Ok(Some(scan)) => {
                    stats.received += 1;
                    let task = self.process_task(scan).await;
                    match task.state {
                        TaskState::Done => stats.done += 1,
                        _ => stats.failed += 1,
                    }
                }
                Ok(None) => {}
                Err(QueueError::Malformed { payload, reason }) => {
                    stats.skipped += 1;
                    tracing::warn!(%payload, %reason, "Skipping malformed queue message");
                }
                Err(e) => {
                    stats.queue_errors += 1;
                    tracing::error!(error = %e, delay_ms = self.reconnect_delay.as_millis() as u64, "Queue pop failed");
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(self.reconnect_delay) => {}
                    }
                }
            }
        }

        tracing::info!(
            received = stats.received,
            done = stats.done,
            failed = stats.failed,
            skipped = stats.skipped,
            "Worker stopped"
        );
        stats
    }

    /// Drive one task to `Done` or `Failed`
    pub async fn process_task(&self, scan: ScanTask) -> Task {
        let scan_id = scan.scan_id;
        let mut task = Task::received(&scan);
        tracing::info!(
            scan_id,
            object = %scan.object_name,
            enqueued_at = ?scan.enqueued_at(),
            "Task received"
        );

        if let Err(e) = self.records.create(scan_id).await {
            let error = TaskError::Persist(e);
            tracing::error!(scan_id, category = error.category().as_str(), error = %error, "Could not create task record");
            self.record_failure(scan_id, &error).await;
            task.fail(&error);
            return task;
        }
        task.transition_to(TaskState::Processing);

        let mut files = TaskFiles::new(scan_id);
        match self.execute(&scan, &mut files).await {
            Ok((diagnosis, key)) => {
                tracing::info!(
                    scan_id,
                    class = %diagnosis.class,
                    confidence = diagnosis.confidence,
                    artifact = %key,
                    "Task done"
                );
                task.complete(diagnosis, key);
            }
            Err(error) => {
                tracing::error!(scan_id, category = error.category().as_str(), error = %error, "Task failed");
                self.record_failure(scan_id, &error).await;
                task.fail(&error);
            }
        }
        files.cleanup();

        task
    }

    async fn execute(&self, scan: &ScanTask, files: &mut TaskFiles) -> Result<(Diagnosis, String), TaskError> {
        let scan_id = scan.scan_id;
        let file_name = scan
            .file_name()
            .map_err(|e| TaskError::InvalidTask(e.to_string()))?;

        let volume_path = files.track(self.dirs.scan_dir.join(file_name));
        let artifact_path = files.track(self.dirs.artifact_path(scan_id));

        tracing::info!(scan_id, dest = %volume_path.display(), "Downloading volume");
        self.objects
            .download(&scan.object_name, &volume_path)
            .await
            .map_err(TaskError::Download)?;

        tracing::info!(scan_id, "Running diagnostic pipeline");
        let analyzer = Arc::clone(&self.analyzer);
        let (input, output) = (volume_path.clone(), artifact_path.clone());
        let diagnosis = tokio::task::spawn_blocking(move || analyzer.analyze(&input, &output))
            .await
            .map_err(|e| TaskError::Aborted(join_error_message(e)))??;

        let key = artifact_key(scan_id);
        tracing::info!(scan_id, key = %key, "Uploading artifact");
        self.objects
            .upload(&artifact_path, &key)
            .await
            .map_err(TaskError::Upload)?;

        self.records
            .complete(scan_id, diagnosis.class_index() as i32, diagnosis.confidence, &key)
            .await
            .map_err(TaskError::Persist)?;

        Ok((diagnosis, key))
    }

    async fn record_failure(&self, scan_id: i64, error: &TaskError) {
        if let Err(e) = self.records.fail(scan_id, &error.to_string()).await {
            tracing::error!(scan_id, error = %e, "Could not record task failure");
        }
    }
}

fn join_error_message(err: tokio::task::JoinError) -> String {
    if !err.is_panic() {
        return err.to_string();
    }
    let payload = err.into_panic();
    payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .map(|msg| format!("pipeline panicked: {}", msg))
        .unwrap_or_else(|| "pipeline panicked".to_string())
}
