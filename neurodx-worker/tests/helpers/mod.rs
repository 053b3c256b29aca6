//! Shared test fixtures: NIfTI writer and in-memory adapter doubles

#![allow(dead_code)]

use async_trait::async_trait;
use neurodx_common::{DiagnosisClass, ScanTask, TaskStatus};
use neurodx_worker::db::TaskStore;
use neurodx_worker::model::BurnClassifier;
use neurodx_worker::pipeline::{Diagnosis, ScanAnalyzer};
use neurodx_worker::services::{ObjectStore, QueueError, StorageError, TaskQueue};
use neurodx_worker::PipelineError;
use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tokio_util::sync::CancellationToken;

// ============================================================================
// NIfTI fixtures
// ============================================================================

pub const RAS_AFFINE: [[f32; 4]; 3] = [
    [1.0, 0.0, 0.0, 0.0],
    [0.0, 1.0, 0.0, 0.0],
    [0.0, 0.0, 1.0, 0.0],
];

/// Write a single-file NIfTI-1 volume of `f32` voxels
///
/// `dims` holds 3 or 4 extents; `value` is evaluated per voxel at `[i, j, k, t]`.
/// The affine is stored as sform rows.
pub fn write_nifti(
    path: &Path,
    dims: &[usize],
    affine: [[f32; 4]; 3],
    value: impl Fn([usize; 4]) -> f32,
) {
    write_scaled_nifti(path, dims, affine, (1.0, 0.0), value)
}

/// [`write_nifti`] with an explicit `(scl_slope, scl_inter)` pair
pub fn write_scaled_nifti(
    path: &Path,
    dims: &[usize],
    affine: [[f32; 4]; 3],
    (slope, intercept): (f32, f32),
    value: impl Fn([usize; 4]) -> f32,
) {
    let mut header = vec![0u8; 352];
    let put_i16 = |buf: &mut Vec<u8>, offset: usize, v: i16| {
        buf[offset..offset + 2].copy_from_slice(&v.to_le_bytes())
    };
    let put_i32 = |buf: &mut Vec<u8>, offset: usize, v: i32| {
        buf[offset..offset + 4].copy_from_slice(&v.to_le_bytes())
    };
    let put_f32 = |buf: &mut Vec<u8>, offset: usize, v: f32| {
        buf[offset..offset + 4].copy_from_slice(&v.to_le_bytes())
    };

    put_i32(&mut header, 0, 348);
    header[38] = b'r';
    put_i16(&mut header, 40, dims.len() as i16);
    for (axis, &extent) in dims.iter().enumerate() {
        put_i16(&mut header, 42 + 2 * axis, extent as i16);
    }
    for axis in dims.len()..7 {
        put_i16(&mut header, 42 + 2 * axis, 1);
    }
    put_i16(&mut header, 70, 16); // FLOAT32
    put_i16(&mut header, 72, 32);
    put_f32(&mut header, 76, 1.0);
    for axis in 0..3 {
        put_f32(&mut header, 80 + 4 * axis, affine[axis][axis].abs().max(1.0));
    }
    put_f32(&mut header, 108, 352.0);
    put_f32(&mut header, 112, slope);
    put_f32(&mut header, 116, intercept);
    put_i16(&mut header, 254, 1); // sform_code
    for (row, offset) in [280usize, 296, 312].into_iter().enumerate() {
        for col in 0..4 {
            put_f32(&mut header, offset + 4 * col, affine[row][col]);
        }
    }
    header[344..348].copy_from_slice(b"n+1\0");

    let extent = |axis: usize| dims.get(axis).copied().unwrap_or(1);
    let mut data = header;
    for t in 0..extent(3) {
        for k in 0..extent(2) {
            for j in 0..extent(1) {
                for i in 0..extent(0) {
                    data.extend_from_slice(&value([i, j, k, t]).to_le_bytes());
                }
            }
        }
    }
    std::fs::write(path, data).unwrap();
}

/// Ellipsoid blob brighter towards its center, on a zero background
pub fn blob(dims: [usize; 3]) -> impl Fn([usize; 4]) -> f32 {
    move |[i, j, k, _]| {
        let d = |v: usize, n: usize| (v as f32 - n as f32 / 2.0) / (n as f32 / 3.0);
        let r2 = d(i, dims[0]).powi(2) + d(j, dims[1]).powi(2) + d(k, dims[2]).powi(2);
        if r2 < 1.0 {
            100.0 * (1.0 - r2) + 10.0
        } else {
            0.0
        }
    }
}

/// Randomly initialized two-block DenseNet small enough for tests
pub fn tiny_classifier() -> BurnClassifier {
    use neurodx_worker::model::DenseNetConfig;
    BurnClassifier::from_config(
        &DenseNetConfig::new(vec![1, 1])
            .with_growth_rate(4)
            .with_init_features(8)
            .with_bn_size(2),
    )
}

// ============================================================================
// Queue
// ============================================================================

/// Replays scripted pop results, then cancels the worker when drained
pub struct ScriptedQueue {
    items: Mutex<VecDeque<Result<Option<ScanTask>, QueueError>>>,
    cancel: CancellationToken,
}

impl ScriptedQueue {
    pub fn new(cancel: CancellationToken) -> Self {
        Self {
            items: Mutex::new(VecDeque::new()),
            cancel,
        }
    }

    pub fn push_task(&self, task: ScanTask) {
        self.items.lock().unwrap().push_back(Ok(Some(task)));
    }

    pub fn push_result(&self, result: Result<Option<ScanTask>, QueueError>) {
        self.items.lock().unwrap().push_back(result);
    }

    pub fn remaining(&self) -> usize {
        self.items.lock().unwrap().len()
    }
}

#[async_trait]
impl TaskQueue for ScriptedQueue {
    async fn next_task(&self) -> Result<Option<ScanTask>, QueueError> {
        let next = self.items.lock().unwrap().pop_front();
        match next {
            Some(result) => result,
            None => {
                self.cancel.cancel();
                Ok(None)
            }
        }
    }
}

// ============================================================================
// Object store
// ============================================================================

#[derive(Default)]
pub struct MemoryObjectStore {
    pub objects: Mutex<HashMap<String, Vec<u8>>>,
    pub uploads: Mutex<HashMap<String, Vec<u8>>>,
    pub fail_uploads: bool,
}

impl MemoryObjectStore {
    pub fn with_object(key: &str, content: Vec<u8>) -> Self {
        let store = Self::default();
        store.objects.lock().unwrap().insert(key.to_string(), content);
        store
    }

    pub fn uploaded(&self, key: &str) -> Option<Vec<u8>> {
        self.uploads.lock().unwrap().get(key).cloned()
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn download(&self, key: &str, dest: &Path) -> Result<(), StorageError> {
        let content = self.objects.lock().unwrap().get(key).cloned();
        match content {
            Some(bytes) => {
                tokio::fs::write(dest, bytes).await?;
                Ok(())
            }
            None => Err(StorageError::Download {
                key: key.to_string(),
                reason: "NoSuchKey".to_string(),
            }),
        }
    }

    async fn upload(&self, src: &Path, key: &str) -> Result<(), StorageError> {
        if self.fail_uploads {
            return Err(StorageError::Upload {
                key: key.to_string(),
                reason: "503 Service Unavailable".to_string(),
            });
        }
        let content = tokio::fs::read(src).await?;
        self.uploads.lock().unwrap().insert(key.to_string(), content);
        Ok(())
    }
}

// ============================================================================
// Task store
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub struct TaskRecord {
    pub status: TaskStatus,
    pub diagnosis: Option<i32>,
    pub confidence: Option<f32>,
    pub artifact_key: Option<String>,
    pub error_message: Option<String>,
}

#[derive(Default)]
pub struct MemoryTaskStore {
    pub records: Mutex<HashMap<i64, TaskRecord>>,
    pub fail_create: bool,
    pub fail_complete: bool,
    pub fail_calls: Mutex<Vec<i64>>,
}

impl MemoryTaskStore {
    pub fn record(&self, scan_id: i64) -> Option<TaskRecord> {
        self.records.lock().unwrap().get(&scan_id).cloned()
    }

    pub fn statuses(&self) -> Vec<TaskStatus> {
        self.records.lock().unwrap().values().map(|r| r.status).collect()
    }
}

#[async_trait]
impl TaskStore for MemoryTaskStore {
    async fn create(&self, scan_id: i64) -> neurodx_common::Result<()> {
        if self.fail_create {
            return Err(sqlx::Error::Protocol("connection reset".to_string()).into());
        }
        self.records.lock().unwrap().insert(
            scan_id,
            TaskRecord {
                status: TaskStatus::Processing,
                diagnosis: None,
                confidence: None,
                artifact_key: None,
                error_message: None,
            },
        );
        Ok(())
    }

    async fn complete(
        &self,
        scan_id: i64,
        diagnosis: i32,
        confidence: f32,
        artifact_key: &str,
    ) -> neurodx_common::Result<()> {
        if self.fail_complete {
            return Err(sqlx::Error::Protocol("deadlock detected".to_string()).into());
        }
        let mut records = self.records.lock().unwrap();
        let record = records
            .get_mut(&scan_id)
            .ok_or(neurodx_common::Error::RecordNotFound(scan_id))?;
        record.status = TaskStatus::Done;
        record.diagnosis = Some(diagnosis);
        record.confidence = Some(confidence);
        record.artifact_key = Some(artifact_key.to_string());
        Ok(())
    }

    async fn fail(&self, scan_id: i64, error_message: &str) -> neurodx_common::Result<()> {
        self.fail_calls.lock().unwrap().push(scan_id);
        if let Some(record) = self.records.lock().unwrap().get_mut(&scan_id) {
            record.status = TaskStatus::Failed;
            record.error_message = Some(error_message.to_string());
        }
        Ok(())
    }
}

// ============================================================================
// Analyzer
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum AnalyzerMode {
    Succeed,
    FailUnreadable,
    FailMissingLayer,
    Panic,
}

/// Writes a placeholder artifact on success; remembers the paths it saw
pub struct StubAnalyzer {
    pub mode: AnalyzerMode,
    pub seen: Mutex<Vec<(PathBuf, PathBuf, bool)>>,
}

impl StubAnalyzer {
    pub fn new(mode: AnalyzerMode) -> Self {
        Self {
            mode,
            seen: Mutex::new(Vec::new()),
        }
    }

    pub fn diagnosis() -> Diagnosis {
        Diagnosis {
            class: DiagnosisClass::Alzheimers,
            confidence: 0.72,
            probabilities: vec![0.08, 0.2, 0.72],
            slice_count: 15,
        }
    }
}

impl ScanAnalyzer for StubAnalyzer {
    fn analyze(&self, volume_path: &Path, artifact_path: &Path) -> Result<Diagnosis, PipelineError> {
        self.seen.lock().unwrap().push((
            volume_path.to_path_buf(),
            artifact_path.to_path_buf(),
            volume_path.exists(),
        ));

        match self.mode {
            AnalyzerMode::Succeed => {
                std::fs::write(artifact_path, b"\x89PNG fake")?;
                Ok(Self::diagnosis())
            }
            AnalyzerMode::FailUnreadable => Err(PipelineError::UnreadableVolume {
                path: volume_path.to_path_buf(),
                reason: "bad magic".to_string(),
            }),
            AnalyzerMode::FailMissingLayer => {
                // Artifact half-written before the failure
                std::fs::write(artifact_path, b"partial")?;
                Err(PipelineError::MissingLayer("features.denseblock9".to_string()))
            }
            AnalyzerMode::Panic => panic!("tensor shape mismatch"),
        }
    }
}
