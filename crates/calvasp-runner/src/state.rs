//! Durable per-task records: task config, per-structure status, and the
//! current batch submission.
//!
//! No locking. At most one orchestrator and one job runner touch a task's
//! files at a time; the orchestrator never submits while a job is active.

use crate::config::TaskConfig;
use crate::error::{Result, RunnerError};
use crate::fsutil::{atomic_write_json_pretty, ensure_dir};
use crate::ids::{numbered_entries, BatchJobId, Generation, StructureId};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

/// Directory layout of one task.
#[derive(Debug, Clone)]
pub struct TaskPaths {
    pub task_dir: PathBuf,
}

impl TaskPaths {
    pub fn new(tasks_dir: &Path, generation: Generation) -> Self {
        Self {
            task_dir: tasks_dir.join(format!("task_{}", generation)),
        }
    }

    pub fn config(&self) -> PathBuf {
        self.task_dir.join(crate::TASK_CONFIG_FILE)
    }

    pub fn status(&self) -> PathBuf {
        self.task_dir.join(crate::TASK_STATUS_FILE)
    }

    pub fn batch_record(&self) -> PathBuf {
        self.task_dir.join(crate::BATCH_RECORD_FILE)
    }

    pub fn structures_dir(&self) -> PathBuf {
        self.task_dir.join(crate::TASK_STRUCTURES_DIR)
    }

    pub fn exists(&self) -> bool {
        self.config().is_file()
    }
}

/// Candidate structures of a task, in ascending id order.
pub fn task_structures(structures_dir: &Path) -> Result<Vec<(StructureId, PathBuf)>> {
    Ok(numbered_entries(structures_dir, crate::STRUCTURE_PREFIX)?
        .into_iter()
        .filter(|(_, p)| p.is_file())
        .map(|(n, p)| (StructureId(n), p))
        .collect())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StructureStatus {
    #[default]
    NotStarted,
    Success,
    Failed,
}

/// Outcome of processing one structure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StructureRecord {
    pub status: StructureStatus,
    /// RFC 3339 time the record was last written; empty until then.
    #[serde(default)]
    pub timestamp: String,
    #[serde(default)]
    pub workdir: PathBuf,
    #[serde(default)]
    pub error: String,
    #[serde(default)]
    pub warning: String,
}

impl StructureRecord {
    pub fn started(workdir: &Path) -> Self {
        Self {
            status: StructureStatus::NotStarted,
            timestamp: String::new(),
            workdir: workdir.to_path_buf(),
            error: String::new(),
            warning: String::new(),
        }
    }
}

/// Contents of `status.json`, keyed by `POSCAR_<n>`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskStatus {
    #[serde(default)]
    pub jobs: BTreeMap<String, StructureRecord>,
}

impl TaskStatus {
    pub fn get(&self, id: StructureId) -> Option<&StructureRecord> {
        self.jobs.get(&id.status_key())
    }

    pub fn is_success(&self, id: StructureId) -> bool {
        self.get(id).map(|r| r.status) == Some(StructureStatus::Success)
    }

    pub fn insert(&mut self, id: StructureId, record: StructureRecord) {
        self.jobs.insert(id.status_key(), record);
    }

    /// True when every listed structure has a successful record.
    pub fn is_complete<'a>(&self, ids: impl IntoIterator<Item = &'a StructureId>) -> bool {
        ids.into_iter().all(|id| self.is_success(*id))
    }

    pub fn count(&self, status: StructureStatus) -> usize {
        self.jobs.values().filter(|r| r.status == status).count()
    }
}

/// Contents of `slurm.json`: the bridge between the orchestrator and the
/// scheduler across restarts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchRecord {
    pub current_id: BatchJobId,
    #[serde(default)]
    pub job_name: String,
    #[serde(default)]
    pub submitted_at: String,
    #[serde(default = "default_attempts")]
    pub attempts: u32,
}

fn default_attempts() -> u32 {
    1
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T> {
    let bytes = fs::read(path)?;
    serde_json::from_slice(&bytes).map_err(|e| RunnerError::State {
        path: path.to_path_buf(),
        message: e.to_string(),
    })
}

pub fn save_task_config(paths: &TaskPaths, config: &TaskConfig) -> Result<()> {
    ensure_dir(&paths.task_dir)?;
    atomic_write_json_pretty(&paths.config(), config)
}

/// Missing file reads as an empty status.
pub fn load_status(path: &Path) -> Result<TaskStatus> {
    if !path.is_file() {
        return Ok(TaskStatus::default());
    }
    read_json(path)
}

pub fn save_status(path: &Path, status: &TaskStatus) -> Result<()> {
    atomic_write_json_pretty(path, status)
}

pub fn load_batch_record(paths: &TaskPaths) -> Result<Option<BatchRecord>> {
    let path = paths.batch_record();
    if !path.is_file() {
        return Ok(None);
    }
    read_json(&path).map(Some)
}

/// Records a new submission, replacing the previous one and bumping the
/// attempt count.
pub fn record_submission(
    paths: &TaskPaths,
    job_id: BatchJobId,
    job_name: &str,
) -> Result<BatchRecord> {
    let attempts = load_batch_record(paths)?.map(|r| r.attempts + 1).unwrap_or(1);
    let record = BatchRecord {
        current_id: job_id,
        job_name: job_name.to_string(),
        submitted_at: Utc::now().to_rfc3339(),
        attempts,
    };
    atomic_write_json_pretty(&paths.batch_record(), &record)?;
    Ok(record)
}
