use crate::ids::{BatchJobId, Generation, StepIndex};
use std::path::PathBuf;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, RunnerError>;

#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("batch submission failed: {0}")]
    Submission(String),

    #[error("batch query for job {job_id} failed: {message}")]
    Query { job_id: BatchJobId, message: String },

    #[error("batch cancellation of job {job_id} failed: {message}")]
    Cancel { job_id: BatchJobId, message: String },

    #[error("step {step} exited with {status}; see {}", log.display())]
    Execution {
        step: StepIndex,
        status: String,
        log: PathBuf,
    },

    #[error("{what} not found: {}", path.display())]
    MissingArtifact { what: &'static str, path: PathBuf },

    #[error("structure generator failed: {0}")]
    Generator(String),

    #[error("generator produced candidates but its counter stayed at generation {0}")]
    GenerationStalled(Generation),

    #[error("generator produced candidates but wrote no generation counter")]
    MissingGenerationCounter,

    #[error("acceleration stalled in step {step}; batch job {job_id} cancelled for rescheduling")]
    JobAbandoned { step: StepIndex, job_id: BatchJobId },

    #[error("environment variable {0} is not set")]
    MissingEnv(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("malformed state file {}: {message}", path.display())]
    State { path: PathBuf, message: String },

    #[error("generation {generation} still incomplete after {attempts} submissions")]
    RetryLimit { generation: Generation, attempts: u32 },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),

    #[error(transparent)]
    Walk(#[from] walkdir::Error),
}

impl RunnerError {
    pub fn missing(what: &'static str, path: impl Into<PathBuf>) -> Self {
        RunnerError::MissingArtifact {
            what,
            path: path.into(),
        }
    }

    /// Scheduler faults the orchestrator rides out by polling again.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            RunnerError::Submission(_) | RunnerError::Query { .. }
        )
    }
}
