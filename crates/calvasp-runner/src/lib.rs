//! Generation/task/step orchestration for a structure-search loop driven by a
//! cluster batch scheduler.
//!
//! The orchestrator ([`orchestrator::Orchestrator`]) runs on a login node and
//! advances one generation at a time: it snapshots the generator's candidate
//! structures into a task, submits one batch job per task, resubmits while
//! the task is incomplete, collects outputs and reinvokes the generator. The
//! job runner ([`job::run_task`]) runs inside the batch job and walks each
//! structure through its ordered simulation steps, under the
//! [`watchdog::Watchdog`].

pub mod batch;
pub mod collect;
pub mod config;
pub mod control_file;
pub mod error;
pub mod fsutil;
pub mod generator;
pub mod ids;
pub mod job;
pub mod kpoints;
pub mod orchestrator;
pub mod state;
pub mod watchdog;

pub use batch::{BatchScheduler, JobState, SlurmClient};
pub use config::{RunContext, SchedulerConfig, TaskConfig, TrainingPhase};
pub use control_file::{ControlFile, ControlValue};
pub use error::{Result, RunnerError};
pub use ids::{BatchJobId, Generation, StepIndex, StructureId};
pub use orchestrator::Orchestrator;

/// Candidate structures: `POSCAR_<n>` in the generator workspace and task input set.
pub const STRUCTURE_PREFIX: &str = "POSCAR";
/// Staged per-step control files: `INCAR_<n>` in the input directory.
pub const CONTROL_FILE_PREFIX: &str = "INCAR";
pub const GENERATOR_INPUT_FILE: &str = "input.dat";
pub const GENERATOR_COUNTER_FILE: &str = "step";
pub const POTENTIAL_FILE: &str = "POTCAR";
pub const KPOINTS_FILE: &str = "KPOINTS";

pub const TASK_CONFIG_FILE: &str = "config.json";
pub const TASK_STATUS_FILE: &str = "status.json";
pub const BATCH_RECORD_FILE: &str = "slurm.json";
pub const COLLECTION_MANIFEST_FILE: &str = "collected.json";
pub const TASK_STRUCTURES_DIR: &str = "poscars";

pub const ORIGINAL_STRUCTURE_FILE: &str = "POSCAR_ORIGINAL";
pub const STEP_CONTROL_FILE: &str = "INCAR";
pub const STEP_STRUCTURE_FILE: &str = "POSCAR";
pub const FINAL_STRUCTURE_FILE: &str = "CONTCAR";
pub const COMPLETION_FILE: &str = "OUTCAR";
/// Dropped in a step directory once the watchdog disabled acceleration there.
pub const FALLBACK_SENTINEL: &str = ".acceleration_disabled";

pub const ML_STORE_DIR: &str = "ml_store";
/// Training data consumed by a step / produced by a step.
pub const ML_DATA_IN: &str = "ML_AB";
pub const ML_DATA_OUT: &str = "ML_ABN";
/// Fitted force field consumed by a step / produced by a step.
pub const ML_FIELD_IN: &str = "ML_FF";
pub const ML_FIELD_OUT: &str = "ML_FFN";
