//! The job runner: executed inside the batch job for one task, it walks every
//! unfinished structure through its ordered simulation steps.

use crate::batch::BatchScheduler;
use crate::config::{TaskConfig, TrainingPhase};
use crate::control_file::ControlFile;
use crate::error::{Result, RunnerError};
use crate::fsutil::{copy_atomic, ensure_dir};
use crate::ids::{numbered_entries, StepIndex, StructureId};
use crate::kpoints;
use crate::state::{load_status, save_status, task_structures, StructureRecord, StructureStatus};
use crate::watchdog::{describe_status, sentinel_path, Supervision, Watchdog};
use chrono::Utc;
use std::path::{Path, PathBuf};
use tracing::{debug, error, info, warn};

/// Counts reported once a task run has visited every structure.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TaskSummary {
    pub succeeded: usize,
    pub warned: usize,
    pub failed: usize,
    pub skipped: usize,
}

/// Static inputs shared by every structure of a task.
struct StepInputs {
    control_files: Vec<(StepIndex, PathBuf)>,
    potential: PathBuf,
    kpoints: Option<PathBuf>,
}

impl StepInputs {
    fn discover(input_dir: &Path) -> Result<Self> {
        let control_files: Vec<_> = numbered_entries(input_dir, crate::CONTROL_FILE_PREFIX)?
            .into_iter()
            .filter(|(_, p)| p.is_file())
            .map(|(n, p)| (StepIndex(n), p))
            .collect();
        if control_files.is_empty() {
            return Err(RunnerError::missing(
                "staged control files",
                input_dir.join(format!("{}_*", crate::CONTROL_FILE_PREFIX)),
            ));
        }
        let potential = input_dir.join(crate::POTENTIAL_FILE);
        if !potential.is_file() {
            return Err(RunnerError::missing("potential file", potential));
        }
        let kpoints = Some(input_dir.join(crate::KPOINTS_FILE)).filter(|p| p.is_file());
        Ok(Self {
            control_files,
            potential,
            kpoints,
        })
    }
}

pub struct JobRunner<'a> {
    config: &'a TaskConfig,
    inputs: StepInputs,
    watchdog: Watchdog<'a>,
}

impl<'a> JobRunner<'a> {
    pub fn new(config: &'a TaskConfig, scheduler: &'a dyn BatchScheduler) -> Result<Self> {
        Ok(Self {
            config,
            inputs: StepInputs::discover(&config.input_dir)?,
            watchdog: Watchdog::new(&config.acceleration, scheduler),
        })
    }

    pub fn job_dir(&self, id: StructureId) -> PathBuf {
        self.config
            .task_dir
            .join(format!("{}{}", self.config.job_prefix, id))
    }

    /// Runs every step of one structure. Steps after a failing one are never
    /// created.
    pub fn run_structure(&self, id: StructureId, structure: &Path, job_dir: &Path) -> Result<()> {
        ensure_dir(job_dir)?;
        let original = job_dir.join(crate::ORIGINAL_STRUCTURE_FILE);
        copy_atomic(structure, &original)?;

        for (step, control_source) in &self.inputs.control_files {
            let step = *step;
            let step_dir = job_dir.join(step.dir_name());
            ensure_dir(&step_dir)?;
            info!(structure = %id, step = %step, dir = %step_dir.display(), "preparing step");

            let control_path = step_dir.join(crate::STEP_CONTROL_FILE);
            if sentinel_path(&step_dir).exists() && control_path.is_file() {
                info!(
                    structure = %id,
                    step = %step,
                    "acceleration was disabled here earlier; keeping control file"
                );
            } else {
                copy_atomic(control_source, &control_path)?;
                let control = ControlFile::open(&control_path)?;
                self.prepare_acceleration(step, &step_dir, &control)?;
            }
            let control = ControlFile::open(&control_path)?;

            copy_atomic(&self.inputs.potential, &step_dir.join(crate::POTENTIAL_FILE))?;

            let step_structure = step_dir.join(crate::STEP_STRUCTURE_FILE);
            match step.previous() {
                None => copy_atomic(&original, &step_structure)?,
                Some(prev) => {
                    let prev_final = job_dir
                        .join(prev.dir_name())
                        .join(crate::FINAL_STRUCTURE_FILE);
                    if !prev_final.is_file() {
                        return Err(RunnerError::missing(
                            "final structure of previous step",
                            prev_final,
                        ));
                    }
                    copy_atomic(&prev_final, &step_structure)?;
                }
            }

            if let Some(fixed) = &self.inputs.kpoints {
                copy_atomic(fixed, &step_dir.join(crate::KPOINTS_FILE))?;
            } else if let Some(kspacing) = self.config.kspacing {
                let mesh = kpoints::write_for_structure(&step_structure, &step_dir, kspacing)?;
                debug!(step = %step, ?mesh, "generated k-point mesh");
            }

            let log = step_dir.join(format!("vasp_step_{}.log", step));
            info!(
                structure = %id,
                step = %step,
                command = %self.config.simulation_command,
                "running step"
            );
            match self.watchdog.run_step(
                step,
                &self.config.simulation_command,
                &step_dir,
                &control,
                &log,
            )? {
                Supervision::Exited(status) if status.success() => {}
                Supervision::Exited(status) => {
                    return Err(RunnerError::Execution {
                        step,
                        status: describe_status(&status),
                        log,
                    })
                }
                Supervision::Abandoned(job_id) => {
                    return Err(RunnerError::JobAbandoned { step, job_id });
                }
            }

            let completion = step_dir.join(crate::COMPLETION_FILE);
            if !completion.is_file() {
                return Err(RunnerError::missing("completion artifact", completion));
            }
            info!(structure = %id, step = %step, "step finished");
            self.export_side_artifacts(step, &step_dir)?;
        }
        Ok(())
    }

    /// Switches the step to the task's training phase when the store holds
    /// what that phase needs. Steps that explicitly turn the feature off are
    /// reference steps and stay untouched.
    fn prepare_acceleration(
        &self,
        step: StepIndex,
        step_dir: &Path,
        control: &ControlFile,
    ) -> Result<()> {
        let phase = self.config.phase;
        let (Some(mode), Some(store)) = (phase.mode_value(), &self.config.ml_store_dir) else {
            return Ok(());
        };
        let settings = &self.config.acceleration;
        if control.get(&settings.enable_key)?.and_then(|v| v.as_bool()) == Some(false) {
            debug!(step = %step, "reference step; acceleration left off");
            return Ok(());
        }

        let stored = store.join(step.dir_name());
        let (artifact, required) = match phase {
            TrainingPhase::Train => (crate::ML_DATA_IN, false),
            TrainingPhase::Refit => (crate::ML_DATA_IN, true),
            TrainingPhase::Predict => (crate::ML_FIELD_IN, true),
            TrainingPhase::None => return Ok(()),
        };
        let source = stored.join(artifact);
        if source.is_file() {
            copy_atomic(&source, &step_dir.join(artifact))?;
            debug!(step = %step, artifact, "copied side-artifact from store");
        } else if required {
            warn!(
                step = %step,
                missing = %source.display(),
                "side-artifact unavailable; running step without acceleration"
            );
            return Ok(());
        }

        control.set(&settings.enable_key, true)?;
        control.set(&settings.mode_key, mode)?;
        Ok(())
    }

    fn export_side_artifacts(&self, step: StepIndex, step_dir: &Path) -> Result<()> {
        let Some(store) = &self.config.ml_store_dir else {
            return Ok(());
        };
        let target = store.join(step.dir_name());
        for (produced, stored) in [
            (crate::ML_DATA_OUT, crate::ML_DATA_IN),
            (crate::ML_FIELD_OUT, crate::ML_FIELD_IN),
        ] {
            let source = step_dir.join(produced);
            if source.is_file() {
                copy_atomic(&source, &target.join(stored))?;
                info!(step = %step, artifact = stored, "exported side-artifact");
            }
        }
        Ok(())
    }
}

/// Processes every structure of the task that is not yet a success,
/// persisting its record after each one.
pub fn run_task(config: &TaskConfig, scheduler: &dyn BatchScheduler) -> Result<TaskSummary> {
    let runner = JobRunner::new(config, scheduler)?;
    let structures = task_structures(&config.structures_dir)?;
    if structures.is_empty() {
        return Err(RunnerError::missing(
            "candidate structures",
            config.structures_dir.join(format!("{}_*", crate::STRUCTURE_PREFIX)),
        ));
    }
    ensure_dir(&config.task_dir)?;
    info!(
        generation = %config.generation,
        structures = structures.len(),
        steps = runner.inputs.control_files.len(),
        phase = ?config.phase,
        "task run started"
    );

    let mut status = load_status(&config.status_file)?;
    let mut summary = TaskSummary::default();
    for (id, structure) in structures {
        match status.get(id).map(|r| r.status) {
            Some(StructureStatus::Success) => {
                debug!(structure = %id, "already succeeded; skipping");
                summary.skipped += 1;
                continue;
            }
            Some(StructureStatus::Failed) => info!(structure = %id, "failed previously; retrying"),
            _ => {}
        }

        let job_dir = runner.job_dir(id);
        let mut record = StructureRecord::started(&job_dir);
        status.insert(id, record.clone());
        save_status(&config.status_file, &status)?;

        match runner.run_structure(id, &structure, &job_dir) {
            Ok(()) => {
                record.status = StructureStatus::Success;
                summary.succeeded += 1;
            }
            Err(e @ RunnerError::Execution { .. }) => {
                warn!(structure = %id, error = %e, "simulation failed; remaining steps skipped");
                record.status = StructureStatus::Success;
                record.warning = e.to_string();
                summary.warned += 1;
            }
            Err(e @ RunnerError::JobAbandoned { .. }) => {
                warn!(structure = %id, error = %e, "leaving task for resubmission");
                return Err(e);
            }
            Err(e) => {
                error!(structure = %id, error = %e, "structure failed");
                record.status = StructureStatus::Failed;
                record.error = e.to_string();
                summary.failed += 1;
            }
        }
        record.timestamp = Utc::now().to_rfc3339();
        status.insert(id, record);
        save_status(&config.status_file, &status)?;
        info!(structure = %id, "structure record saved");
    }

    info!(
        generation = %config.generation,
        succeeded = summary.succeeded,
        warned = summary.warned,
        failed = summary.failed,
        skipped = summary.skipped,
        "task run finished"
    );
    Ok(summary)
}
