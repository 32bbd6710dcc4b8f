//! Per-generation state machine, re-evaluated from disk and the scheduler on
//! every poll cycle.
//!
//! Nothing is cached between cycles: the generator's counter, the task
//! directory, the batch record and the status file are the only state, so a
//! restarted orchestrator picks up wherever the previous one stopped.

use crate::batch::{BatchScheduler, JobState};
use crate::collect::collect_outputs;
use crate::config::{RunContext, TaskConfig};
use crate::error::{Result, RunnerError};
use crate::fsutil::{copy_atomic, ensure_dir};
use crate::generator::Generator;
use crate::ids::{BatchJobId, Generation};
use crate::state::{
    load_batch_record, load_status, record_submission, save_task_config, task_structures,
    BatchRecord, TaskPaths,
};
use std::thread;
use tracing::{debug, info, warn};

/// Where the current generation stands.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskPhase {
    /// The generator has not run yet.
    Unstarted,
    NeedsTask(Generation),
    NeedsSubmission(Generation),
    InFlight {
        generation: Generation,
        job_id: BatchJobId,
        state: JobState,
    },
    /// The batch job is gone but some structure is not a success.
    Incomplete {
        generation: Generation,
        record: BatchRecord,
        state: JobState,
    },
    Complete(Generation),
}

/// What the loop does after a cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cycle {
    Immediate,
    Sleep,
    Finished,
}

pub struct Orchestrator<S: BatchScheduler> {
    ctx: RunContext,
    scheduler: S,
    generator: Generator,
}

impl<S: BatchScheduler> Orchestrator<S> {
    pub fn new(ctx: RunContext, scheduler: S) -> Self {
        let generator = Generator::new(&ctx.generator_exe, &ctx.generator_workdir);
        Self {
            ctx,
            scheduler,
            generator,
        }
    }

    pub fn context(&self) -> &RunContext {
        &self.ctx
    }

    pub fn scheduler(&self) -> &S {
        &self.scheduler
    }

    pub fn task_paths(&self, generation: Generation) -> TaskPaths {
        TaskPaths::new(&self.ctx.tasks_dir, generation)
    }

    pub fn assess(&self) -> Result<TaskPhase> {
        let Some(generation) = self.generator.generation()? else {
            return Ok(TaskPhase::Unstarted);
        };
        let paths = self.task_paths(generation);
        if !paths.exists() {
            return Ok(TaskPhase::NeedsTask(generation));
        }
        let Some(record) = load_batch_record(&paths)? else {
            return Ok(TaskPhase::NeedsSubmission(generation));
        };
        let state = self.scheduler.query_state(record.current_id)?;
        if state.is_active() {
            return Ok(TaskPhase::InFlight {
                generation,
                job_id: record.current_id,
                state,
            });
        }

        let structures = task_structures(&paths.structures_dir())?;
        let status = load_status(&paths.status())?;
        if !structures.is_empty() && status.is_complete(structures.iter().map(|(id, _)| id)) {
            Ok(TaskPhase::Complete(generation))
        } else {
            Ok(TaskPhase::Incomplete {
                generation,
                record,
                state,
            })
        }
    }

    /// Snapshots the generator's candidates into a new task. Does nothing if
    /// the task already exists; its config file is written last and marks it
    /// as created.
    pub fn create_task(&self, generation: Generation) -> Result<TaskPaths> {
        let paths = self.task_paths(generation);
        if paths.exists() {
            debug!(generation = %generation, "task already exists");
            return Ok(paths);
        }
        let candidates = self.generator.candidates()?;
        if candidates.is_empty() {
            return Err(RunnerError::missing(
                "candidate structures",
                self.generator
                    .workdir()
                    .join(format!("{}_*", crate::STRUCTURE_PREFIX)),
            ));
        }

        let structures_dir = paths.structures_dir();
        ensure_dir(&structures_dir)?;
        for (id, source) in &candidates {
            copy_atomic(source, &structures_dir.join(id.status_key()))?;
        }

        let phase = self.ctx.phase_for(generation);
        let config = TaskConfig {
            generation,
            input_dir: self.ctx.input_dir.clone(),
            structures_dir,
            task_dir: paths.task_dir.clone(),
            simulation_command: self.ctx.simulation_command.clone(),
            status_file: paths.status(),
            job_prefix: "job_".to_string(),
            phase,
            ml_store_dir: self.ctx.ml_schedule.map(|_| self.ctx.ml_store_dir.clone()),
            kspacing: self.ctx.kspacing,
            acceleration: self.ctx.acceleration.clone(),
            scheduler: self.ctx.scheduler.clone(),
        };
        save_task_config(&paths, &config)?;
        info!(
            generation = %generation,
            structures = candidates.len(),
            phase = ?phase,
            dir = %paths.task_dir.display(),
            "task created"
        );
        Ok(paths)
    }

    pub fn job_name(&self, generation: Generation, retry: bool) -> String {
        format!(
            "{}_{}{}",
            self.ctx.job_prefix,
            generation,
            if retry { "R" } else { "" }
        )
    }

    pub fn submit(&self, generation: Generation, retry: bool) -> Result<BatchRecord> {
        let paths = self.task_paths(generation);
        let job_name = self.job_name(generation, retry);
        let job_id = self.scheduler.submit(&paths.task_dir, &job_name)?;
        let record = record_submission(&paths, job_id, &job_name)?;
        info!(
            generation = %generation,
            job_id = %job_id,
            job_name = %job_name,
            attempt = record.attempts,
            "task submitted"
        );
        Ok(record)
    }

    /// Runs the generator and checks it moved on. `before` is the generation
    /// it was invoked for.
    pub fn advance_generator(&self, before: Option<Generation>) -> Result<Cycle> {
        self.generator.run()?;
        let candidates = self.generator.candidates()?;
        if candidates.is_empty() {
            info!("generator produced no candidates; search finished");
            return Ok(Cycle::Finished);
        }
        let after = self
            .generator
            .generation()?
            .ok_or(RunnerError::MissingGenerationCounter)?;
        if Some(after) == before {
            return Err(RunnerError::GenerationStalled(after));
        }
        info!(generation = %after, candidates = candidates.len(), "new generation ready");
        Ok(Cycle::Immediate)
    }

    /// One evaluation of the state machine.
    pub fn cycle(&self) -> Result<Cycle> {
        match self.assess()? {
            TaskPhase::Unstarted => {
                info!("no generation yet; starting the generator");
                self.advance_generator(None)
            }
            TaskPhase::NeedsTask(generation) => {
                if self.generator.candidates()?.is_empty() {
                    info!(generation = %generation, "no candidates left; search finished");
                    return Ok(Cycle::Finished);
                }
                self.create_task(generation)?;
                Ok(Cycle::Immediate)
            }
            TaskPhase::NeedsSubmission(generation) => {
                self.submit(generation, false)?;
                Ok(Cycle::Sleep)
            }
            TaskPhase::InFlight {
                generation,
                job_id,
                state,
            } => {
                info!(
                    generation = %generation,
                    job_id = %job_id,
                    state = %state,
                    "waiting on batch job"
                );
                Ok(Cycle::Sleep)
            }
            TaskPhase::Incomplete {
                generation,
                record,
                state,
            } => {
                let resubmissions = record.attempts.saturating_sub(1);
                if let Some(limit) = self.ctx.max_resubmissions {
                    if resubmissions >= limit {
                        return Err(RunnerError::RetryLimit {
                            generation,
                            attempts: record.attempts,
                        });
                    }
                }
                warn!(
                    generation = %generation,
                    job_id = %record.current_id,
                    state = %state,
                    "batch job ended with unfinished structures; resubmitting"
                );
                self.submit(generation, true)?;
                Ok(Cycle::Sleep)
            }
            TaskPhase::Complete(generation) => {
                let paths = self.task_paths(generation);
                let job_prefix = TaskConfig::load(&paths.config())?.job_prefix;
                collect_outputs(&paths, generation, &job_prefix, self.generator.workdir())?;
                self.advance_generator(Some(generation))
            }
        }
    }

    /// Drives cycles until the generator stops producing candidates or a
    /// non-recoverable error occurs.
    pub fn run(&self) -> Result<()> {
        info!(
            tasks_dir = %self.ctx.tasks_dir.display(),
            poll_seconds = self.ctx.poll_interval.as_secs(),
            "orchestrator started"
        );
        loop {
            match self.cycle() {
                Ok(Cycle::Immediate) => continue,
                Ok(Cycle::Sleep) => {}
                Ok(Cycle::Finished) => return Ok(()),
                Err(e) if e.is_recoverable() => {
                    warn!(error = %e, "scheduler fault; retrying next cycle");
                }
                Err(e) => return Err(e),
            }
            thread::sleep(self.ctx.poll_interval);
        }
    }
}
