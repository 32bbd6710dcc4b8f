//! Configuration schema for the orchestrator and for the per-task job runner.
//!
//! `SchedulerConfig` is what an operator writes (YAML, every field
//! defaulted). `RunContext` is the validated form built once at startup and
//! handed to every component. `TaskConfig` is persisted as `config.json`
//! inside each task directory and read back by the job runner inside the
//! batch job.

use crate::error::{Result, RunnerError};
use crate::ids::{numbered_entries, Generation};
use crate::{CONTROL_FILE_PREFIX, GENERATOR_INPUT_FILE, POTENTIAL_FILE};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_POLL_SECONDS: u64 = 300;
pub const DEFAULT_STARTUP_TIMEOUT_MS: u64 = 300_000;
pub const DEFAULT_WATCHDOG_POLL_MS: u64 = 5_000;

/// Machine-learned force field mode a task runs its steps in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrainingPhase {
    #[default]
    None,
    Train,
    Refit,
    Predict,
}

impl TrainingPhase {
    /// Value written to the mode key of the control file.
    pub fn mode_value(&self) -> Option<&'static str> {
        match self {
            TrainingPhase::None => None,
            TrainingPhase::Train => Some("train"),
            TrainingPhase::Refit => Some("refit"),
            TrainingPhase::Predict => Some("run"),
        }
    }
}

/// Generations before `train_until` train, generation `train_until` refits,
/// later generations predict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MlSchedule {
    pub train_until: u32,
}

impl MlSchedule {
    pub fn phase_for(&self, generation: Generation) -> TrainingPhase {
        match generation.0.cmp(&self.train_until) {
            std::cmp::Ordering::Less => TrainingPhase::Train,
            std::cmp::Ordering::Equal => TrainingPhase::Refit,
            std::cmp::Ordering::Greater => TrainingPhase::Predict,
        }
    }
}

/// Watchdog settings for the optional acceleration feature of a step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AccelerationSettings {
    /// Boolean key that switches the feature on.
    pub enable_key: String,
    /// Key carrying the train / refit / run mode.
    pub mode_key: String,
    /// Output line fragment printed once the feature is up.
    pub ready_marker: String,
    pub startup_timeout_ms: u64,
    pub poll_interval_ms: u64,
    /// Environment variable the scheduler sets to the running job's id.
    pub job_id_env: String,
}

impl Default for AccelerationSettings {
    fn default() -> Self {
        Self {
            enable_key: "ML_LMLFF".to_string(),
            mode_key: "ML_MODE".to_string(),
            ready_marker: "ML_LMLFF".to_string(),
            startup_timeout_ms: DEFAULT_STARTUP_TIMEOUT_MS,
            poll_interval_ms: DEFAULT_WATCHDOG_POLL_MS,
            job_id_env: "SLURM_JOB_ID".to_string(),
        }
    }
}

impl AccelerationSettings {
    pub fn startup_timeout(&self) -> Duration {
        Duration::from_millis(self.startup_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    /// Keys removed from a control file when the feature is disabled.
    pub fn keys(&self) -> [&str; 2] {
        [self.enable_key.as_str(), self.mode_key.as_str()]
    }
}

/// Program names of the batch scheduler's submit, query and cancel commands.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerCommands {
    pub submit: String,
    pub query: String,
    pub cancel: String,
}

impl Default for SchedulerCommands {
    fn default() -> Self {
        Self {
            submit: "sbatch".to_string(),
            query: "scontrol".to_string(),
            cancel: "scancel".to_string(),
        }
    }
}

/// Operator-facing configuration, loaded from YAML and patched by CLI flags.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub simulation_command: Option<String>,
    pub generator_exe: Option<PathBuf>,
    pub generator_workdir: PathBuf,
    pub tasks_dir: PathBuf,
    pub input_dir: PathBuf,
    pub batch_template: Option<PathBuf>,
    pub job_prefix: String,
    pub ml_train_until: Option<u32>,
    pub kspacing: Option<f64>,
    pub poll_interval_seconds: u64,
    pub max_resubmissions: Option<u32>,
    /// Command the batch script runs for a task; `--config <path>` is appended.
    pub task_command: String,
    pub acceleration: AccelerationSettings,
    pub scheduler: SchedulerCommands,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            simulation_command: None,
            generator_exe: None,
            generator_workdir: PathBuf::from("./calypso"),
            tasks_dir: PathBuf::from("./tasks"),
            input_dir: PathBuf::from("./input"),
            batch_template: None,
            job_prefix: "cal".to_string(),
            ml_train_until: None,
            kspacing: None,
            poll_interval_seconds: DEFAULT_POLL_SECONDS,
            max_resubmissions: None,
            task_command: "calvasp task".to_string(),
            acceleration: AccelerationSettings::default(),
            scheduler: SchedulerCommands::default(),
        }
    }
}

fn absolute(path: &Path, what: &'static str) -> Result<PathBuf> {
    fs::canonicalize(path).map_err(|_| RunnerError::missing(what, path))
}

impl SchedulerConfig {
    pub fn from_yaml_file(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .map_err(|e| RunnerError::Config(format!("cannot read {}: {}", path.display(), e)))?;
        let config: SchedulerConfig = serde_yaml::from_str(&raw)?;
        Ok(config)
    }

    /// Checks every path and required field once and produces the context
    /// all components share.
    pub fn resolve(self) -> Result<RunContext> {
        let simulation_command = self
            .simulation_command
            .filter(|c| !c.trim().is_empty())
            .ok_or_else(|| {
                RunnerError::Config("missing required field: simulation_command".into())
            })?;
        let generator_exe = self
            .generator_exe
            .ok_or_else(|| RunnerError::Config("missing required field: generator_exe".into()))?;
        let batch_template = self
            .batch_template
            .ok_or_else(|| RunnerError::Config("missing required field: batch_template".into()))?;

        let generator_exe = absolute(&generator_exe, "generator executable")?;
        if !generator_exe.is_file() {
            return Err(RunnerError::missing("generator executable", generator_exe));
        }
        let generator_workdir = absolute(&self.generator_workdir, "generator workdir")?;
        let generator_input = generator_workdir.join(GENERATOR_INPUT_FILE);
        if !generator_input.is_file() {
            return Err(RunnerError::missing("generator input file", generator_input));
        }

        let input_dir = absolute(&self.input_dir, "input directory")?;
        let potential = input_dir.join(POTENTIAL_FILE);
        if !potential.is_file() {
            return Err(RunnerError::missing("potential file", potential));
        }
        if numbered_entries(&input_dir, CONTROL_FILE_PREFIX)?.is_empty() {
            return Err(RunnerError::missing(
                "staged control files (INCAR_<n>)",
                input_dir.join(format!("{}_*", CONTROL_FILE_PREFIX)),
            ));
        }

        let batch_template = absolute(&batch_template, "batch template")?;
        if !batch_template.is_file() {
            return Err(RunnerError::missing("batch template", batch_template));
        }

        if let Some(k) = self.kspacing {
            if !(k.is_finite() && k > 0.0) {
                return Err(RunnerError::Config(format!("kspacing must be positive, got {}", k)));
            }
        }

        fs::create_dir_all(&self.tasks_dir)?;
        let tasks_dir = absolute(&self.tasks_dir, "tasks directory")?;
        let ml_store_dir = tasks_dir.join(crate::ML_STORE_DIR);

        Ok(RunContext {
            simulation_command,
            generator_exe,
            generator_workdir,
            tasks_dir,
            input_dir,
            batch_template,
            job_prefix: self.job_prefix,
            ml_schedule: self.ml_train_until.map(|train_until| MlSchedule { train_until }),
            kspacing: self.kspacing,
            poll_interval: Duration::from_secs(self.poll_interval_seconds),
            max_resubmissions: self.max_resubmissions,
            task_command: self.task_command,
            ml_store_dir,
            acceleration: self.acceleration,
            scheduler: self.scheduler,
        })
    }
}

/// Validated, absolute-path configuration shared by the orchestrator components.
#[derive(Debug, Clone)]
pub struct RunContext {
    pub simulation_command: String,
    pub generator_exe: PathBuf,
    pub generator_workdir: PathBuf,
    pub tasks_dir: PathBuf,
    pub input_dir: PathBuf,
    pub batch_template: PathBuf,
    pub job_prefix: String,
    pub ml_schedule: Option<MlSchedule>,
    pub kspacing: Option<f64>,
    pub poll_interval: Duration,
    pub max_resubmissions: Option<u32>,
    pub task_command: String,
    pub ml_store_dir: PathBuf,
    pub acceleration: AccelerationSettings,
    pub scheduler: SchedulerCommands,
}

impl RunContext {
    pub fn phase_for(&self, generation: Generation) -> TrainingPhase {
        self.ml_schedule
            .map(|s| s.phase_for(generation))
            .unwrap_or_default()
    }
}

fn default_job_prefix() -> String {
    "job_".to_string()
}

/// Persisted configuration of one task, read by the job runner.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskConfig {
    pub generation: Generation,
    pub input_dir: PathBuf,
    pub structures_dir: PathBuf,
    pub task_dir: PathBuf,
    pub simulation_command: String,
    pub status_file: PathBuf,
    #[serde(default = "default_job_prefix")]
    pub job_prefix: String,
    #[serde(default)]
    pub phase: TrainingPhase,
    #[serde(default)]
    pub ml_store_dir: Option<PathBuf>,
    #[serde(default)]
    pub kspacing: Option<f64>,
    #[serde(default)]
    pub acceleration: AccelerationSettings,
    #[serde(default)]
    pub scheduler: SchedulerCommands,
}

impl TaskConfig {
    pub fn load(path: &Path) -> Result<Self> {
        if !path.is_file() {
            return Err(RunnerError::missing("task config", path));
        }
        let bytes = fs::read(path)?;
        let config: TaskConfig = serde_json::from_slice(&bytes).map_err(|e| {
            RunnerError::Config(format!("{}: {}", path.display(), e))
        })?;
        if config.simulation_command.trim().is_empty() {
            return Err(RunnerError::Config(format!(
                "{}: simulation_command is empty",
                path.display()
            )));
        }
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ml_schedule_splits_train_refit_predict() {
        let s = MlSchedule { train_until: 3 };
        assert_eq!(s.phase_for(Generation(1)), TrainingPhase::Train);
        assert_eq!(s.phase_for(Generation(2)), TrainingPhase::Train);
        assert_eq!(s.phase_for(Generation(3)), TrainingPhase::Refit);
        assert_eq!(s.phase_for(Generation(4)), TrainingPhase::Predict);
    }

    #[test]
    fn yaml_config_fills_defaults() {
        let config: SchedulerConfig = serde_yaml::from_str(
            "simulation_command: mpirun vasp_std\nml_train_until: 4\nacceleration:\n  startup_timeout_ms: 1000\n",
        )
        .expect("parse");
        assert_eq!(config.simulation_command.as_deref(), Some("mpirun vasp_std"));
        assert_eq!(config.poll_interval_seconds, DEFAULT_POLL_SECONDS);
        assert_eq!(config.job_prefix, "cal");
        assert_eq!(config.acceleration.startup_timeout_ms, 1000);
        assert_eq!(config.acceleration.enable_key, "ML_LMLFF");
        assert_eq!(config.scheduler.submit, "sbatch");
    }

    #[test]
    fn resolve_names_missing_required_field() {
        let err = SchedulerConfig::default().resolve().expect_err("must fail");
        assert!(err.to_string().contains("simulation_command"), "{}", err);

        let config = SchedulerConfig {
            simulation_command: Some("vasp".into()),
            ..SchedulerConfig::default()
        };
        let err = config.resolve().expect_err("must fail");
        assert!(err.to_string().contains("generator_exe"), "{}", err);
    }

    #[test]
    fn resolve_checks_input_layout() {
        let root = tempfile::tempdir().expect("tempdir");
        let exe = root.path().join("calypso.x");
        fs::write(&exe, "").expect("exe");
        let workdir = root.path().join("calypso");
        fs::create_dir_all(&workdir).expect("workdir");
        fs::write(workdir.join(GENERATOR_INPUT_FILE), "").expect("input.dat");
        let input = root.path().join("input");
        fs::create_dir_all(&input).expect("input");
        fs::write(input.join(POTENTIAL_FILE), "").expect("potcar");
        let template = root.path().join("job.slurm");
        fs::write(&template, "#!/bin/sh\n$TASK_COMMAND\n").expect("template");

        let config = SchedulerConfig {
            simulation_command: Some("vasp".into()),
            generator_exe: Some(exe),
            generator_workdir: workdir,
            input_dir: input.clone(),
            tasks_dir: root.path().join("tasks"),
            batch_template: Some(template),
            ml_train_until: Some(2),
            ..SchedulerConfig::default()
        };
        let err = config.clone().resolve().expect_err("no INCAR_*");
        assert!(matches!(err, RunnerError::MissingArtifact { .. }), "{}", err);

        fs::write(input.join("INCAR_1"), "ENCUT = 400\n").expect("incar");
        let ctx = config.resolve().expect("resolves");
        assert!(ctx.tasks_dir.is_absolute());
        assert!(ctx.tasks_dir.is_dir());
        assert_eq!(ctx.phase_for(Generation(2)), TrainingPhase::Refit);
        assert_eq!(ctx.ml_store_dir, ctx.tasks_dir.join(crate::ML_STORE_DIR));
    }

    #[test]
    fn task_config_rejects_missing_field_by_name() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("config.json");
        fs::write(&path, r#"{"generation": 1, "input_dir": "/in"}"#).expect("write");
        let err = TaskConfig::load(&path).expect_err("incomplete");
        assert!(err.to_string().contains("structures_dir"), "{}", err);
    }

    #[test]
    fn task_config_defaults_optional_fields() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("config.json");
        fs::write(
            &path,
            r#"{"generation": 2, "input_dir": "/in", "structures_dir": "/t/poscars",
                "task_dir": "/t", "simulation_command": "vasp", "status_file": "/t/status.json"}"#,
        )
        .expect("write");
        let config = TaskConfig::load(&path).expect("load");
        assert_eq!(config.job_prefix, "job_");
        assert_eq!(config.phase, TrainingPhase::None);
        assert_eq!(config.acceleration, AccelerationSettings::default());
        assert_eq!(config.kspacing, None);
    }
}
