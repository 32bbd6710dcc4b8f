mod logging;

use anyhow::{bail, Context, Result};
use calvasp_runner::batch::SlurmClient;
use calvasp_runner::config::{SchedulerConfig, TaskConfig};
use calvasp_runner::control_file::{ControlFile, ControlValue};
use calvasp_runner::ids::numbered_entries;
use calvasp_runner::job::{self, TaskSummary};
use calvasp_runner::state::{
    load_batch_record, load_status, task_structures, StructureStatus, TaskPaths,
};
use calvasp_runner::{Generation, Orchestrator};
use clap::{ArgAction, Parser, Subcommand};
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use tracing::info;

#[derive(Parser)]
#[command(
    name = "calvasp",
    version = "0.3.0",
    about = "Structure search orchestration: generator, batch jobs, simulation step chains"
)]
struct Cli {
    /// Increase stderr verbosity (-v debug, -vv trace).
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,
    /// Only warnings and errors on stderr.
    #[arg(short, long, global = true)]
    quiet: bool,
    /// Also write a DEBUG log to this file.
    #[arg(long, global = true)]
    log_file: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the generation loop until the generator stops producing candidates.
    Schedule {
        /// YAML file with scheduler settings; flags override it.
        #[arg(long)]
        config: Option<PathBuf>,
        /// Simulation command run in every step directory.
        #[arg(long)]
        command: Option<String>,
        #[arg(long)]
        generator_exe: Option<PathBuf>,
        #[arg(long)]
        generator_workdir: Option<PathBuf>,
        #[arg(long)]
        tasks_dir: Option<PathBuf>,
        #[arg(long)]
        input_dir: Option<PathBuf>,
        #[arg(long)]
        batch_template: Option<PathBuf>,
        #[arg(long)]
        job_prefix: Option<String>,
        #[arg(long)]
        task_command: Option<String>,
        #[arg(long)]
        ml_train_until: Option<u32>,
        #[arg(long)]
        kspacing: Option<f64>,
        #[arg(long)]
        poll_seconds: Option<u64>,
        #[arg(long)]
        max_resubmissions: Option<u32>,
    },
    /// Process one task's structures; the entry point of the batch script.
    Task {
        #[arg(long, default_value = "./config.json")]
        config: PathBuf,
        #[arg(long)]
        json: bool,
    },
    /// Show per-structure status of one or all tasks.
    Status {
        #[arg(long, default_value = "./tasks")]
        tasks_dir: PathBuf,
        #[arg(long)]
        generation: Option<u32>,
        #[arg(long)]
        json: bool,
    },
    /// Read or edit a control file.
    Incar {
        #[command(subcommand)]
        action: IncarAction,
    },
}

#[derive(Subcommand)]
enum IncarAction {
    Get {
        file: PathBuf,
        key: String,
        #[arg(long)]
        json: bool,
    },
    Set {
        file: PathBuf,
        key: String,
        value: String,
    },
    Delete {
        file: PathBuf,
        key: String,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::setup_logging(cli.verbose, cli.quiet, cli.log_file.as_deref())?;
    let json_mode = command_json_mode(&cli.command);
    match run_command(cli.command) {
        Ok(Some(payload)) => {
            emit_json(&payload);
            Ok(())
        }
        Ok(None) => Ok(()),
        Err(err) => {
            if json_mode {
                emit_json(&json_error("command_failed", format!("{:#}", err)));
                std::process::exit(1);
            }
            Err(err)
        }
    }
}

fn run_command(command: Commands) -> Result<Option<Value>> {
    match command {
        Commands::Schedule {
            config,
            command,
            generator_exe,
            generator_workdir,
            tasks_dir,
            input_dir,
            batch_template,
            job_prefix,
            task_command,
            ml_train_until,
            kspacing,
            poll_seconds,
            max_resubmissions,
        } => {
            let mut settings = match &config {
                Some(path) => SchedulerConfig::from_yaml_file(path)?,
                None => SchedulerConfig::default(),
            };
            if command.is_some() {
                settings.simulation_command = command;
            }
            if generator_exe.is_some() {
                settings.generator_exe = generator_exe;
            }
            if batch_template.is_some() {
                settings.batch_template = batch_template;
            }
            if let Some(v) = generator_workdir {
                settings.generator_workdir = v;
            }
            if let Some(v) = tasks_dir {
                settings.tasks_dir = v;
            }
            if let Some(v) = input_dir {
                settings.input_dir = v;
            }
            if let Some(v) = job_prefix {
                settings.job_prefix = v;
            }
            if let Some(v) = task_command {
                settings.task_command = v;
            }
            if let Some(v) = poll_seconds {
                settings.poll_interval_seconds = v;
            }
            settings.ml_train_until = ml_train_until.or(settings.ml_train_until);
            settings.kspacing = kspacing.or(settings.kspacing);
            settings.max_resubmissions = max_resubmissions.or(settings.max_resubmissions);

            let ctx = settings.resolve().context("invalid scheduler configuration")?;
            let client =
                SlurmClient::new(ctx.scheduler.clone(), &ctx.batch_template, &ctx.task_command);
            Orchestrator::new(ctx, client).run()?;
            info!("search finished");
            Ok(None)
        }
        Commands::Task { config, json } => {
            let task = TaskConfig::load(&config)?;
            let client = SlurmClient::in_job(task.scheduler.clone());
            let summary = job::run_task(&task, &client)?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "task",
                    "generation": task.generation,
                    "summary": summary_to_json(&summary),
                })));
            }
            println!("generation: {}", task.generation);
            println!("succeeded: {}", summary.succeeded);
            println!("warned: {}", summary.warned);
            println!("failed: {}", summary.failed);
            println!("skipped: {}", summary.skipped);
            Ok(None)
        }
        Commands::Status {
            tasks_dir,
            generation,
            json,
        } => {
            let generations = match generation {
                Some(g) => vec![Generation(g)],
                None => numbered_entries(&tasks_dir, "task")?
                    .into_iter()
                    .filter(|(_, p)| p.is_dir())
                    .map(|(n, _)| Generation(n))
                    .collect(),
            };
            let mut tasks = Vec::new();
            for g in generations {
                tasks.push(task_status_json(&tasks_dir, g)?);
            }
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "status",
                    "tasks": tasks,
                })));
            }
            print_status(&tasks);
            Ok(None)
        }
        Commands::Incar { action } => run_incar(action),
    }
}

fn run_incar(action: IncarAction) -> Result<Option<Value>> {
    match action {
        IncarAction::Get { file, key, json } => {
            let control = ControlFile::open(&file)?;
            let value = control.get(&key)?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "incar-get",
                    "key": key,
                    "value": value.as_ref().map(control_value_to_json),
                })));
            }
            match value {
                Some(v) => println!("{}", v),
                None => bail!("{} is not set in {}", key, file.display()),
            }
            Ok(None)
        }
        IncarAction::Set { file, key, value } => {
            let control = ControlFile::open(&file)?;
            let parsed = ControlValue::parse(&value);
            control.set(&key, parsed.clone())?;
            println!("{} = {}", key, parsed);
            Ok(None)
        }
        IncarAction::Delete { file, key } => {
            let control = ControlFile::open(&file)?;
            let removed = control.delete(&key)?;
            println!("removed: {}", removed);
            Ok(None)
        }
    }
}

fn task_status_json(tasks_dir: &Path, generation: Generation) -> Result<Value> {
    let paths = TaskPaths::new(tasks_dir, generation);
    if !paths.exists() {
        bail!("no task for generation {} in {}", generation, tasks_dir.display());
    }
    let status = load_status(&paths.status())?;
    let batch = load_batch_record(&paths)?;
    let mut structures = Vec::new();
    for (id, _) in task_structures(&paths.structures_dir())? {
        let record = status.get(id);
        structures.push(json!({
            "structure": id,
            "status": record.map(|r| r.status).unwrap_or(StructureStatus::NotStarted),
            "timestamp": record.map(|r| r.timestamp.as_str()).unwrap_or(""),
            "warning": record.map(|r| r.warning.as_str()).unwrap_or(""),
            "error": record.map(|r| r.error.as_str()).unwrap_or(""),
        }));
    }
    Ok(json!({
        "generation": generation,
        "task_dir": paths.task_dir,
        "batch_job": batch.as_ref().map(|b| b.current_id.to_string()),
        "job_name": batch.as_ref().map(|b| b.job_name.clone()),
        "attempts": batch.as_ref().map(|b| b.attempts).unwrap_or(0),
        "structures": structures,
    }))
}

fn print_status(tasks: &[Value]) {
    for task in tasks {
        println!(
            "task_{}  batch_job: {}  attempts: {}",
            task["generation"],
            task["batch_job"].as_str().unwrap_or("none"),
            task["attempts"]
        );
        if let Some(structures) = task["structures"].as_array() {
            for s in structures {
                let note = [s["warning"].as_str(), s["error"].as_str()]
                    .into_iter()
                    .flatten()
                    .find(|t| !t.is_empty())
                    .unwrap_or("");
                println!(
                    "  POSCAR_{:<6} {:<12} {}",
                    s["structure"],
                    s["status"].as_str().unwrap_or("?"),
                    note
                );
            }
        }
    }
}

fn summary_to_json(summary: &TaskSummary) -> Value {
    json!({
        "succeeded": summary.succeeded,
        "warned": summary.warned,
        "failed": summary.failed,
        "skipped": summary.skipped,
    })
}

fn control_value_to_json(value: &ControlValue) -> Value {
    match value {
        ControlValue::Bool(b) => json!(b),
        ControlValue::Int(n) => json!(n),
        ControlValue::Float(x) => json!(x),
        ControlValue::Text(s) => json!(s),
    }
}

fn emit_json(value: &Value) {
    match serde_json::to_string(value) {
        Ok(s) => println!("{}", s),
        Err(_) => println!(
            "{{\"ok\":false,\"error\":{{\"code\":\"serialization_error\",\"message\":\"failed to serialize JSON payload\"}}}}"
        ),
    }
}

fn json_error(code: &str, message: String) -> Value {
    json!({
        "ok": false,
        "error": {
            "code": code,
            "message": message,
        }
    })
}

fn command_json_mode(command: &Commands) -> bool {
    match command {
        Commands::Task { json, .. } | Commands::Status { json, .. } => *json,
        Commands::Incar {
            action: IncarAction::Get { json, .. },
        } => *json,
        _ => false,
    }
}
