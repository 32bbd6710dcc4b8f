//! Client for the cluster batch scheduler (Slurm command line).

use crate::config::SchedulerCommands;
use crate::error::{Result, RunnerError};
use crate::ids::BatchJobId;
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::Command;
use tracing::{debug, info};

/// Scheduler-reported state of a batch job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobState {
    Pending,
    Running,
    Configuring,
    Completing,
    Suspended,
    Requeued,
    Completed,
    Failed,
    Cancelled,
    Timeout,
    NodeFail,
    OutOfMemory,
    Preempted,
    /// The scheduler no longer knows the job.
    Unknown,
    Other(String),
}

impl JobState {
    pub fn parse(raw: &str) -> Self {
        match raw.trim() {
            "PENDING" => JobState::Pending,
            "RUNNING" => JobState::Running,
            "CONFIGURING" => JobState::Configuring,
            "COMPLETING" => JobState::Completing,
            "SUSPENDED" => JobState::Suspended,
            "REQUEUED" | "REQUEUE_HOLD" | "REQUEUE_FED" => JobState::Requeued,
            "COMPLETED" => JobState::Completed,
            "FAILED" => JobState::Failed,
            "CANCELLED" => JobState::Cancelled,
            "TIMEOUT" => JobState::Timeout,
            "NODE_FAIL" => JobState::NodeFail,
            "OUT_OF_MEMORY" => JobState::OutOfMemory,
            "PREEMPTED" => JobState::Preempted,
            "UNKNOWN" | "" => JobState::Unknown,
            other => JobState::Other(other.to_string()),
        }
    }

    /// True while the job may still touch the task's files.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            JobState::Pending
                | JobState::Running
                | JobState::Configuring
                | JobState::Completing
                | JobState::Suspended
                | JobState::Requeued
        )
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            JobState::Pending => "PENDING",
            JobState::Running => "RUNNING",
            JobState::Configuring => "CONFIGURING",
            JobState::Completing => "COMPLETING",
            JobState::Suspended => "SUSPENDED",
            JobState::Requeued => "REQUEUED",
            JobState::Completed => "COMPLETED",
            JobState::Failed => "FAILED",
            JobState::Cancelled => "CANCELLED",
            JobState::Timeout => "TIMEOUT",
            JobState::NodeFail => "NODE_FAIL",
            JobState::OutOfMemory => "OUT_OF_MEMORY",
            JobState::Preempted => "PREEMPTED",
            JobState::Unknown => "UNKNOWN",
            JobState::Other(s) => s.as_str(),
        };
        f.write_str(s)
    }
}

/// The operations the orchestrator and the watchdog need from a scheduler.
pub trait BatchScheduler {
    /// Submits the task in `task_dir` under `job_name`.
    fn submit(&self, task_dir: &Path, job_name: &str) -> Result<BatchJobId>;
    fn query_state(&self, job_id: BatchJobId) -> Result<JobState>;
    fn cancel(&self, job_id: BatchJobId) -> Result<()>;
}

/// Substitutes `$NAME` and `${NAME}` for the given variables. Unknown
/// placeholders and lone `$` are left untouched.
pub fn render_template(template: &str, vars: &BTreeMap<&str, String>) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(pos) = rest.find('$') {
        out.push_str(&rest[..pos]);
        let after = &rest[pos + 1..];
        let (name, consumed) = if let Some(braced) = after.strip_prefix('{') {
            match braced.find('}') {
                Some(end) => (&braced[..end], end + 2),
                None => ("", 0),
            }
        } else {
            let end = after
                .find(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
                .unwrap_or(after.len());
            (&after[..end], end)
        };
        match vars.get(name) {
            Some(value) if !name.is_empty() => {
                out.push_str(value);
                rest = &after[consumed..];
            }
            _ => {
                out.push('$');
                rest = after;
            }
        }
    }
    out.push_str(rest);
    out
}

/// Extracts the job id from `Submitted batch job <id>`.
pub fn parse_submission_output(stdout: &str) -> Option<BatchJobId> {
    let parts: Vec<&str> = stdout.split_whitespace().collect();
    match parts.as_slice() {
        ["Submitted", "batch", "job", id, ..] => id.parse::<u64>().ok().map(BatchJobId),
        _ => None,
    }
}

/// Splits `KEY=VALUE` tokens of a job-detail listing.
pub fn parse_job_details(output: &str) -> BTreeMap<String, String> {
    output
        .split_whitespace()
        .filter_map(|token| token.split_once('='))
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

fn is_unknown_job_response(text: &str) -> bool {
    text.contains("Invalid job id specified") || text.contains("slurm_load_jobs error:")
}

/// Slurm command-line client.
#[derive(Debug, Clone)]
pub struct SlurmClient {
    commands: SchedulerCommands,
    template: Option<PathBuf>,
    task_command: String,
}

impl SlurmClient {
    /// Client able to submit jobs rendered from `template`.
    pub fn new(commands: SchedulerCommands, template: &Path, task_command: &str) -> Self {
        Self {
            commands,
            template: Some(template.to_path_buf()),
            task_command: task_command.to_string(),
        }
    }

    /// Client for use inside a running job, where only query and cancel apply.
    pub fn in_job(commands: SchedulerCommands) -> Self {
        Self {
            commands,
            template: None,
            task_command: String::new(),
        }
    }

    fn render_script(&self, task_dir: &Path) -> Result<String> {
        let template = self
            .template
            .as_ref()
            .ok_or_else(|| RunnerError::Submission("no batch template configured".into()))?;
        let raw = fs::read_to_string(template).map_err(|e| {
            RunnerError::Submission(format!("cannot read template {}: {}", template.display(), e))
        })?;
        let config_path = task_dir.join(crate::TASK_CONFIG_FILE);
        let mut vars = BTreeMap::new();
        vars.insert(
            "TASK_COMMAND",
            format!("{} --config {}", self.task_command, config_path.display()),
        );
        vars.insert("TASK_CONFIG", config_path.display().to_string());
        vars.insert("TASK_DIR", task_dir.display().to_string());
        Ok(render_template(&raw, &vars))
    }
}

impl BatchScheduler for SlurmClient {
    fn submit(&self, task_dir: &Path, job_name: &str) -> Result<BatchJobId> {
        let script = self.render_script(task_dir)?;
        // Removed when `script_file` drops, on every return path.
        let mut script_file = tempfile::Builder::new()
            .prefix("calvasp_")
            .suffix(".slurm")
            .tempfile()?;
        script_file.write_all(script.as_bytes())?;
        script_file.flush()?;
        debug!(script = %script_file.path().display(), "rendered batch script");

        let output = Command::new(&self.commands.submit)
            .arg(format!("--job-name={}", job_name))
            .arg(script_file.path())
            .current_dir(task_dir)
            .output()
            .map_err(|e| {
                RunnerError::Submission(format!("cannot run {}: {}", self.commands.submit, e))
            })?;
        let stdout = String::from_utf8_lossy(&output.stdout);
        if !output.status.success() {
            return Err(RunnerError::Submission(format!(
                "{} exited with {}: {}",
                self.commands.submit,
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        let job_id = parse_submission_output(&stdout).ok_or_else(|| {
            RunnerError::Submission(format!("unexpected submit output: {}", stdout.trim()))
        })?;
        info!(job_id = %job_id, job_name, "batch job submitted");
        Ok(job_id)
    }

    fn query_state(&self, job_id: BatchJobId) -> Result<JobState> {
        let output = Command::new(&self.commands.query)
            .args(["show", "job"])
            .arg(job_id.to_string())
            .output()
            .map_err(|e| RunnerError::Query {
                job_id,
                message: format!("cannot run {}: {}", self.commands.query, e),
            })?;
        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        if is_unknown_job_response(&stdout) || is_unknown_job_response(&stderr) {
            return Ok(JobState::Unknown);
        }
        if !output.status.success() {
            return Err(RunnerError::Query {
                job_id,
                message: stderr.trim().to_string(),
            });
        }
        let details = parse_job_details(&stdout);
        Ok(details
            .get("JobState")
            .map(|s| JobState::parse(s))
            .unwrap_or(JobState::Unknown))
    }

    fn cancel(&self, job_id: BatchJobId) -> Result<()> {
        let output = Command::new(&self.commands.cancel)
            .arg(job_id.to_string())
            .output()
            .map_err(|e| RunnerError::Cancel {
                job_id,
                message: format!("cannot run {}: {}", self.commands.cancel, e),
            })?;
        if !output.status.success() {
            return Err(RunnerError::Cancel {
                job_id,
                message: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        info!(job_id = %job_id, "batch job cancel requested");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn template_substitutes_known_names_only() {
        let mut vars = BTreeMap::new();
        vars.insert("TASK_COMMAND", "calvasp task --config /t/config.json".to_string());
        let rendered = render_template(
            "#SBATCH -N 1\necho $HOME ${TASK_COMMAND}\n$TASK_COMMAND\ncost $5 $\n",
            &vars,
        );
        assert_eq!(
            rendered,
            "#SBATCH -N 1\necho $HOME calvasp task --config /t/config.json\ncalvasp task --config /t/config.json\ncost $5 $\n"
        );
    }

    #[test]
    fn submission_output_parsing() {
        assert_eq!(
            parse_submission_output("Submitted batch job 4242\n"),
            Some(BatchJobId(4242))
        );
        assert_eq!(parse_submission_output("Submitted batch job abc"), None);
        assert_eq!(parse_submission_output("sbatch: error: invalid partition"), None);
    }

    #[test]
    fn job_details_yield_state() {
        let out = "JobId=17 JobName=cal_3\n   UserId=me(1) JobState=RUNNING Reason=None\n";
        let details = parse_job_details(out);
        assert_eq!(details.get("JobState").map(String::as_str), Some("RUNNING"));
        assert_eq!(JobState::parse("RUNNING"), JobState::Running);
        assert_eq!(JobState::parse("BOOT_FAIL"), JobState::Other("BOOT_FAIL".into()));
    }

    #[test]
    fn only_live_states_are_active() {
        assert!(JobState::Pending.is_active());
        assert!(JobState::Completing.is_active());
        assert!(!JobState::Completed.is_active());
        assert!(!JobState::Cancelled.is_active());
        assert!(!JobState::Unknown.is_active());
    }

    #[cfg(unix)]
    mod commands {
        use super::*;
        use std::os::unix::fs::PermissionsExt;

        fn script(dir: &Path, name: &str, body: &str) -> String {
            let path = dir.join(name);
            fs::write(&path, format!("#!/bin/sh\n{}\n", body)).expect("write script");
            fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).expect("chmod");
            path.display().to_string()
        }

        fn client(dir: &Path, submit: &str, query: &str) -> SlurmClient {
            let template = dir.join("template.slurm");
            fs::write(&template, "#!/bin/sh\n$TASK_COMMAND\n").expect("template");
            let commands = SchedulerCommands {
                submit: script(dir, "fake_sbatch", submit),
                query: script(dir, "fake_scontrol", query),
                cancel: script(dir, "fake_scancel", "echo \"$1\" >> cancelled.txt"),
            };
            SlurmClient::new(commands, &template, "calvasp task")
        }

        #[test]
        fn submit_parses_id_and_removes_script() {
            let dir = tempfile::tempdir().expect("tempdir");
            let task_dir = dir.path().join("task_1");
            fs::create_dir_all(&task_dir).expect("task dir");
            let record = dir.path().join("args.txt");
            let c = client(
                dir.path(),
                &format!(
                    "echo \"$1 $2\" > {}\ncat \"$2\" >> {}\necho 'Submitted batch job 77'",
                    record.display(),
                    record.display()
                ),
                "true",
            );
            let id = c.submit(&task_dir, "cal_1").expect("submit");
            assert_eq!(id, BatchJobId(77));

            let recorded = fs::read_to_string(&record).expect("record");
            let first = recorded.lines().next().expect("first line");
            assert!(first.starts_with("--job-name=cal_1 "), "{}", first);
            let script_path = first.split_whitespace().nth(1).expect("script path");
            assert!(!Path::new(script_path).exists(), "temporary script must be removed");
            assert!(recorded.contains("calvasp task --config"));
            assert!(recorded.contains("task_1/config.json"));
        }

        #[test]
        fn submit_failures_are_submission_errors() {
            let dir = tempfile::tempdir().expect("tempdir");
            let c = client(dir.path(), "echo 'queue full' >&2; exit 1", "true");
            let err = c.submit(dir.path(), "x").expect_err("non-zero exit");
            assert!(matches!(err, RunnerError::Submission(_)));

            let c = client(dir.path(), "echo 'all good'", "true");
            let err = c.submit(dir.path(), "x").expect_err("no ack");
            assert!(matches!(err, RunnerError::Submission(_)));
        }

        #[test]
        fn query_maps_invalid_id_to_unknown() {
            let dir = tempfile::tempdir().expect("tempdir");
            let c = client(
                dir.path(),
                "true",
                "echo 'slurm_load_jobs error: Invalid job id specified' >&2; exit 1",
            );
            assert_eq!(c.query_state(BatchJobId(5)).expect("query"), JobState::Unknown);

            let c = client(dir.path(), "true", "echo \"JobId=$3 JobState=PENDING\"");
            assert_eq!(c.query_state(BatchJobId(5)).expect("query"), JobState::Pending);

            let c = client(dir.path(), "true", "echo 'connection refused' >&2; exit 1");
            let err = c.query_state(BatchJobId(5)).expect_err("query error");
            assert!(matches!(err, RunnerError::Query { .. }));
        }
    }
}
