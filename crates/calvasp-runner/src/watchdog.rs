//! Supervision of one simulation step and fallback for a stalled
//! acceleration feature.
//!
//! With the feature enabled, a reader thread copies the child's merged
//! output into the step log and reports the ready marker over a channel.
//! The supervising loop waits on that channel in short slices, checking for
//! child exit in between. If the startup deadline passes without the
//! marker, the feature keys are removed from the control file, a sentinel
//! is dropped in the step directory and the enclosing batch job is
//! cancelled so the orchestrator resubmits it.

use crate::batch::BatchScheduler;
use crate::config::AccelerationSettings;
use crate::control_file::ControlFile;
use crate::error::{Result, RunnerError};
use crate::ids::{BatchJobId, StepIndex};
use chrono::Utc;
use std::fs::{self, File};
use std::io::{self, BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdout, Command, ExitStatus, Stdio};
use std::sync::mpsc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// How a supervised step ended.
#[derive(Debug)]
pub enum Supervision {
    Exited(ExitStatus),
    /// The batch job was cancelled after the feature failed to start.
    Abandoned(BatchJobId),
}

enum OutputEvent {
    Marker,
    Closed,
}

/// Describes an exit status for logs and error messages.
pub fn describe_status(status: &ExitStatus) -> String {
    match status.code() {
        Some(code) => format!("exit code {}", code),
        None => "termination by signal".to_string(),
    }
}

/// True when the control file switches the acceleration feature on.
pub fn acceleration_enabled(
    control: &ControlFile,
    settings: &AccelerationSettings,
) -> Result<bool> {
    Ok(control
        .get(&settings.enable_key)?
        .and_then(|v| v.as_bool())
        .unwrap_or(false))
}

pub fn sentinel_path(step_dir: &Path) -> PathBuf {
    step_dir.join(crate::FALLBACK_SENTINEL)
}

fn shell_command(command: &str, workdir: &Path) -> Command {
    let mut cmd = Command::new("sh");
    // Merge stderr into stdout for everything the command runs.
    cmd.arg("-c").arg(format!("exec 2>&1\n{}", command));
    cmd.current_dir(workdir);
    cmd.stdin(Stdio::null());
    cmd
}

fn pump_output(
    stdout: ChildStdout,
    log: File,
    marker: String,
    tx: mpsc::Sender<OutputEvent>,
) -> io::Result<()> {
    let mut reader = BufReader::new(stdout);
    let mut writer = BufWriter::new(log);
    let mut seen = false;
    let mut line = Vec::new();
    loop {
        line.clear();
        if reader.read_until(b'\n', &mut line)? == 0 {
            break;
        }
        writer.write_all(&line)?;
        if !seen && String::from_utf8_lossy(&line).contains(&marker) {
            seen = true;
            writer.flush()?;
            let _ = tx.send(OutputEvent::Marker);
        }
    }
    writer.flush()?;
    let _ = tx.send(OutputEvent::Closed);
    Ok(())
}

/// Longest wait for the output reader after its process group was killed.
const LOG_DRAIN_GRACE: Duration = Duration::from_secs(5);

/// True when a ready marker is already queued on the channel.
fn marker_queued(rx: &mpsc::Receiver<OutputEvent>) -> bool {
    rx.try_iter().any(|event| matches!(event, OutputEvent::Marker))
}

/// Sends SIGKILL to every process in the group led by `pid`.
#[cfg(unix)]
fn kill_process_group(pid: u32) {
    let outcome = Command::new("kill")
        .args(["-s", "KILL", "--", &format!("-{}", pid)])
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status();
    if let Err(e) = outcome {
        warn!(pid, error = %e, "could not signal step process group");
    }
}

/// A running child, leader of its own process group, and the thread
/// draining its output. Dropping it kills the group if the child is still
/// running; the reader ends once the pipe closes.
struct SupervisedChild {
    child: Child,
    pump: Option<JoinHandle<io::Result<()>>>,
    reaped: bool,
}

impl SupervisedChild {
    fn try_wait(&mut self) -> Result<Option<ExitStatus>> {
        let status = self.child.try_wait()?;
        if status.is_some() {
            self.reaped = true;
        }
        Ok(status)
    }

    fn wait(&mut self) -> Result<ExitStatus> {
        let status = self.child.wait()?;
        self.reaped = true;
        Ok(status)
    }

    fn kill(&mut self) -> Result<()> {
        if !self.reaped {
            #[cfg(unix)]
            kill_process_group(self.child.id());
            let _ = self.child.kill();
            self.child.wait()?;
            self.reaped = true;
        }
        Ok(())
    }

    fn finish_log(&mut self) -> Result<()> {
        if let Some(handle) = self.pump.take() {
            match handle.join() {
                Ok(res) => res?,
                Err(_) => warn!("step output reader panicked"),
            }
        }
        Ok(())
    }

    /// Joins the reader once the pipe has closed. A reader still blocked
    /// after `grace` is detached.
    fn finish_log_within(
        &mut self,
        rx: &mpsc::Receiver<OutputEvent>,
        grace: Duration,
    ) -> Result<()> {
        let deadline = Instant::now() + grace;
        loop {
            let now = Instant::now();
            if now >= deadline {
                warn!("step output still open after kill; not waiting for it");
                self.pump = None;
                return Ok(());
            }
            match rx.recv_timeout(deadline - now) {
                Ok(OutputEvent::Marker) => {}
                Ok(OutputEvent::Closed) | Err(mpsc::RecvTimeoutError::Disconnected) => {
                    return self.finish_log();
                }
                Err(mpsc::RecvTimeoutError::Timeout) => {}
            }
        }
    }
}

impl Drop for SupervisedChild {
    fn drop(&mut self) {
        let _ = self.kill();
    }
}

pub struct Watchdog<'a> {
    settings: &'a AccelerationSettings,
    scheduler: &'a dyn BatchScheduler,
}

impl<'a> Watchdog<'a> {
    pub fn new(settings: &'a AccelerationSettings, scheduler: &'a dyn BatchScheduler) -> Self {
        Self {
            settings,
            scheduler,
        }
    }

    /// Runs `command` in `step_dir`, logging its merged output to `log_path`.
    pub fn run_step(
        &self,
        step: StepIndex,
        command: &str,
        step_dir: &Path,
        control: &ControlFile,
        log_path: &Path,
    ) -> Result<Supervision> {
        let log = File::create(log_path)?;
        let mut cmd = shell_command(command, step_dir);

        if !acceleration_enabled(control, self.settings)? {
            debug!(step = %step, "acceleration off; running unsupervised");
            cmd.stdout(Stdio::from(log));
            let status = cmd.spawn()?.wait()?;
            return Ok(Supervision::Exited(status));
        }

        cmd.stdout(Stdio::piped());
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            cmd.process_group(0);
        }
        let mut child = cmd.spawn()?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "child stdout not captured"))?;
        let (tx, rx) = mpsc::channel();
        let marker = self.settings.ready_marker.clone();
        let pump = thread::spawn(move || pump_output(stdout, log, marker, tx));
        let mut supervised = SupervisedChild {
            child,
            pump: Some(pump),
            reaped: false,
        };

        let poll = self.settings.poll_interval();
        let deadline = Instant::now() + self.settings.startup_timeout();
        let mut marker_seen = false;
        loop {
            if let Some(status) = supervised.try_wait()? {
                supervised.finish_log()?;
                return Ok(Supervision::Exited(status));
            }
            if marker_seen {
                let status = supervised.wait()?;
                supervised.finish_log()?;
                return Ok(Supervision::Exited(status));
            }
            let now = Instant::now();
            if now >= deadline {
                if marker_queued(&rx) {
                    info!(step = %step, "acceleration feature came up");
                    marker_seen = true;
                    continue;
                }
                break;
            }
            let slice = poll.min(deadline - now);
            match rx.recv_timeout(slice) {
                Ok(OutputEvent::Marker) => {
                    info!(step = %step, "acceleration feature came up");
                    marker_seen = true;
                }
                Ok(OutputEvent::Closed) | Err(mpsc::RecvTimeoutError::Timeout) => {}
                Err(mpsc::RecvTimeoutError::Disconnected) => thread::sleep(slice),
            }
        }

        warn!(
            step = %step,
            timeout_ms = self.settings.startup_timeout_ms,
            "acceleration feature did not come up; disabling it for this step"
        );
        self.disable_feature(control, step_dir)?;
        supervised.kill()?;
        let job_id = self.own_job_id()?;
        self.scheduler.cancel(job_id)?;
        info!(step = %step, job_id = %job_id, "cancelled batch job for resubmission");
        supervised.finish_log_within(&rx, LOG_DRAIN_GRACE)?;
        Ok(Supervision::Abandoned(job_id))
    }

    fn disable_feature(&self, control: &ControlFile, step_dir: &Path) -> Result<()> {
        for key in self.settings.keys() {
            control.delete(key)?;
        }
        fs::write(
            sentinel_path(step_dir),
            format!("acceleration disabled at {}\n", Utc::now().to_rfc3339()),
        )?;
        Ok(())
    }

    fn own_job_id(&self) -> Result<BatchJobId> {
        let raw = std::env::var(&self.settings.job_id_env)
            .map_err(|_| RunnerError::MissingEnv(self.settings.job_id_env.clone()))?;
        raw.parse()
    }
}
