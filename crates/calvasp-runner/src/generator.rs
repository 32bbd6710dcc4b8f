//! The external structure generator, observed through its counter file and
//! its numbered candidate files.

use crate::error::{Result, RunnerError};
use crate::ids::{numbered_entries, Generation, StructureId};
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use tracing::{debug, info};

#[derive(Debug, Clone)]
pub struct Generator {
    exe: PathBuf,
    workdir: PathBuf,
}

impl Generator {
    pub fn new(exe: impl Into<PathBuf>, workdir: impl Into<PathBuf>) -> Self {
        Self {
            exe: exe.into(),
            workdir: workdir.into(),
        }
    }

    pub fn workdir(&self) -> &Path {
        &self.workdir
    }

    pub fn counter_path(&self) -> PathBuf {
        self.workdir.join(crate::GENERATOR_COUNTER_FILE)
    }

    /// Generation currently awaiting evaluation; `None` before the first run.
    /// The counter holds the next generation to produce.
    pub fn generation(&self) -> Result<Option<Generation>> {
        let path = self.counter_path();
        if !path.is_file() {
            return Ok(None);
        }
        let raw = fs::read_to_string(&path)?;
        let value: u32 = raw.trim().parse().map_err(|_| RunnerError::State {
            path: path.clone(),
            message: format!("counter is not an integer: '{}'", raw.trim()),
        })?;
        let generation = value.checked_sub(1).ok_or_else(|| RunnerError::State {
            path,
            message: "counter must be at least 1".to_string(),
        })?;
        Ok(Some(Generation(generation)))
    }

    /// Candidate structures currently in the workspace, ascending by id.
    pub fn candidates(&self) -> Result<Vec<(StructureId, PathBuf)>> {
        Ok(numbered_entries(&self.workdir, crate::STRUCTURE_PREFIX)?
            .into_iter()
            .filter(|(_, p)| p.is_file())
            .map(|(n, p)| (StructureId(n), p))
            .collect())
    }

    /// Runs the generator to completion in its workspace.
    pub fn run(&self) -> Result<()> {
        info!(
            exe = %self.exe.display(),
            workdir = %self.workdir.display(),
            "running structure generator"
        );
        let output = Command::new(&self.exe)
            .current_dir(&self.workdir)
            .output()
            .map_err(|e| {
                RunnerError::Generator(format!("cannot start {}: {}", self.exe.display(), e))
            })?;
        debug!(stdout_bytes = output.stdout.len(), "generator finished");
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(RunnerError::Generator(format!(
                "{} exited with {}: {}",
                self.exe.display(),
                output.status,
                stderr.trim()
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counter_maps_to_previous_generation() {
        let dir = tempfile::tempdir().expect("tempdir");
        let g = Generator::new("/bin/true", dir.path());
        assert_eq!(g.generation().expect("absent"), None);
        fs::write(g.counter_path(), "4\n").expect("counter");
        assert_eq!(g.generation().expect("read"), Some(Generation(3)));
        fs::write(g.counter_path(), "0").expect("counter");
        assert!(g.generation().is_err());
        fs::write(g.counter_path(), "four").expect("counter");
        assert!(matches!(g.generation(), Err(RunnerError::State { .. })));
    }

    #[test]
    fn candidates_sort_numerically() {
        let dir = tempfile::tempdir().expect("tempdir");
        for name in ["POSCAR_10", "POSCAR_2", "POSCAR_ORIGINAL", "CONTCAR_1"] {
            fs::write(dir.path().join(name), "").expect("write");
        }
        let g = Generator::new("/bin/true", dir.path());
        let ids: Vec<_> = g.candidates().expect("list").into_iter().map(|(id, _)| id).collect();
        assert_eq!(ids, vec![StructureId(2), StructureId(10)]);
    }

    #[cfg(unix)]
    #[test]
    fn non_zero_exit_is_a_generator_error() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().expect("tempdir");
        let exe = dir.path().join("gen.sh");
        fs::write(&exe, "#!/bin/sh\necho 'bad input.dat' >&2\nexit 2\n").expect("script");
        fs::set_permissions(&exe, fs::Permissions::from_mode(0o755)).expect("chmod");
        let err = Generator::new(&exe, dir.path()).run().expect_err("fails");
        assert!(
            matches!(err, RunnerError::Generator(ref m) if m.contains("bad input.dat")),
            "{}",
            err
        );
    }
}
