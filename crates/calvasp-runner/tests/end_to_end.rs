#![cfg(unix)]

use calvasp_runner::batch::{BatchScheduler, JobState};
use calvasp_runner::config::{SchedulerConfig, TaskConfig};
use calvasp_runner::orchestrator::{Cycle, Orchestrator};
use calvasp_runner::state::{load_status, StructureStatus, TaskPaths};
use calvasp_runner::{job, BatchJobId, Generation, Result, StructureId};
use std::cell::RefCell;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

const GENERATOR: &str = r#"#!/bin/sh
n=$(cat step 2>/dev/null || echo 1)
if [ "$n" -ge 3 ]; then
    rm -f POSCAR_*
    exit 0
fi
for i in 1 2 3; do
    printf 'gen %s structure %s\n1.0\n4 0 0\n0 4 0\n0 0 4\nSi\n1\nDirect\n0 0 0\n' "$n" "$i" > POSCAR_$i
    if [ "$i" = 2 ] && [ -n "$MARK_BAD" ]; then echo bad >> POSCAR_$i; fi
done
echo $((n + 1)) > step
"#;

const RELAX: &str = "cp POSCAR CONTCAR; echo done > OUTCAR";

/// Runs the job runner synchronously on submit, as the batch job would.
struct InlineScheduler {
    run_jobs: bool,
    state: JobState,
    submissions: RefCell<Vec<String>>,
}

impl InlineScheduler {
    fn new(run_jobs: bool, state: JobState) -> Self {
        Self {
            run_jobs,
            state,
            submissions: RefCell::new(Vec::new()),
        }
    }
}

impl BatchScheduler for InlineScheduler {
    fn submit(&self, task_dir: &Path, job_name: &str) -> Result<BatchJobId> {
        self.submissions.borrow_mut().push(job_name.to_string());
        if self.run_jobs {
            let config = TaskConfig::load(&task_dir.join("config.json"))?;
            job::run_task(&config, self)?;
        }
        Ok(BatchJobId(self.submissions.borrow().len() as u64))
    }

    fn query_state(&self, _job_id: BatchJobId) -> Result<JobState> {
        Ok(self.state.clone())
    }

    fn cancel(&self, _job_id: BatchJobId) -> Result<()> {
        Ok(())
    }
}

struct Workspace {
    root: tempfile::TempDir,
}

impl Workspace {
    fn new(stages: &[&str], bad_structure: bool) -> Self {
        let root = tempfile::tempdir().expect("tempdir");
        let calypso = root.path().join("calypso");
        fs::create_dir_all(&calypso).expect("calypso");
        fs::write(calypso.join("input.dat"), "NumberOfSpecies = 1\n").expect("input.dat");
        let exe = root.path().join("calypso.x");
        let script = if bad_structure {
            GENERATOR.replacen("#!/bin/sh\n", "#!/bin/sh\nMARK_BAD=1\n", 1)
        } else {
            GENERATOR.to_string()
        };
        fs::write(&exe, script).expect("generator");
        fs::set_permissions(&exe, fs::Permissions::from_mode(0o755)).expect("chmod");

        let input = root.path().join("input");
        fs::create_dir_all(&input).expect("input");
        fs::write(input.join("POTCAR"), "potential\n").expect("potcar");
        for (i, stage) in stages.iter().enumerate() {
            fs::write(input.join(format!("INCAR_{}", i + 1)), stage).expect("incar");
        }
        fs::write(root.path().join("job.slurm"), "#!/bin/sh\n$TASK_COMMAND\n").expect("template");
        Self { root }
    }

    fn path(&self) -> &Path {
        self.root.path()
    }

    fn calypso(&self) -> PathBuf {
        self.path().join("calypso")
    }

    fn orchestrator(
        &self,
        command: &str,
        scheduler: InlineScheduler,
    ) -> Orchestrator<InlineScheduler> {
        let config = SchedulerConfig {
            simulation_command: Some(command.to_string()),
            generator_exe: Some(self.path().join("calypso.x")),
            generator_workdir: self.calypso(),
            tasks_dir: self.path().join("tasks"),
            input_dir: self.path().join("input"),
            batch_template: Some(self.path().join("job.slurm")),
            poll_interval_seconds: 0,
            ..SchedulerConfig::default()
        };
        Orchestrator::new(config.resolve().expect("resolve"), scheduler)
    }
}

fn read(path: impl AsRef<Path>) -> String {
    fs::read_to_string(path.as_ref())
        .unwrap_or_else(|e| panic!("read {}: {}", path.as_ref().display(), e))
}

#[test]
fn search_runs_every_generation_and_collects_outputs() {
    let ws = Workspace::new(&["ENCUT = 400\n"], false);
    let orch = ws.orchestrator(RELAX, InlineScheduler::new(true, JobState::Completed));
    orch.run().expect("search finishes");

    assert_eq!(*orch.scheduler().submissions.borrow(), vec!["cal_1", "cal_2"]);
    for generation in [1, 2] {
        let paths = TaskPaths::new(&orch.context().tasks_dir, Generation(generation));
        let status = load_status(&paths.status()).expect("status");
        assert_eq!(status.count(StructureStatus::Success), 3);
        for n in 1..=3 {
            assert!(paths.task_dir.join(format!("job_{}/step_1/OUTCAR", n)).is_file());
        }
        assert!(paths.task_dir.join("collected.json").is_file());
    }

    let calypso = ws.calypso();
    for n in 1..=3 {
        assert_eq!(read(calypso.join(format!("OUTCAR_{}", n))), "done\n");
        let contcar = read(calypso.join(format!("CONTCAR_{}", n)));
        assert!(contcar.starts_with(&format!("gen 2 structure {}", n)));
    }
    assert!(!calypso.join("POSCAR_1").exists(), "generator cleared its candidates");
}

#[test]
fn failing_structure_warns_and_collection_skips_its_final_structure() {
    let ws = Workspace::new(&["NSW = 0\n", "NSW = 50\n"], true);
    let command = format!(
        "if grep -q bad POSCAR; then echo partial > OUTCAR; exit 3; fi; {}",
        RELAX
    );
    let orch = ws.orchestrator(&command, InlineScheduler::new(true, JobState::Completed));

    assert_eq!(orch.cycle().expect("first generator run"), Cycle::Immediate);
    assert_eq!(orch.cycle().expect("create task"), Cycle::Immediate);
    assert_eq!(orch.cycle().expect("submit and run"), Cycle::Sleep);

    let paths = TaskPaths::new(&orch.context().tasks_dir, Generation(1));
    let status = load_status(&paths.status()).expect("status");
    let broken = status.get(StructureId(2)).expect("record");
    assert_eq!(broken.status, StructureStatus::Success);
    assert!(!broken.warning.is_empty());
    assert!(!paths.task_dir.join("job_2/step_2").exists());
    for n in [1, 3] {
        let rec = status.get(StructureId(n)).expect("record");
        assert_eq!(rec.status, StructureStatus::Success);
        assert!(rec.warning.is_empty());
        assert!(paths.task_dir.join(format!("job_{}/step_2/CONTCAR", n)).is_file());
    }

    assert_eq!(orch.cycle().expect("collect and advance"), Cycle::Immediate);
    let calypso = ws.calypso();
    assert_eq!(read(calypso.join("OUTCAR_2")), "partial\n");
    assert!(!calypso.join("CONTCAR_2").exists());
    assert!(calypso.join("CONTCAR_1").is_file());
    let manifest = read(paths.task_dir.join("collected.json"));
    assert!(manifest.contains("\"skipped\""));
    assert!(manifest.contains("CONTCAR"));
}

#[test]
fn resubmission_resumes_only_unfinished_structures() {
    let ws = Workspace::new(&["ENCUT = 400\n"], false);
    let runs = ws.path().join("runs.log");
    let command = format!("echo x >> {}; {}", runs.display(), RELAX);
    let orch = ws.orchestrator(&command, InlineScheduler::new(true, JobState::Completed));
    orch.cycle().expect("generator");
    orch.cycle().expect("create");

    let paths = TaskPaths::new(&orch.context().tasks_dir, Generation(1));
    let seeded = r#"{"jobs": {"POSCAR_1": {"status": "success", "timestamp": "2024-05-01T10:00:00+00:00", "workdir": "/old/job_1", "error": "", "warning": ""}}}"#;
    fs::write(paths.status(), seeded).expect("seed status");

    orch.cycle().expect("submit and run");
    assert_eq!(read(&runs).lines().count(), 2);
    assert!(!paths.task_dir.join("job_1").exists());
    let status = load_status(&paths.status()).expect("status");
    let first = status.get(StructureId(1)).expect("record");
    assert_eq!(first.timestamp, "2024-05-01T10:00:00+00:00");
    assert_eq!(status.count(StructureStatus::Success), 3);
}

#[test]
fn restarted_orchestrator_never_duplicates_task_or_submission() {
    let ws = Workspace::new(&["ENCUT = 400\n"], false);
    let first = ws.orchestrator(RELAX, InlineScheduler::new(false, JobState::Running));
    first.cycle().expect("generator");
    first.cycle().expect("create");
    first.cycle().expect("submit");
    assert_eq!(first.scheduler().submissions.borrow().len(), 1);

    let second = ws.orchestrator(RELAX, InlineScheduler::new(false, JobState::Running));
    second.create_task(Generation(1)).expect("create again");
    assert_eq!(second.cycle().expect("poll"), Cycle::Sleep);
    assert!(second.scheduler().submissions.borrow().is_empty());

    let tasks = fs::read_dir(&second.context().tasks_dir)
        .expect("tasks")
        .filter_map(|e| e.ok())
        .filter(|e| e.file_name().to_string_lossy().starts_with("task_"))
        .count();
    assert_eq!(tasks, 1);
}
