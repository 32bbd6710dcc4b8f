//! Copies the results of a completed task back into the generator workspace.
//!
//! For each structure the original input, the final structure and the
//! completion artifact of its last step land under structure-indexed names.
//! A missing completion artifact is fatal; a missing final structure is
//! logged and skipped: a step without a completion artifact never ran, while
//! a final structure can be absent after the acceleration fallback diverted
//! a step's output.

use crate::error::{Result, RunnerError};
use crate::fsutil::{atomic_write_json_pretty, copy_atomic, sha256_file};
use crate::ids::{parse_numbered_name, Generation, StructureId};
use crate::state::TaskPaths;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollectedFile {
    pub structure: StructureId,
    pub source: PathBuf,
    pub target: PathBuf,
    pub sha256: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SkippedFile {
    pub structure: StructureId,
    pub missing: PathBuf,
}

/// Written as `collected.json` in the task directory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollectionManifest {
    pub generation: Generation,
    pub collected_at: String,
    pub files: Vec<CollectedFile>,
    pub skipped: Vec<SkippedFile>,
}

/// Job directories of a task as `(structure, dir)`, ascending.
fn job_dirs(task_dir: &Path, job_prefix: &str) -> Result<Vec<(StructureId, PathBuf)>> {
    let prefix = job_prefix.trim_end_matches('_');
    let mut dirs = Vec::new();
    for entry in WalkDir::new(task_dir).min_depth(1).max_depth(1) {
        let entry = entry?;
        if !entry.file_type().is_dir() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().into_owned();
        if let Some(n) = parse_numbered_name(&name, prefix) {
            dirs.push((StructureId(n), entry.into_path()));
        }
    }
    dirs.sort_by_key(|(id, _)| *id);
    Ok(dirs)
}

/// Step directories of a job, ascending by step index.
fn step_dirs(job_dir: &Path) -> Result<Vec<(u32, PathBuf)>> {
    Ok(crate::ids::numbered_entries(job_dir, "step")?
        .into_iter()
        .filter(|(_, p)| p.is_dir())
        .collect())
}

/// The last step that produced a final structure, or the last step at all
/// when none did.
fn final_step(steps: &[(u32, PathBuf)]) -> Option<&Path> {
    steps
        .iter()
        .rev()
        .find(|(_, dir)| dir.join(crate::FINAL_STRUCTURE_FILE).is_file())
        .or_else(|| steps.last())
        .map(|(_, dir)| dir.as_path())
}

pub fn collect_outputs(
    paths: &TaskPaths,
    generation: Generation,
    job_prefix: &str,
    generator_workdir: &Path,
) -> Result<CollectionManifest> {
    let mut manifest = CollectionManifest {
        generation,
        collected_at: Utc::now().to_rfc3339(),
        files: Vec::new(),
        skipped: Vec::new(),
    };
    let mut copy = |structure: StructureId, source: PathBuf, name: &str| -> Result<()> {
        let target = generator_workdir.join(format!("{}_{}", name, structure));
        copy_atomic(&source, &target)?;
        debug!(from = %source.display(), to = %target.display(), "collected");
        manifest.files.push(CollectedFile {
            structure,
            sha256: sha256_file(&target)?,
            source,
            target,
        });
        Ok(())
    };

    let mut skipped = Vec::new();
    for (structure, job_dir) in job_dirs(&paths.task_dir, job_prefix)? {
        let steps = step_dirs(&job_dir)?;
        let Some(step_dir) = final_step(&steps) else {
            warn!(structure = %structure, dir = %job_dir.display(), "job has no step directories");
            continue;
        };

        let original = job_dir.join(crate::ORIGINAL_STRUCTURE_FILE);
        if !original.is_file() {
            return Err(RunnerError::missing("original structure", original));
        }
        copy(structure, original, crate::STRUCTURE_PREFIX)?;

        let final_structure = step_dir.join(crate::FINAL_STRUCTURE_FILE);
        if final_structure.is_file() {
            copy(structure, final_structure, crate::FINAL_STRUCTURE_FILE)?;
        } else {
            warn!(
                structure = %structure,
                missing = %final_structure.display(),
                "final structure missing; not collected"
            );
            skipped.push(SkippedFile {
                structure,
                missing: final_structure,
            });
        }

        let completion = step_dir.join(crate::COMPLETION_FILE);
        if !completion.is_file() {
            return Err(RunnerError::missing("completion artifact", completion));
        }
        copy(structure, completion, crate::COMPLETION_FILE)?;
    }
    manifest.skipped = skipped;

    atomic_write_json_pretty(&paths.task_dir.join(crate::COLLECTION_MANIFEST_FILE), &manifest)?;
    info!(
        generation = %generation,
        files = manifest.files.len(),
        skipped = manifest.skipped.len(),
        "collected task outputs"
    );
    Ok(manifest)
}
