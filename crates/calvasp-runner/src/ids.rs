//! Typed identifiers parsed once from the on-disk naming conventions.

use crate::error::{Result, RunnerError};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// One generation of the structure generator, derived from its counter file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Generation(pub u32);

impl fmt::Display for Generation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Numeric suffix of a candidate structure file (`POSCAR_<n>`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StructureId(pub u32);

impl StructureId {
    /// Key used in the status file, matching the candidate file name.
    pub fn status_key(&self) -> String {
        format!("{}_{}", crate::STRUCTURE_PREFIX, self.0)
    }
}

impl fmt::Display for StructureId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// 1-based position of a step within a job's chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StepIndex(pub u32);

impl StepIndex {
    pub fn previous(&self) -> Option<StepIndex> {
        (self.0 > 1).then(|| StepIndex(self.0 - 1))
    }

    pub fn dir_name(&self) -> String {
        format!("step_{}", self.0)
    }
}

impl fmt::Display for StepIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier the batch scheduler assigned to a submitted job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BatchJobId(pub u64);

impl fmt::Display for BatchJobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for BatchJobId {
    type Err = RunnerError;

    fn from_str(s: &str) -> Result<Self> {
        s.trim()
            .parse::<u64>()
            .map(BatchJobId)
            .map_err(|_| RunnerError::Config(format!("invalid batch job id '{}'", s)))
    }
}

// Stored as a string in slurm.json so records written by older tooling stay readable.
impl Serialize for BatchJobId {
    fn serialize<S: serde::Serializer>(
        &self,
        serializer: S,
    ) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0.to_string())
    }
}

impl<'de> Deserialize<'de> for BatchJobId {
    fn deserialize<D: serde::Deserializer<'de>>(
        deserializer: D,
    ) -> std::result::Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Text(String),
            Number(u64),
        }
        match Raw::deserialize(deserializer)? {
            Raw::Number(n) => Ok(BatchJobId(n)),
            Raw::Text(s) => s
                .trim()
                .parse::<u64>()
                .map(BatchJobId)
                .map_err(serde::de::Error::custom),
        }
    }
}

/// Parses `<prefix>_<n>` into `n`. Anything else yields `None`.
pub fn parse_numbered_name(name: &str, prefix: &str) -> Option<u32> {
    let rest = name.strip_prefix(prefix)?.strip_prefix('_')?;
    if rest.is_empty() || !rest.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    rest.parse().ok()
}

/// Lists `<prefix>_<n>` entries of `dir` sorted by `n` ascending.
///
/// Entries whose suffix is not a plain integer are ignored. A missing
/// directory yields an empty list.
pub fn numbered_entries(dir: &Path, prefix: &str) -> Result<Vec<(u32, PathBuf)>> {
    if !dir.is_dir() {
        return Ok(Vec::new());
    }
    let mut out = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else {
            continue;
        };
        if let Some(n) = parse_numbered_name(name, prefix) {
            out.push((n, entry.path()));
        }
    }
    out.sort_by_key(|(n, _)| *n);
    Ok(out)
}
