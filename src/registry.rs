//! Persisted registry of workload descriptors.
//!
//! The registry is a TOML document with one `[[workloads]]` table per
//! workload, keyed by `name`:
//!
//! ```toml
//! [[workloads]]
//! name = "api"
//! kind = "source"
//! source_path = "/srv/src/api"
//! language = "go"
//! keep_alive = true
//! args = ["--port", "8080"]
//!
//! [[workloads]]
//! name = "thumbnailer"
//! kind = "bundle"
//! bundle_data = "UEsDBBQAAAAIA..."
//! envs = ["BUCKET=media"]
//! ```
//!
//! All access goes through the locked helpers in [`crate::fsutil`].

use crate::fsutil;
use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

fn default_language() -> String {
    "go".to_string()
}

/// What to build or unpack for a workload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum WorkloadKind {
    /// Compile `source_path` with the toolchain for `language`.
    Source {
        source_path: PathBuf,
        #[serde(default = "default_language")]
        language: String,
    },
    /// Unpack a base64-encoded zip bundle.
    Bundle { bundle_data: String },
}

/// Declarative description of one workload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkloadDescriptor {
    pub name: String,
    #[serde(flatten)]
    pub kind: WorkloadKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<PathBuf>,
    #[serde(default)]
    pub keep_alive: bool,
    #[serde(default)]
    pub args: Vec<String>,
    /// `KEY=VALUE` entries layered over the supervisor's environment.
    #[serde(default)]
    pub envs: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Registry {
    #[serde(default)]
    pub workloads: Vec<WorkloadDescriptor>,
}

impl Registry {
    /// Load from `path`; a missing file is an empty registry.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        fsutil::safe_read_toml(path)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        fsutil::safe_write_toml(self, path)
    }

    /// Read-modify-write the registry at `path` under one lock span.
    pub fn update<R>(path: &Path, f: impl FnOnce(&mut Registry) -> Result<R>) -> Result<R> {
        fsutil::update_toml(path, f)
    }

    pub fn get(&self, name: &str) -> Option<&WorkloadDescriptor> {
        self.workloads.iter().find(|w| w.name == name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.workloads.iter().map(|w| w.name.as_str())
    }

    /// Insert `descriptor`, replacing any workload with the same name.
    /// Returns `true` when an existing entry was replaced.
    pub fn upsert(&mut self, descriptor: WorkloadDescriptor) -> Result<bool> {
        validate_workload_name(&descriptor.name)?;
        match self.workloads.iter_mut().find(|w| w.name == descriptor.name) {
            Some(existing) => {
                *existing = descriptor;
                Ok(true)
            }
            None => {
                self.workloads.push(descriptor);
                Ok(false)
            }
        }
    }

    /// Remove the workload called `name`. Returns whether it was present.
    pub fn remove(&mut self, name: &str) -> bool {
        let before = self.workloads.len();
        self.workloads.retain(|w| w.name != name);
        self.workloads.len() != before
    }
}

/// A workload name becomes a directory and file stem, so it must be a single
/// safe path segment.
pub fn validate_workload_name(name: &str) -> Result<()> {
    if name.is_empty() {
        bail!("workload name must not be empty");
    }
    if name == "." || name == ".." {
        bail!("workload name must not be '.' or '..'");
    }
    if name.contains('/') || name.contains('\\') || name.contains('\0') {
        bail!("workload name must be a safe filename segment: {name:?}");
    }
    Ok(())
}
