//! Turning a workload descriptor into a launchable process specification.
//!
//! A [`Preparable`] is built from a [`WorkloadDescriptor`] by
//! [`preparable_for`], which picks the variant from the descriptor's kind:
//!
//! - [`SourcePreparable`] compiles a source tree with an external toolchain.
//! - [`BundlePreparable`] unpacks a base64 zip bundle into a `runtime/` tree
//!   and runs its `bootstrap` entry point.
//!
//! Every workload owns `sys_folder/name/`:
//!
//! ```text
//! sys_folder/name/
//!     name              compiled binary (source workloads)
//!     runtime/bootstrap bundle entry point (bundle workloads)
//!     function.zip      staged copy of the bundle
//!     name.pid
//!     name.out
//!     name.err
//! ```
//!
//! [`Preparable::prepare_bin`] must succeed before [`Preparable::setup_proc`]
//! or [`Preparable::start`]; until then both return
//! [`PrepareError::NotPrepared`].

pub mod bundle;
pub mod source;

pub use bundle::BundlePreparable;
pub use source::SourcePreparable;

use crate::config::StagerConfig;
use crate::fsutil::with_suffix;
use crate::launcher::Launcher;
use crate::registry::{validate_workload_name, WorkloadDescriptor, WorkloadKind};
use crate::toolchain::{BuildOutput, CancelToken};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Subdirectory of the workload dir that holds an extracted bundle.
pub const RUNTIME_DIR: &str = "runtime";
/// Fixed entry point inside an extracted bundle.
pub const BOOTSTRAP: &str = "bootstrap";
/// Staged copy of the decoded bundle archive.
pub const STAGED_ARCHIVE: &str = "function.zip";

/// Errors from preparing or launching a workload.
#[derive(Debug, Error)]
pub enum PrepareError {
    #[error("invalid workload '{name}': {reason}")]
    InvalidDescriptor { name: String, reason: String },

    #[error("build toolchain '{program}' not found on PATH")]
    ToolchainMissing { program: String },

    #[error("build toolchain '{program}' failed ({status})\n{output}")]
    Toolchain {
        program: String,
        status: String,
        output: BuildOutput,
    },

    #[error("build toolchain '{program}' timed out after {}s", .after.as_secs())]
    Timeout {
        program: String,
        after: Duration,
        output: BuildOutput,
    },

    #[error("build toolchain '{program}' was cancelled")]
    Cancelled { program: String, output: BuildOutput },

    #[error("unpacking bundle for '{name}' failed")]
    Archive {
        name: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("workload '{0}' has no resolved command; prepare_bin has not succeeded")]
    NotPrepared(String),

    #[error("launching workload '{}' failed", .spec.name)]
    Launch {
        spec: Box<ProcessSpec>,
        #[source]
        source: anyhow::Error,
    },

    #[error(transparent)]
    Io(#[from] anyhow::Error),
}

impl PrepareError {
    /// Captured toolchain output, for the variants that ran the toolchain.
    pub fn output(&self) -> Option<&BuildOutput> {
        match self {
            Self::Toolchain { output, .. }
            | Self::Timeout { output, .. }
            | Self::Cancelled { output, .. } => Some(output),
            _ => None,
        }
    }

    /// `Display` followed by any captured toolchain output, each shown once.
    pub fn detailed(&self) -> String {
        match (self, self.output()) {
            // Already part of the message.
            (Self::Toolchain { .. }, _) | (_, None) => self.to_string(),
            (_, Some(output)) if output.is_empty() => self.to_string(),
            (_, Some(output)) => format!("{self}\n{output}"),
        }
    }

    fn invalid(name: &str, reason: impl Into<String>) -> Self {
        Self::InvalidDescriptor {
            name: name.to_string(),
            reason: reason.into(),
        }
    }
}

/// Everything the lifecycle container needs to spawn and track a workload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProcessSpec {
    pub name: String,
    pub command: PathBuf,
    pub args: Vec<String>,
    pub envs: Vec<(String, String)>,
    pub working_dir: Option<PathBuf>,
    pub workload_dir: PathBuf,
    pub pid_file: PathBuf,
    pub out_file: PathBuf,
    pub err_file: PathBuf,
    pub keep_alive: bool,
    /// Set by [`Preparable::start`] once the launcher has spawned the process.
    pub pid: Option<u32>,
}

/// Which entry point a workload runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryPoint {
    /// `workload_dir/name`, written by the build toolchain.
    CompiledBinary,
    /// `workload_dir/runtime/bootstrap`, shipped inside the bundle.
    Bootstrap,
}

/// Filesystem layout of one workload, derived from `(sys_folder, name)` only.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkloadPaths {
    pub workload_dir: PathBuf,
    pub binary: PathBuf,
    pub pid_file: PathBuf,
    pub out_file: PathBuf,
    pub err_file: PathBuf,
}

impl WorkloadPaths {
    pub fn derive(sys_folder: &Path, name: &str, entry: EntryPoint) -> Self {
        let workload_dir = normalize_dir(sys_folder).join(name);
        let stem = workload_dir.join(name);
        let binary = match entry {
            EntryPoint::CompiledBinary => stem.clone(),
            EntryPoint::Bootstrap => workload_dir.join(RUNTIME_DIR).join(BOOTSTRAP),
        };
        Self {
            pid_file: with_suffix(&stem, ".pid"),
            out_file: with_suffix(&stem, ".out"),
            err_file: with_suffix(&stem, ".err"),
            binary,
            workload_dir,
        }
    }

    pub fn runtime_dir(&self) -> PathBuf {
        self.workload_dir.join(RUNTIME_DIR)
    }

    pub fn staged_archive(&self) -> PathBuf {
        self.workload_dir.join(STAGED_ARCHIVE)
    }
}

/// Drop trailing separators and `.` segments (`/a/` and `/a/.` become `/a`).
pub fn normalize_dir(path: &Path) -> PathBuf {
    path.components().collect()
}

/// Capability set shared by both workload variants.
pub trait Preparable: Send {
    /// Build or unpack the launch artifact and resolve the command.
    ///
    /// Source workloads return the toolchain output; bundle workloads return
    /// an empty output. On error the command stays unresolved.
    fn prepare_bin(&mut self, cancel: &CancelToken) -> Result<BuildOutput, PrepareError>;

    /// Assemble the process specification without launching anything.
    fn setup_proc(&self) -> Result<ProcessSpec, PrepareError>;

    /// Assemble the process specification and hand it to `launcher`.
    ///
    /// A launch failure is returned as [`PrepareError::Launch`], which still
    /// carries the specification.
    fn start(&self, launcher: &mut dyn Launcher) -> Result<ProcessSpec, PrepareError> {
        let mut spec = self.setup_proc()?;
        match launcher.launch(&spec) {
            Ok(pid) => {
                spec.pid = Some(pid);
                Ok(spec)
            }
            Err(source) => Err(PrepareError::Launch {
                spec: Box::new(spec),
                source,
            }),
        }
    }

    /// Workload name; the supervisor's lookup key.
    fn identifier(&self) -> &str;

    fn paths(&self) -> &WorkloadPaths;

    /// Resolved command, once `prepare_bin` has succeeded.
    fn command(&self) -> Option<&Path>;
}

/// Pick the variant for `descriptor` and build it against `config`.
pub fn preparable_for(
    descriptor: &WorkloadDescriptor,
    config: &StagerConfig,
) -> Result<Box<dyn Preparable>, PrepareError> {
    match &descriptor.kind {
        WorkloadKind::Source { .. } => {
            Ok(Box::new(SourcePreparable::new(descriptor, config)?))
        }
        WorkloadKind::Bundle { .. } => {
            Ok(Box::new(BundlePreparable::new(descriptor, config)?))
        }
    }
}

/// Checks shared by both variants' constructors.
fn check_common(descriptor: &WorkloadDescriptor, sys_folder: &Path) -> Result<(), PrepareError> {
    validate_workload_name(&descriptor.name)
        .map_err(|err| PrepareError::invalid(&descriptor.name, err.to_string()))?;
    if sys_folder.as_os_str().is_empty() {
        return Err(PrepareError::invalid(&descriptor.name, "sys_folder is empty"));
    }
    Ok(())
}

/// Parse `KEY=VALUE` entries, keeping their order.
fn parse_envs(name: &str, envs: &[String]) -> Result<Vec<(String, String)>, PrepareError> {
    envs.iter()
        .map(|entry| match entry.split_once('=') {
            Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
            _ => Err(PrepareError::invalid(
                name,
                format!("environment entry '{entry}' is not KEY=VALUE"),
            )),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fsutil::archive::tests::build_zip;
    use crate::launcher::tests::RecordingLauncher;
    use crate::registry::Registry;
    use crate::toolchain::Toolchain;
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use tempfile::TempDir;

    #[test]
    fn registry_entries_select_their_variant() {
        let tmp = TempDir::new().unwrap();
        let registry_path = tmp.path().join("registry.toml");
        let zip = build_zip(&[("bootstrap", b"#!/bin/sh\n", 0o755)]);

        let mut registry = Registry::default();
        registry
            .upsert(WorkloadDescriptor {
                name: "fn".to_string(),
                kind: WorkloadKind::Bundle {
                    bundle_data: STANDARD.encode(&zip),
                },
                working_dir: None,
                keep_alive: true,
                args: vec![],
                envs: vec![],
            })
            .unwrap();
        registry
            .upsert(WorkloadDescriptor {
                name: "svc".to_string(),
                kind: WorkloadKind::Source {
                    source_path: tmp.path().join("src"),
                    language: "sh".to_string(),
                },
                working_dir: None,
                keep_alive: false,
                args: vec![],
                envs: vec![],
            })
            .unwrap();
        registry.save(&registry_path).unwrap();

        let mut config = StagerConfig {
            sys_folder: tmp.path().join("sys"),
            ..StagerConfig::default()
        };
        config
            .toolchains
            .insert("sh".to_string(), Toolchain::new("sh", ["-c", "touch {out}"]));

        let registry = Registry::load(&registry_path).unwrap();
        let mut launcher = RecordingLauncher::default();
        for descriptor in &registry.workloads {
            let mut workload = preparable_for(descriptor, &config).unwrap();
            assert_eq!(workload.identifier(), descriptor.name);
            workload.prepare_bin(&CancelToken::new()).unwrap();
            workload.start(&mut launcher).unwrap();
        }

        let commands: Vec<_> = launcher.launched.iter().map(|s| s.command.clone()).collect();
        assert_eq!(
            commands,
            vec![
                tmp.path().join("sys/fn/runtime/bootstrap"),
                tmp.path().join("sys/svc/svc"),
            ]
        );
    }

    #[test]
    fn detailed_report_shows_partial_output_once() {
        let output = BuildOutput {
            stdout: b"compiling ./pkg\n".to_vec(),
            stderr: vec![],
        };
        let timed_out = PrepareError::Timeout {
            program: "go".to_string(),
            after: Duration::from_secs(5),
            output: output.clone(),
        };
        assert_eq!(
            timed_out.detailed(),
            "build toolchain 'go' timed out after 5s\ncompiling ./pkg"
        );

        let failed = PrepareError::Toolchain {
            program: "go".to_string(),
            status: "exit code 1".to_string(),
            output,
        };
        assert_eq!(failed.detailed().matches("compiling ./pkg").count(), 1);

        let cancelled = PrepareError::Cancelled {
            program: "go".to_string(),
            output: BuildOutput::default(),
        };
        assert_eq!(cancelled.detailed(), "build toolchain 'go' was cancelled");
        assert_eq!(
            PrepareError::NotPrepared("w".to_string()).detailed(),
            PrepareError::NotPrepared("w".to_string()).to_string()
        );
    }

    #[test]
    fn derived_paths_ignore_trailing_separators() {
        for entry in [EntryPoint::CompiledBinary, EntryPoint::Bootstrap] {
            let a = WorkloadPaths::derive(Path::new("/var/sup/"), "api", entry);
            let b = WorkloadPaths::derive(Path::new("/var/sup"), "api", entry);
            let c = WorkloadPaths::derive(Path::new("/var/sup//"), "api", entry);
            assert_eq!(a, b);
            assert_eq!(a, c);
            assert_eq!(a.pid_file.to_str(), Some("/var/sup/api/api.pid"));
        }
    }

    #[test]
    fn auxiliary_paths_match_across_variants() {
        let source = WorkloadPaths::derive(Path::new("/s"), "svc", EntryPoint::CompiledBinary);
        let bundle = WorkloadPaths::derive(Path::new("/s"), "svc", EntryPoint::Bootstrap);

        assert_eq!(source.binary, PathBuf::from("/s/svc/svc"));
        assert_eq!(bundle.binary, PathBuf::from("/s/svc/runtime/bootstrap"));
        assert_eq!(source.workload_dir, bundle.workload_dir);
        assert_eq!(source.pid_file, bundle.pid_file);
        assert_eq!(source.out_file, PathBuf::from("/s/svc/svc.out"));
        assert_eq!(bundle.err_file, PathBuf::from("/s/svc/svc.err"));
        assert_eq!(bundle.staged_archive(), PathBuf::from("/s/svc/function.zip"));
    }

    #[test]
    fn derivation_is_repeatable() {
        let first = WorkloadPaths::derive(Path::new("relative/sys"), "w", EntryPoint::Bootstrap);
        for _ in 0..3 {
            assert_eq!(
                WorkloadPaths::derive(Path::new("relative/sys"), "w", EntryPoint::Bootstrap),
                first
            );
        }
    }

    #[test]
    fn envs_parse_in_order_and_reject_garbage() {
        let envs = vec!["A=1".to_string(), "B=x=y".to_string(), "EMPTY=".to_string()];
        assert_eq!(
            parse_envs("w", &envs).unwrap(),
            vec![
                ("A".to_string(), "1".to_string()),
                ("B".to_string(), "x=y".to_string()),
                ("EMPTY".to_string(), String::new()),
            ]
        );
        assert!(parse_envs("w", &["NOEQUALS".to_string()]).is_err());
        assert!(parse_envs("w", &["=value".to_string()]).is_err());
    }
}
