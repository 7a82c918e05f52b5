//! Bundle workloads: a base64 zip unpacked into `workload_dir/runtime/`.
//!
//! The layout mimics a packaged serverless function. The process runs
//! `runtime/bootstrap` and gets two extra environment entries: the task-root
//! variable pointing at `runtime/`, and a `PATH` override. Both names and
//! values come from [`BundleEnv`](crate::config::BundleEnv).

use super::{
    check_common, parse_envs, EntryPoint, PrepareError, Preparable, ProcessSpec, WorkloadPaths,
};
use crate::config::{BundleEnv, StagerConfig};
use crate::fsutil::{self, archive};
use crate::registry::{WorkloadDescriptor, WorkloadKind};
use crate::toolchain::{BuildOutput, CancelToken};
use anyhow::{anyhow, Context};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use log::{info, warn};
use sha2::{Digest, Sha256};
use std::fs;
use std::os::unix::fs::DirBuilderExt;
use std::path::{Path, PathBuf};

const RUNTIME_DIR_MODE: u32 = 0o755;

#[derive(Debug, Clone)]
pub struct BundlePreparable {
    name: String,
    bundle_data: String,
    bundle_env: BundleEnv,
    working_dir: Option<PathBuf>,
    keep_alive: bool,
    args: Vec<String>,
    envs: Vec<(String, String)>,
    paths: WorkloadPaths,
    command: Option<PathBuf>,
}

impl BundlePreparable {
    pub fn new(
        descriptor: &WorkloadDescriptor,
        config: &StagerConfig,
    ) -> Result<Self, PrepareError> {
        let WorkloadKind::Bundle { bundle_data } = &descriptor.kind else {
            return Err(PrepareError::invalid(
                &descriptor.name,
                "not a bundle workload",
            ));
        };
        check_common(descriptor, &config.sys_folder)?;

        Ok(Self {
            name: descriptor.name.clone(),
            bundle_data: bundle_data.clone(),
            bundle_env: config.bundle.clone(),
            working_dir: descriptor.working_dir.clone(),
            keep_alive: descriptor.keep_alive,
            args: descriptor.args.clone(),
            envs: parse_envs(&descriptor.name, &descriptor.envs)?,
            paths: WorkloadPaths::derive(
                &config.sys_folder,
                &descriptor.name,
                EntryPoint::Bootstrap,
            ),
            command: None,
        })
    }

    fn archive_error(&self, source: anyhow::Error) -> PrepareError {
        PrepareError::Archive {
            name: self.name.clone(),
            source,
        }
    }

    /// The two entries injected on top of the descriptor's own environment.
    fn runtime_envs(&self) -> [(String, String); 2] {
        [
            (
                self.bundle_env.task_root_var.clone(),
                self.paths.runtime_dir().to_string_lossy().into_owned(),
            ),
            ("PATH".to_string(), self.bundle_env.path.clone()),
        ]
    }
}

impl Preparable for BundlePreparable {
    fn prepare_bin(&mut self, _cancel: &CancelToken) -> Result<BuildOutput, PrepareError> {
        self.command = None;
        let workload_dir = &self.paths.workload_dir;
        fs::create_dir_all(workload_dir)
            .with_context(|| format!("creating workload directory '{}'", workload_dir.display()))?;

        let bytes = STANDARD
            .decode(self.bundle_data.trim())
            .map_err(|err| self.archive_error(anyhow!(err).context("decoding base64 bundle")))?;

        let staged = self.paths.staged_archive();
        fsutil::write_file(&staged, &bytes)?;
        info!(
            "staged bundle for '{}' at {} ({} bytes, sha256 {:x})",
            self.name,
            staged.display(),
            bytes.len(),
            Sha256::digest(&bytes)
        );

        let runtime = self.paths.runtime_dir();
        if runtime.exists() {
            warn!("replacing existing runtime tree {}", runtime.display());
            fs::remove_dir_all(&runtime)
                .with_context(|| format!("removing stale runtime '{}'", runtime.display()))?;
        }
        fs::DirBuilder::new()
            .recursive(true)
            .mode(RUNTIME_DIR_MODE)
            .create(&runtime)
            .with_context(|| format!("creating runtime directory '{}'", runtime.display()))?;

        let entries = archive::unzip(&staged, &runtime).map_err(|err| self.archive_error(err))?;

        if !self.paths.binary.is_file() {
            return Err(self.archive_error(anyhow!(
                "bundle has no '{}' entry point at its root",
                super::BOOTSTRAP
            )));
        }

        info!(
            "unpacked {} entries for '{}' into {}",
            entries,
            self.name,
            runtime.display()
        );
        self.command = Some(self.paths.binary.clone());
        Ok(BuildOutput::default())
    }

    fn setup_proc(&self) -> Result<ProcessSpec, PrepareError> {
        let command = self
            .command
            .clone()
            .ok_or_else(|| PrepareError::NotPrepared(self.name.clone()))?;
        let mut envs = self.envs.clone();
        envs.extend(self.runtime_envs());

        Ok(ProcessSpec {
            name: self.name.clone(),
            command,
            args: self.args.clone(),
            envs,
            working_dir: Some(
                self.working_dir
                    .clone()
                    .unwrap_or_else(|| self.paths.workload_dir.clone()),
            ),
            workload_dir: self.paths.workload_dir.clone(),
            pid_file: self.paths.pid_file.clone(),
            out_file: self.paths.out_file.clone(),
            err_file: self.paths.err_file.clone(),
            keep_alive: self.keep_alive,
            pid: None,
        })
    }

    fn identifier(&self) -> &str {
        &self.name
    }

    fn paths(&self) -> &WorkloadPaths {
        &self.paths
    }

    fn command(&self) -> Option<&Path> {
        self.command.as_deref()
    }
}
