//! Source-build workloads: compile a source tree into `workload_dir/name`.

use super::{
    check_common, parse_envs, EntryPoint, PrepareError, Preparable, ProcessSpec, WorkloadPaths,
};
use crate::config::StagerConfig;
use crate::registry::{WorkloadDescriptor, WorkloadKind};
use crate::toolchain::{self, BuildOutput, CancelToken, Toolchain};
use anyhow::{anyhow, Context};
use log::{debug, info};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct SourcePreparable {
    name: String,
    source_path: PathBuf,
    language: String,
    toolchain: Toolchain,
    build_timeout: Option<Duration>,
    working_dir: Option<PathBuf>,
    keep_alive: bool,
    args: Vec<String>,
    envs: Vec<(String, String)>,
    paths: WorkloadPaths,
    command: Option<PathBuf>,
}

impl SourcePreparable {
    pub fn new(
        descriptor: &WorkloadDescriptor,
        config: &StagerConfig,
    ) -> Result<Self, PrepareError> {
        let WorkloadKind::Source {
            source_path,
            language,
        } = &descriptor.kind
        else {
            return Err(PrepareError::invalid(
                &descriptor.name,
                "not a source workload",
            ));
        };
        check_common(descriptor, &config.sys_folder)?;
        if source_path.as_os_str().is_empty() {
            return Err(PrepareError::invalid(&descriptor.name, "source_path is empty"));
        }
        let toolchain = config.toolchain_for(language).ok_or_else(|| {
            PrepareError::invalid(
                &descriptor.name,
                format!("no build toolchain configured for language '{language}'"),
            )
        })?;

        Ok(Self {
            name: descriptor.name.clone(),
            source_path: super::normalize_dir(source_path),
            language: language.clone(),
            toolchain,
            build_timeout: config.build_timeout(),
            working_dir: descriptor.working_dir.clone(),
            keep_alive: descriptor.keep_alive,
            args: descriptor.args.clone(),
            envs: parse_envs(&descriptor.name, &descriptor.envs)?,
            paths: WorkloadPaths::derive(
                &config.sys_folder,
                &descriptor.name,
                EntryPoint::CompiledBinary,
            ),
            command: None,
        })
    }

    /// Source directory with trailing separators removed.
    pub fn source_path(&self) -> &Path {
        &self.source_path
    }
}

impl Preparable for SourcePreparable {
    fn prepare_bin(&mut self, cancel: &CancelToken) -> Result<BuildOutput, PrepareError> {
        self.command = None;
        let workload_dir = &self.paths.workload_dir;
        fs::create_dir_all(workload_dir)
            .with_context(|| format!("creating workload directory '{}'", workload_dir.display()))?;
        remove_stale_binary(&self.paths.binary)?;

        info!(
            "building {} workload '{}' from {}",
            self.language,
            self.name,
            self.source_path.display()
        );
        let output = toolchain::run_build(
            &self.toolchain,
            &self.source_path,
            &self.paths.binary,
            self.build_timeout,
            cancel,
        )?;

        if !self.paths.binary.is_file() {
            return Err(anyhow!(
                "build toolchain '{}' succeeded but produced no binary at '{}'",
                self.toolchain.program,
                self.paths.binary.display()
            )
            .into());
        }

        info!("built '{}' at {}", self.name, self.paths.binary.display());
        self.command = Some(self.paths.binary.clone());
        Ok(output)
    }

    fn setup_proc(&self) -> Result<ProcessSpec, PrepareError> {
        let command = self
            .command
            .clone()
            .ok_or_else(|| PrepareError::NotPrepared(self.name.clone()))?;
        Ok(ProcessSpec {
            name: self.name.clone(),
            command,
            args: self.args.clone(),
            envs: self.envs.clone(),
            working_dir: self.working_dir.clone(),
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

/// A binary left by an earlier build must not pass for fresh output.
fn remove_stale_binary(binary: &Path) -> anyhow::Result<()> {
    match fs::remove_file(binary) {
        Ok(()) => {
            debug!("removed previous build output {}", binary.display());
            Ok(())
        }
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(anyhow!(err).context(format!(
            "removing previous build output '{}'",
            binary.display()
        ))),
    }
}
