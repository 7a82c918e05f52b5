//! Handoff to the process-lifecycle container.
//!
//! The stager stops at a [`ProcessSpec`]. Whatever owns the process after
//! that (restarts, signals, status) implements [`Launcher`].
//! [`SpawnLauncher`] is the minimal implementation: it spawns once, wires the
//! log files, records the pid, and keeps the [`Child`] handles for the caller
//! to reap. It does not monitor anything.

use crate::fsutil;
use crate::preparable::ProcessSpec;
use anyhow::{Context, Result};
use log::info;
use std::io;
use std::os::unix::process::CommandExt;
use std::process::{Child, Command, Stdio};

/// Start capability of the lifecycle container.
pub trait Launcher {
    /// Spawn the process described by `spec` and return its pid.
    fn launch(&mut self, spec: &ProcessSpec) -> Result<u32>;
}

#[derive(Debug, Default)]
pub struct SpawnLauncher {
    children: Vec<Child>,
}

impl SpawnLauncher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Hand over the spawned children; the caller becomes responsible for
    /// waiting on them.
    pub fn into_children(self) -> Vec<Child> {
        self.children
    }
}

impl Launcher for SpawnLauncher {
    fn launch(&mut self, spec: &ProcessSpec) -> Result<u32> {
        let stdout = fsutil::open_append(&spec.out_file)?;
        let stderr = fsutil::open_append(&spec.err_file)?;

        let mut command = Command::new(&spec.command);
        command
            .args(&spec.args)
            .envs(spec.envs.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .stdout(stdout)
            .stderr(stderr);
        if let Some(dir) = &spec.working_dir {
            command.current_dir(dir);
        }
        // SAFETY: setsid(2) is async-signal-safe and touches no parent state.
        unsafe {
            command.pre_exec(|| {
                if libc::setsid() == -1 {
                    return Err(io::Error::last_os_error());
                }
                Ok(())
            });
        }

        let child = command
            .spawn()
            .with_context(|| format!("spawning '{}'", spec.command.display()))?;
        let pid = child.id();
        fsutil::write_file(&spec.pid_file, pid.to_string().as_bytes())?;
        info!("launched '{}' as pid {pid}", spec.name);

        self.children.push(child);
        Ok(pid)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::fs;
    use std::path::{Path, PathBuf};
    use tempfile::TempDir;

    /// Records specs instead of spawning.
    #[derive(Debug, Default)]
    pub(crate) struct RecordingLauncher {
        pub(crate) launched: Vec<ProcessSpec>,
    }

    impl RecordingLauncher {
        pub(crate) const PID: u32 = 4242;
    }

    impl Launcher for RecordingLauncher {
        fn launch(&mut self, spec: &ProcessSpec) -> Result<u32> {
            self.launched.push(spec.clone());
            Ok(Self::PID)
        }
    }

    fn spec(dir: &Path, command: PathBuf) -> ProcessSpec {
        ProcessSpec {
            name: "echo".to_string(),
            command,
            args: vec!["one".to_string(), "two".to_string()],
            envs: vec![("GREETING".to_string(), "hello".to_string())],
            working_dir: Some(dir.to_path_buf()),
            workload_dir: dir.to_path_buf(),
            pid_file: dir.join("echo.pid"),
            out_file: dir.join("echo.out"),
            err_file: dir.join("echo.err"),
            keep_alive: false,
            pid: None,
        }
    }

    #[test]
    fn spawn_launcher_wires_logs_env_and_pid() {
        let tmp = TempDir::new().unwrap();
        let mut spec = spec(tmp.path(), PathBuf::from("/bin/sh"));
        spec.args = vec![
            "-c".to_string(),
            "echo \"$GREETING $0 $1 $(pwd -P)\"; echo oops >&2".to_string(),
            "one".to_string(),
            "two".to_string(),
        ];

        let mut launcher = SpawnLauncher::new();
        let pid = launcher.launch(&spec).unwrap();
        for mut child in launcher.into_children() {
            assert!(child.wait().unwrap().success());
        }

        assert_eq!(fs::read_to_string(&spec.pid_file).unwrap(), pid.to_string());
        let cwd = tmp.path().canonicalize().unwrap();
        assert_eq!(
            fs::read_to_string(&spec.out_file).unwrap(),
            format!("hello one two {}\n", cwd.display())
        );
        assert_eq!(fs::read_to_string(&spec.err_file).unwrap(), "oops\n");
    }

    #[test]
    fn missing_command_fails_without_pid_file() {
        let tmp = TempDir::new().unwrap();
        let spec = spec(tmp.path(), tmp.path().join("absent"));
        let mut launcher = SpawnLauncher::new();
        assert!(launcher.launch(&spec).is_err());
        assert!(!spec.pid_file.exists());
    }
}
