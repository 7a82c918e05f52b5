//! Stager configuration.
//!
//! Loaded from TOML through the locked reader. Every field has a default, so
//! an absent file or an empty document is a valid configuration:
//!
//! ```toml
//! sys_folder = "/var/lib/workload-stager"
//! build_timeout_secs = 300
//!
//! [toolchains.go]
//! program = "go"
//! args = ["build", "-o", "{out}", "{src}/."]
//!
//! [bundle]
//! task_root_var = "LAMBDA_TASK_ROOT"
//! path = "/usr/local/bin:/usr/bin"
//! ```

use crate::fsutil;
use crate::toolchain::Toolchain;
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Directory name used under the home directory when `sys_folder` is unset.
pub const DEFAULT_SYS_DIR: &str = ".workload-stager";
pub const DEFAULT_BUILD_TIMEOUT_SECS: u64 = 600;
/// Variable that tells a bootstrap where its package root is.
pub const DEFAULT_TASK_ROOT_VAR: &str = "LAMBDA_TASK_ROOT";
/// `PATH` handed to bundle workloads.
pub const DEFAULT_BUNDLE_PATH: &str = "/home/silas/.deno/bin:/usr/bin";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StagerConfig {
    /// Root under which each workload gets `sys_folder/<name>/`.
    pub sys_folder: PathBuf,
    /// Deadline for one toolchain run. `0` disables the deadline.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub build_timeout_secs: Option<u64>,
    /// Per-language toolchains; these override the built-in ones.
    pub toolchains: BTreeMap<String, Toolchain>,
    pub bundle: BundleEnv,
}

impl Default for StagerConfig {
    fn default() -> Self {
        Self {
            sys_folder: default_sys_folder(),
            build_timeout_secs: Some(DEFAULT_BUILD_TIMEOUT_SECS),
            toolchains: BTreeMap::new(),
            bundle: BundleEnv::default(),
        }
    }
}

/// Environment contract for bundle workloads.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BundleEnv {
    pub task_root_var: String,
    pub path: String,
}

impl Default for BundleEnv {
    fn default() -> Self {
        Self {
            task_root_var: DEFAULT_TASK_ROOT_VAR.to_string(),
            path: DEFAULT_BUNDLE_PATH.to_string(),
        }
    }
}

impl StagerConfig {
    /// Load from `path`, or defaults when the file does not exist.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        fsutil::safe_read_toml(path)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        fsutil::safe_write_toml(self, path)
    }

    pub fn build_timeout(&self) -> Option<Duration> {
        self.build_timeout_secs
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs)
    }

    /// Configured toolchain for `language`, else the built-in one.
    pub fn toolchain_for(&self, language: &str) -> Option<Toolchain> {
        self.toolchains
            .get(language)
            .cloned()
            .or_else(|| Toolchain::builtin(language))
    }
}

fn default_sys_folder() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(DEFAULT_SYS_DIR)
}
