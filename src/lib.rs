//! Artifact staging for a process supervisor.
//!
//! Given a workload descriptor (source to build, or a base64 zip bundle), this
//! crate produces a launchable executable and a deterministic filesystem
//! layout under `sys_folder/<name>/`, then hands a [`ProcessSpec`] to whatever
//! owns the process lifecycle.
//!
//! - **Preparable** - [`Preparable`] trait with source-build and bundle variants
//! - **File utilities** - lock-guarded TOML persistence, raw log/pid helpers,
//!   traversal-safe zip extraction
//! - **Toolchain** - build invocation with deadline and cancellation
//! - **Registry / config** - persisted workload descriptors and stager settings
//!
//! # Architecture
//!
//! ```text
//! Registry (TOML, locked) ──► WorkloadDescriptor
//!                                  │ preparable_for(kind)
//!                   ┌──────────────┴──────────────┐
//!           SourcePreparable               BundlePreparable
//!           toolchain::run_build           base64 → function.zip → unzip
//!                   └──────────────┬──────────────┘
//!                      prepare_bin → setup_proc / start
//!                                  │
//!                             ProcessSpec ──► Launcher (lifecycle container)
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use workload_stager::{preparable_for, CancelToken, Registry, SpawnLauncher, StagerConfig};
//!
//! let config = StagerConfig::load(Path::new("stager.toml"))?;
//! let registry = Registry::load(Path::new("registry.toml"))?;
//! let descriptor = registry.get("api").context("unknown workload")?;
//!
//! let mut workload = preparable_for(descriptor, &config)?;
//! workload.prepare_bin(&CancelToken::new())?;
//! let spec = workload.start(&mut SpawnLauncher::new())?;
//! ```

pub mod config;
pub mod fsutil;
pub mod launcher;
pub mod preparable;
pub mod registry;
pub mod toolchain;

pub use config::{BundleEnv, StagerConfig};
pub use launcher::{Launcher, SpawnLauncher};
pub use preparable::{
    preparable_for, BundlePreparable, PrepareError, Preparable, ProcessSpec, SourcePreparable,
    WorkloadPaths,
};
pub use registry::{Registry, WorkloadDescriptor, WorkloadKind};
pub use toolchain::{BuildOutput, CancelToken, Toolchain};
