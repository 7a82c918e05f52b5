use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use workload_stager::config::DEFAULT_SYS_DIR;
use workload_stager::{
    preparable_for, CancelToken, Preparable, ProcessSpec, Registry, SpawnLauncher, StagerConfig,
    WorkloadDescriptor, WorkloadKind,
};

const CONFIG_ENV: &str = "WORKLOAD_STAGER_CONFIG";
const CONFIG_FILENAME: &str = "config.toml";

fn usage() -> &'static str {
    "Usage:
  workload-stager list <registry>
  workload-stager add-source <registry> <name> <source_dir> [language]
  workload-stager add-bundle <registry> <name> <bundle.zip>
  workload-stager remove <registry> <name>
  workload-stager prepare <registry> <name>
  workload-stager setup <registry> <name>
  workload-stager start <registry> <name>

Config is read from $WORKLOAD_STAGER_CONFIG or ~/.workload-stager/config.toml"
}

fn main() -> Result<()> {
    env_logger::init();
    let args: Vec<String> = env::args().skip(1).collect();

    match args.as_slice() {
        [cmd, registry] if cmd == "list" => list(Path::new(registry)),
        [cmd, registry, name, source_dir] if cmd == "add-source" => {
            add_source(Path::new(registry), name, Path::new(source_dir), "go")
        }
        [cmd, registry, name, source_dir, language] if cmd == "add-source" => {
            add_source(Path::new(registry), name, Path::new(source_dir), language)
        }
        [cmd, registry, name, bundle] if cmd == "add-bundle" => {
            add_bundle(Path::new(registry), name, Path::new(bundle))
        }
        [cmd, registry, name] if cmd == "remove" => remove(Path::new(registry), name),
        [cmd, registry, name] if cmd == "prepare" => {
            let mut workload = load_workload(Path::new(registry), name)?;
            prepare(workload.as_mut())
        }
        [cmd, registry, name] if cmd == "setup" => {
            let mut workload = load_workload(Path::new(registry), name)?;
            prepare(workload.as_mut())?;
            print_spec(&workload.setup_proc()?)
        }
        [cmd, registry, name] if cmd == "start" => {
            let mut workload = load_workload(Path::new(registry), name)?;
            prepare(workload.as_mut())?;
            let mut launcher = SpawnLauncher::new();
            let spec = workload.start(&mut launcher)?;
            print_spec(&spec)
        }
        _ => bail!(usage()),
    }
}

fn config_path() -> PathBuf {
    if let Some(path) = env::var_os(CONFIG_ENV) {
        return PathBuf::from(path);
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(DEFAULT_SYS_DIR)
        .join(CONFIG_FILENAME)
}

fn load_workload(registry: &Path, name: &str) -> Result<Box<dyn Preparable>> {
    let config_path = config_path();
    let config = StagerConfig::load(&config_path)
        .with_context(|| format!("loading config '{}'", config_path.display()))?;
    let registry_doc = Registry::load(registry)
        .with_context(|| format!("loading registry '{}'", registry.display()))?;
    let descriptor = registry_doc.get(name).with_context(|| {
        format!(
            "workload '{name}' is not registered in '{}'",
            registry.display()
        )
    })?;
    Ok(preparable_for(descriptor, &config)?)
}

fn prepare(workload: &mut dyn Preparable) -> Result<()> {
    println!("[{}] preparing...", workload.identifier());
    match workload.prepare_bin(&CancelToken::new()) {
        Ok(output) => {
            if !output.is_empty() {
                println!("{output}");
            }
            if let Some(command) = workload.command() {
                println!("[{}] ready: {}", workload.identifier(), command.display());
            }
            Ok(())
        }
        Err(err) if err.output().is_some() => {
            // Compiler output goes to the user verbatim.
            eprintln!("{}", err.detailed());
            bail!("build failed for '{}'", workload.identifier())
        }
        Err(err) => Err(err.into()),
    }
}

fn print_spec(spec: &ProcessSpec) -> Result<()> {
    let json = serde_json::to_string_pretty(spec).context("encoding process spec")?;
    println!("{json}");
    Ok(())
}

fn list(registry: &Path) -> Result<()> {
    let registry = Registry::load(registry)?;
    for workload in &registry.workloads {
        let kind = match &workload.kind {
            WorkloadKind::Source {
                source_path,
                language,
            } => format!("source ({language}) {}", source_path.display()),
            WorkloadKind::Bundle { bundle_data } => {
                format!("bundle ({} base64 bytes)", bundle_data.len())
            }
        };
        let keep_alive = if workload.keep_alive { " keep-alive" } else { "" };
        println!("{}\t{kind}{keep_alive}", workload.name);
    }
    Ok(())
}

fn add_source(registry: &Path, name: &str, source_dir: &Path, language: &str) -> Result<()> {
    if !source_dir.is_dir() {
        bail!("source directory not found: {}", source_dir.display());
    }
    let source_path = source_dir
        .canonicalize()
        .with_context(|| format!("resolving '{}'", source_dir.display()))?;
    register(
        registry,
        WorkloadDescriptor {
            name: name.to_string(),
            kind: WorkloadKind::Source {
                source_path,
                language: language.to_string(),
            },
            working_dir: None,
            keep_alive: true,
            args: Vec::new(),
            envs: Vec::new(),
        },
    )
}

fn add_bundle(registry: &Path, name: &str, bundle: &Path) -> Result<()> {
    let bytes =
        fs::read(bundle).with_context(|| format!("reading bundle '{}'", bundle.display()))?;
    register(
        registry,
        WorkloadDescriptor {
            name: name.to_string(),
            kind: WorkloadKind::Bundle {
                bundle_data: STANDARD.encode(bytes),
            },
            working_dir: None,
            keep_alive: true,
            args: Vec::new(),
            envs: Vec::new(),
        },
    )
}

fn register(registry: &Path, descriptor: WorkloadDescriptor) -> Result<()> {
    let name = descriptor.name.clone();
    let replaced = Registry::update(registry, |reg| reg.upsert(descriptor))?;
    let verb = if replaced { "updated" } else { "registered" };
    println!("{verb} '{name}' in {}", registry.display());
    Ok(())
}

fn remove(registry: &Path, name: &str) -> Result<()> {
    let removed = Registry::update(registry, |reg| Ok(reg.remove(name)))?;
    if !removed {
        bail!("workload '{name}' is not registered in '{}'", registry.display());
    }
    println!("removed '{name}' from {}", registry.display());
    Ok(())
}
