//! File utilities shared by the stager and the supervisor around it.
//!
//! Two classes of file live under the supervisor's control:
//!
//! - **Shared structured files** (the workload registry, the stager config).
//!   These are only touched through [`safe_read_toml`], [`safe_write_toml`]
//!   and [`update_toml`], which serialize access with an exclusive advisory
//!   lock on a sidecar `<file>.lock`.
//! - **Private files** (a workload's pid file and stdout/stderr logs). These
//!   use the raw helpers [`write_file`], [`open_append`] and [`delete_file`]
//!   with no locking at all.
//!
//! Archive extraction for bundles lives in [`archive`].

pub mod archive;

use anyhow::{Context, Result};
use fs2::FileExt;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::ffi::OsString;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};

/// Permission bits for files created by the raw helpers and the locked writer.
pub const FILE_MODE: u32 = 0o660;

/// Exclusive advisory lock keyed by a target file path.
///
/// The lock lives on `<target>.lock` rather than on the target itself, so the
/// target can be replaced by rename while the lock is held. Dropping the guard
/// releases the lock. The lock file is left in place: unlinking it while
/// another caller is blocked on it would let a third caller lock a fresh inode
/// at the same path.
#[derive(Debug)]
pub struct FileLock {
    file: File,
    path: PathBuf,
}

impl FileLock {
    /// Block until the lock for `target` is held.
    pub fn acquire(target: &Path) -> Result<Self> {
        let path = lock_path_for(target);
        ensure_parent_dir(&path)?;

        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .mode(FILE_MODE)
            .open(&path)
            .with_context(|| format!("opening lock file '{}'", path.display()))?;

        file.lock_exclusive()
            .with_context(|| format!("locking '{}'", path.display()))?;

        Ok(Self { file, path })
    }

    /// Path of the sidecar lock file.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

/// Sidecar lock path for `target`: the same path with `.lock` appended.
pub fn lock_path_for(target: &Path) -> PathBuf {
    with_suffix(target, ".lock")
}

/// Append `suffix` to the final component of `path` (`a/b.toml` + `.lock`
/// gives `a/b.toml.lock`).
pub fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut raw: OsString = path.as_os_str().to_owned();
    raw.push(suffix);
    PathBuf::from(raw)
}

/// Decode the TOML document at `path` while holding its lock.
pub fn safe_read_toml<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let _lock = FileLock::acquire(path)?;
    read_toml_unlocked(path)
}

/// Encode `value` as TOML and replace the file at `path` while holding its lock.
///
/// The document is written to a temporary file in the same directory, synced,
/// and renamed over the target, so a crash mid-write leaves either the old or
/// the new document, never a truncated one.
pub fn safe_write_toml<T: Serialize>(value: &T, path: &Path) -> Result<()> {
    let _lock = FileLock::acquire(path)?;
    write_toml_unlocked(value, path)
}

/// Read-modify-write the TOML document at `path` under a single lock span.
///
/// A missing file is treated as `T::default()`. The document is only written
/// back when `f` succeeds.
pub fn update_toml<T, R, F>(path: &Path, f: F) -> Result<R>
where
    T: DeserializeOwned + Serialize + Default,
    F: FnOnce(&mut T) -> Result<R>,
{
    let _lock = FileLock::acquire(path)?;
    let mut value = if path.exists() {
        read_toml_unlocked(path)?
    } else {
        T::default()
    };
    let result = f(&mut value)?;
    write_toml_unlocked(&value, path)?;
    Ok(result)
}

fn read_toml_unlocked<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let text = fs::read_to_string(path)
        .with_context(|| format!("reading '{}'", path.display()))?;
    toml::from_str(&text).with_context(|| format!("parsing TOML '{}'", path.display()))
}

fn write_toml_unlocked<T: Serialize>(value: &T, path: &Path) -> Result<()> {
    let text = toml::to_string(value)
        .with_context(|| format!("encoding TOML for '{}'", path.display()))?;
    write_atomic(path, text.as_bytes())
}

/// Write `bytes` to a temp sibling of `path`, fsync it, and rename into place.
///
/// Callers writing shared files must hold the [`FileLock`] for `path`; the temp
/// name is only unique per process.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    ensure_parent_dir(path)?;
    let tmp = temp_sibling(path);

    let mut file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(FILE_MODE)
        .open(&tmp)
        .with_context(|| format!("creating temp file '{}'", tmp.display()))?;
    file.write_all(bytes)
        .with_context(|| format!("writing temp file '{}'", tmp.display()))?;
    file.sync_all()
        .with_context(|| format!("syncing temp file '{}'", tmp.display()))?;
    drop(file);

    if let Err(err) = fs::rename(&tmp, path) {
        let _ = fs::remove_file(&tmp);
        return Err(err).with_context(|| {
            format!("renaming '{}' -> '{}'", tmp.display(), path.display())
        });
    }
    Ok(())
}

fn temp_sibling(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "file".to_string());
    let tmp_name = format!(".{name}.tmp-{}", std::process::id());
    match path.parent() {
        Some(parent) => parent.join(tmp_name),
        None => PathBuf::from(tmp_name),
    }
}

fn ensure_parent_dir(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)
                .with_context(|| format!("creating directory '{}'", parent.display()))?;
        }
    }
    Ok(())
}

/// Write `bytes` to `path`, creating it with [`FILE_MODE`] or truncating it.
pub fn write_file(path: &Path, bytes: &[u8]) -> Result<()> {
    let mut file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(FILE_MODE)
        .open(path)
        .with_context(|| format!("opening '{}' for write", path.display()))?;
    file.write_all(bytes)
        .with_context(|| format!("writing '{}'", path.display()))?;
    Ok(())
}

/// Open `path` for appending, creating it if needed. Used for process logs.
pub fn open_append(path: &Path) -> Result<File> {
    OpenOptions::new()
        .read(true)
        .append(true)
        .create(true)
        .mode(FILE_MODE)
        .open(path)
        .with_context(|| format!("opening '{}' for append", path.display()))
}

/// Remove the file at `path`. A missing file is an error.
pub fn delete_file(path: &Path) -> Result<()> {
    fs::metadata(path).with_context(|| format!("inspecting '{}'", path.display()))?;
    fs::remove_file(path).with_context(|| format!("removing '{}'", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use std::collections::BTreeMap;
    use std::sync::{Arc, Barrier};
    use std::thread;
    use tempfile::TempDir;

    #[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
    struct Doc {
        owner: String,
        entries: BTreeMap<String, String>,
    }

    #[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
    struct Marker {
        writer: usize,
        payload: String,
    }

    fn marker(writer: usize) -> Marker {
        Marker {
            writer,
            payload: format!("w{writer}-").repeat(2048),
        }
    }

    #[test]
    fn toml_roundtrip_through_locked_helpers() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("registry.toml");

        let mut doc = Doc {
            owner: "supervisor".to_string(),
            ..Doc::default()
        };
        doc.entries.insert("api".into(), "bundle".into());
        doc.entries.insert("worker".into(), "source".into());

        safe_write_toml(&doc, &path).unwrap();
        let back: Doc = safe_read_toml(&path).unwrap();
        assert_eq!(back, doc);
        assert!(lock_path_for(&path).exists());
    }

    #[test]
    fn write_leaves_no_temp_files() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("state.toml");
        safe_write_toml(&marker(1), &path).unwrap();
        safe_write_toml(&marker(2), &path).unwrap();

        let mut names: Vec<String> = fs::read_dir(tmp.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        assert_eq!(names, vec!["state.toml", "state.toml.lock"]);
    }

    #[test]
    fn read_missing_file_is_an_error() {
        let tmp = TempDir::new().unwrap();
        let result: Result<Doc> = safe_read_toml(&tmp.path().join("absent.toml"));
        assert!(result.is_err());
    }

    #[test]
    fn read_malformed_file_is_an_error() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("bad.toml");
        fs::write(&path, "owner = [unterminated").unwrap();
        let result: Result<Doc> = safe_read_toml(&path);
        assert!(result.is_err());
    }

    #[test]
    fn concurrent_writers_never_interleave() {
        let tmp = TempDir::new().unwrap();
        let path = Arc::new(tmp.path().join("shared.toml"));
        let writers = 8;
        let barrier = Arc::new(Barrier::new(writers));

        let handles: Vec<_> = (0..writers)
            .map(|id| {
                let path = Arc::clone(&path);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    for _ in 0..5 {
                        safe_write_toml(&marker(id), &path).unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let seen: Marker = safe_read_toml(&path).unwrap();
        assert!(seen.writer < writers);
        assert_eq!(seen, marker(seen.writer));
    }

    #[test]
    fn update_holds_lock_across_read_and_write() {
        let tmp = TempDir::new().unwrap();
        let path = Arc::new(tmp.path().join("counter.toml"));

        let handles: Vec<_> = (0..6)
            .map(|id| {
                let path = Arc::clone(&path);
                thread::spawn(move || {
                    update_toml(&path, |doc: &mut Doc| {
                        doc.entries.insert(format!("k{id}"), id.to_string());
                        Ok(())
                    })
                    .unwrap();
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let doc: Doc = safe_read_toml(&path).unwrap();
        assert_eq!(doc.entries.len(), 6);
    }

    #[test]
    fn update_does_not_write_when_closure_fails() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("doc.toml");
        let result = update_toml(&path, |_doc: &mut Doc| -> Result<()> {
            anyhow::bail!("rejected")
        });
        assert!(result.is_err());
        assert!(!path.exists());
    }

    #[test]
    fn raw_helpers_write_append_and_delete() {
        let tmp = TempDir::new().unwrap();
        let pid = tmp.path().join("svc.pid");
        write_file(&pid, b"41").unwrap();
        write_file(&pid, b"42").unwrap();
        assert_eq!(fs::read_to_string(&pid).unwrap(), "42");

        let out = tmp.path().join("svc.out");
        {
            let mut f = open_append(&out).unwrap();
            f.write_all(b"first\n").unwrap();
        }
        {
            let mut f = open_append(&out).unwrap();
            f.write_all(b"second\n").unwrap();
        }
        assert_eq!(fs::read_to_string(&out).unwrap(), "first\nsecond\n");

        delete_file(&pid).unwrap();
        assert!(!pid.exists());
        assert!(delete_file(&pid).is_err());
    }

    #[test]
    fn suffix_is_appended_to_the_file_name() {
        assert_eq!(
            with_suffix(Path::new("/srv/app/app"), ".pid"),
            PathBuf::from("/srv/app/app.pid")
        );
        assert_eq!(
            lock_path_for(Path::new("reg.toml")),
            PathBuf::from("reg.toml.lock")
        );
    }
}
