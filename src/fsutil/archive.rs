//! Zip extraction for workload bundles.
//!
//! Bundle payloads are tenant-supplied, so every entry name is checked before
//! anything is written: absolute names, `..` components and names that resolve
//! through an existing symlink to somewhere outside the destination root are
//! rejected, and the whole extraction fails.

use anyhow::{bail, Context, Result};
use log::debug;
use std::fs::{self, File, OpenOptions};
use std::io;
use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};
use std::path::{Component, Path, PathBuf};
use zip::ZipArchive;

const DEFAULT_FILE_MODE: u32 = 0o644;
const DEFAULT_DIR_MODE: u32 = 0o755;

/// Extract the zip archive at `archive_path` into `dest`.
///
/// Directory entries are created with the archive's permission bits (owner
/// rwx is always kept so the rest of the tree can be written). File entries
/// get their parent directories created and are written with the archive's
/// permission bits, falling back to `0644`.
///
/// Returns the number of entries extracted. Any failing entry aborts the
/// remaining extraction.
pub fn unzip(archive_path: &Path, dest: &Path) -> Result<usize> {
    let file = File::open(archive_path)
        .with_context(|| format!("opening archive '{}'", archive_path.display()))?;
    let mut archive = ZipArchive::new(file)
        .with_context(|| format!("reading zip archive '{}'", archive_path.display()))?;

    // Validate every name up front so a hostile archive writes nothing.
    for name in archive.file_names() {
        entry_relative_path(name)?;
    }

    fs::create_dir_all(dest)
        .with_context(|| format!("creating extraction root '{}'", dest.display()))?;
    let root = dest
        .canonicalize()
        .with_context(|| format!("resolving extraction root '{}'", dest.display()))?;

    for index in 0..archive.len() {
        let mut entry = archive.by_index(index).with_context(|| {
            format!(
                "reading entry {index} of '{}'",
                archive_path.display()
            )
        })?;
        let name = entry.name().to_string();
        if entry.enclosed_name().is_none() {
            bail!("zip entry '{name}' escapes the extraction root");
        }
        let relative = entry_relative_path(&name)?;
        let target = root.join(&relative);
        let mode = entry.unix_mode().map(|m| m & 0o7777);

        if entry.is_dir() {
            create_dir_within(&root, &target)?;
            let mode = mode.unwrap_or(DEFAULT_DIR_MODE) | 0o700;
            fs::set_permissions(&target, fs::Permissions::from_mode(mode))
                .with_context(|| format!("setting permissions on '{}'", target.display()))?;
            debug!("extracted dir {}", relative.display());
            continue;
        }

        let parent = target.parent().unwrap_or(&root).to_path_buf();
        create_dir_within(&root, &parent)?;

        // Never write through a pre-existing link at the leaf.
        if let Ok(meta) = fs::symlink_metadata(&target) {
            if meta.file_type().is_symlink() {
                fs::remove_file(&target).with_context(|| {
                    format!("removing existing link '{}'", target.display())
                })?;
            }
        }

        let mode = mode.unwrap_or(DEFAULT_FILE_MODE);
        let mut out = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(mode)
            .open(&target)
            .with_context(|| format!("creating '{}'", target.display()))?;
        io::copy(&mut entry, &mut out)
            .with_context(|| format!("extracting '{name}' to '{}'", target.display()))?;
        fs::set_permissions(&target, fs::Permissions::from_mode(mode))
            .with_context(|| format!("setting permissions on '{}'", target.display()))?;
        debug!("extracted file {} ({:o})", relative.display(), mode);
    }

    Ok(archive.len())
}

/// Turn a zip entry name into a clean relative path, rejecting anything that
/// could land outside the extraction root.
pub fn entry_relative_path(name: &str) -> Result<PathBuf> {
    if name.contains('\0') {
        bail!("zip entry '{}' contains a NUL byte", name.escape_debug());
    }
    let mut clean = PathBuf::new();
    for component in Path::new(name).components() {
        match component {
            Component::Normal(part) => clean.push(part),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                bail!("zip entry '{name}' escapes the extraction root");
            }
        }
    }
    if clean.as_os_str().is_empty() {
        bail!("zip entry '{name}' has an empty path");
    }
    Ok(clean)
}

/// Create `dir` (and parents) and check that it resolves inside `root`.
fn create_dir_within(root: &Path, dir: &Path) -> Result<()> {
    fs::create_dir_all(dir).with_context(|| format!("creating '{}'", dir.display()))?;
    let resolved = dir
        .canonicalize()
        .with_context(|| format!("resolving '{}'", dir.display()))?;
    if !resolved.starts_with(root) {
        bail!(
            "'{}' resolves to '{}', outside extraction root '{}'",
            dir.display(),
            resolved.display(),
            root.display()
        );
    }
    Ok(())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::io::{Cursor, Write};
    use tempfile::TempDir;
    use zip::write::SimpleFileOptions;
    use zip::ZipWriter;

    /// Build an in-memory zip. Names ending in `/` become directory entries.
    pub(crate) fn build_zip(entries: &[(&str, &[u8], u32)]) -> Vec<u8> {
        let mut writer = ZipWriter::new(Cursor::new(Vec::new()));
        for (name, bytes, mode) in entries {
            let options = SimpleFileOptions::default().unix_permissions(*mode);
            if name.ends_with('/') {
                writer.add_directory(*name, options).unwrap();
            } else {
                writer.start_file(*name, options).unwrap();
                writer.write_all(bytes).unwrap();
            }
        }
        writer.finish().unwrap().into_inner()
    }

    fn write_zip(dir: &Path, entries: &[(&str, &[u8], u32)]) -> PathBuf {
        let path = dir.join("bundle.zip");
        fs::write(&path, build_zip(entries)).unwrap();
        path
    }

    #[test]
    fn extracts_files_and_directories() {
        let tmp = TempDir::new().unwrap();
        let zip = write_zip(
            tmp.path(),
            &[
                ("bootstrap", b"#!/bin/sh\necho hi\n", 0o755),
                ("lib/", b"", 0o755),
                ("lib/handler.js", b"exports.handler = 1;", 0o644),
                ("deep/nested/data.txt", b"data", 0o600),
            ],
        );
        let dest = tmp.path().join("runtime");

        let count = unzip(&zip, &dest).unwrap();
        assert_eq!(count, 4);
        assert_eq!(
            fs::read(dest.join("lib/handler.js")).unwrap(),
            b"exports.handler = 1;"
        );
        assert_eq!(fs::read(dest.join("deep/nested/data.txt")).unwrap(), b"data");

        let mode = fs::metadata(dest.join("bootstrap"))
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(mode & 0o777, 0o755);
        let mode = fs::metadata(dest.join("deep/nested/data.txt"))
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn rejects_parent_traversal_without_writing() {
        let tmp = TempDir::new().unwrap();
        let zip = write_zip(
            tmp.path(),
            &[
                ("ok.txt", b"fine", 0o644),
                ("../../etc/passwd", b"root::0:0::/:/bin/sh", 0o644),
            ],
        );
        let dest = tmp.path().join("a").join("b").join("runtime");

        assert!(unzip(&zip, &dest).is_err());
        assert!(!tmp.path().join("a/etc/passwd").exists());
        assert!(!dest.join("ok.txt").exists());
    }

    #[test]
    fn rejects_entries_routed_through_a_symlink() {
        let tmp = TempDir::new().unwrap();
        let outside = tmp.path().join("outside");
        fs::create_dir_all(&outside).unwrap();
        let dest = tmp.path().join("runtime");
        fs::create_dir_all(&dest).unwrap();
        std::os::unix::fs::symlink(&outside, dest.join("link")).unwrap();

        let zip = write_zip(tmp.path(), &[("link/evil", b"x", 0o644)]);
        assert!(unzip(&zip, &dest).is_err());
        assert!(!outside.join("evil").exists());
    }

    #[test]
    fn corrupt_archive_is_an_error() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("junk.zip");
        fs::write(&path, b"this is not a zip file").unwrap();
        assert!(unzip(&path, &tmp.path().join("out")).is_err());
    }

    #[test]
    fn entry_names_are_normalized_or_rejected() {
        assert_eq!(
            entry_relative_path("./lib/./a.js").unwrap(),
            PathBuf::from("lib/a.js")
        );
        assert!(entry_relative_path("/etc/passwd").is_err());
        assert!(entry_relative_path("lib/../../x").is_err());
        assert!(entry_relative_path("./").is_err());
        assert!(entry_relative_path("a\0b").is_err());
    }
}
