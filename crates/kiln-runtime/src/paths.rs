//! Path confinement and directory helpers.
//!
//! Every copy or delete the runtime performs on plugin data goes through a
//! [`ConfinedRoot`], which refuses any path that does not stay strictly below
//! its root after normalisation. Package paths are checked separately with
//! [`verify_package_path`], which canonicalises (the file must exist).

use crate::error::{RuntimeError, RuntimeResult};
use sha2::{Digest, Sha256};
use std::path::{Component, Path, PathBuf};
use walkdir::WalkDir;

/// Collapse `.` and `..` components without touching the filesystem.
/// Returns `None` when `..` would climb above the start of the path.
pub fn normalize_lexically(path: &Path) -> Option<PathBuf> {
    let mut out = PathBuf::new();
    let mut depth = 0usize;
    for component in path.components() {
        match component {
            Component::Prefix(_) | Component::RootDir => out.push(component.as_os_str()),
            Component::CurDir => {}
            Component::ParentDir => {
                if depth == 0 {
                    return None;
                }
                out.pop();
                depth -= 1;
            }
            Component::Normal(part) => {
                out.push(part);
                depth += 1;
            }
        }
    }
    Some(out)
}

/// A directory that copy/delete operations may not escape.
#[derive(Debug, Clone)]
pub struct ConfinedRoot {
    root: PathBuf,
}

impl ConfinedRoot {
    /// Create the root (if needed) and pin it to its canonical path.
    pub fn new(root: &Path) -> RuntimeResult<Self> {
        std::fs::create_dir_all(root)?;
        Ok(Self {
            root: root.canonicalize()?,
        })
    }

    pub fn path(&self) -> &Path {
        &self.root
    }

    /// Join relative segments onto the root and check the result.
    pub fn join<I, S>(&self, segments: I) -> RuntimeResult<PathBuf>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<Path>,
    {
        let mut path = self.root.clone();
        for segment in segments {
            let segment = segment.as_ref();
            if segment.is_absolute() {
                return Err(RuntimeError::UnsafePath(format!(
                    "absolute segment {} under {}",
                    segment.display(),
                    self.root.display()
                )));
            }
            path.push(segment);
        }
        self.check(&path)
    }

    /// Verify that `path` lies strictly below the root. Returns the
    /// normalised path.
    pub fn check(&self, path: &Path) -> RuntimeResult<PathBuf> {
        let absolute = if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.root.join(path)
        };
        let normalized = normalize_lexically(&absolute).ok_or_else(|| self.escape(path))?;

        let resolved = resolve_existing_prefix(&normalized);

        if resolved == self.root || !resolved.starts_with(&self.root) {
            return Err(self.escape(path));
        }
        Ok(normalized)
    }

    /// Recursively copy `source` into `target`. Both must be inside the root.
    /// A missing source is treated as an empty directory.
    pub fn copy_dir(&self, source: &Path, target: &Path) -> RuntimeResult<()> {
        let source = self.check(source)?;
        let target = self.check(target)?;
        std::fs::create_dir_all(&target)?;
        if !source.exists() {
            return Ok(());
        }

        for entry in WalkDir::new(&source).min_depth(1).follow_links(false) {
            let entry = entry.map_err(|e| RuntimeError::Io(e.into()))?;
            let relative = entry
                .path()
                .strip_prefix(&source)
                .map_err(|_| self.escape(entry.path()))?;
            let destination = self.check(&target.join(relative))?;

            if entry.file_type().is_dir() {
                std::fs::create_dir_all(&destination)?;
            } else if entry.file_type().is_file() {
                if let Some(parent) = destination.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                std::fs::copy(entry.path(), &destination)?;
            }
            // Symlinks are not carried into checkpoints.
        }
        Ok(())
    }

    /// Replace `target` with a copy of `source`.
    pub fn replace_dir(&self, source: &Path, target: &Path) -> RuntimeResult<()> {
        self.remove_dir(target)?;
        self.copy_dir(source, target)
    }

    /// Remove a directory tree inside the root. Missing paths are fine.
    pub fn remove_dir(&self, target: &Path) -> RuntimeResult<()> {
        let target = self.check(target)?;
        match std::fs::remove_dir_all(&target) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Remove a single file inside the root. Missing files are fine.
    pub fn remove_file(&self, target: &Path) -> RuntimeResult<()> {
        let target = self.check(target)?;
        match std::fs::remove_file(&target) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn escape(&self, path: &Path) -> RuntimeError {
        RuntimeError::UnsafePath(format!(
            "{} escapes {}",
            path.display(),
            self.root.display()
        ))
    }
}

/// Canonicalise the deepest ancestor of `path` that exists and re-append the
/// rest, so a symlink anywhere in the existing prefix is followed.
fn resolve_existing_prefix(path: &Path) -> PathBuf {
    let mut missing = Vec::new();
    let mut current = path;
    loop {
        if let Ok(real) = current.canonicalize() {
            return missing.iter().rev().fold(real, |acc, part| acc.join(part));
        }
        match (current.parent(), current.file_name()) {
            (Some(parent), Some(name)) => {
                missing.push(name.to_os_string());
                current = parent;
            }
            _ => return path.to_path_buf(),
        }
    }
}

/// Check that `package` is a regular file inside `plugins_dir` whose size is
/// in `1..=max_bytes`. Returns the canonical package path.
pub fn verify_package_path(plugins_dir: &Path, package: &Path, max_bytes: u64) -> RuntimeResult<PathBuf> {
    let root = plugins_dir.canonicalize()?;
    let real = package.canonicalize().map_err(|e| {
        RuntimeError::PackageError(format!("{}: {}", package.display(), e))
    })?;

    if !real.starts_with(&root) || real == root {
        return Err(RuntimeError::UnsafePath(format!(
            "package {} is outside plugins directory {}",
            package.display(),
            root.display()
        )));
    }

    let metadata = std::fs::metadata(&real)?;
    if !metadata.is_file() {
        return Err(RuntimeError::PackageError(format!(
            "{} is not a regular file",
            package.display()
        )));
    }
    if metadata.len() == 0 || metadata.len() > max_bytes {
        return Err(RuntimeError::PackageError(format!(
            "{} has size {} outside 1..={}",
            package.display(),
            metadata.len(),
            max_bytes
        )));
    }

    Ok(real)
}

/// SHA-256 over every file (relative path + contents) below `dir`, in sorted
/// order. A missing directory hashes like an empty one.
pub fn digest_dir(dir: &Path) -> RuntimeResult<String> {
    let mut hasher = Sha256::new();
    if dir.exists() {
        for entry in WalkDir::new(dir).sort_by_file_name().follow_links(false) {
            let entry = entry.map_err(|e| RuntimeError::Io(e.into()))?;
            if !entry.file_type().is_file() {
                continue;
            }
            let relative = entry.path().strip_prefix(dir).unwrap_or(entry.path());
            hasher.update(relative.to_string_lossy().as_bytes());
            hasher.update([0u8]);
            hasher.update(std::fs::read(entry.path())?);
        }
    }
    Ok(hex::encode(hasher.finalize()))
}
