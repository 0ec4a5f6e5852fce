//! Kiln package format.
//!
//! A package (`.kpk`) is a zip archive:
//!
//! ```text
//! my-plugin.kpk
//! ├── plugin.toml        manifest (required, archive root)
//! ├── native/            compiled module for the native loader (optional)
//! └── ...                free-form resources
//! ```
//!
//! The runtime never loads a package in place. It is staged into a private
//! cache first and every archive read after that goes through the staged copy.

use crate::error::{RuntimeError, RuntimeResult};
use crate::manifest::PluginManifest;
use std::fs::File;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;
use zip::write::FileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

/// Well-known manifest path inside a package.
pub const MANIFEST_ENTRY: &str = "plugin.toml";

/// File extension of package artifacts.
pub const PACKAGE_EXTENSION: &str = "kpk";

/// Directory inside a package holding the compiled native module.
pub const NATIVE_DIR: &str = "native/";

/// Largest manifest a package may carry, after decompression.
pub const MAX_MANIFEST_BYTES: u64 = 64 * 1024;

/// Largest native library a package may carry, after decompression.
pub const MAX_NATIVE_MODULE_BYTES: u64 = 256 * 1024 * 1024;

/// Whether a path looks like a package artifact.
pub fn is_package_path(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| e.eq_ignore_ascii_case(PACKAGE_EXTENSION))
        .unwrap_or(false)
}

/// Read and validate the manifest of a package.
pub fn read_manifest(path: &Path) -> RuntimeResult<PluginManifest> {
    let bytes = read_entry(path, MANIFEST_ENTRY, MAX_MANIFEST_BYTES)?;
    let content = String::from_utf8(bytes).map_err(|_| {
        RuntimeError::PackageError(format!(
            "{}: {} is not valid UTF-8",
            path.display(),
            MANIFEST_ENTRY
        ))
    })?;
    PluginManifest::from_str(&content)
}

/// Read a single entry from a package, refusing more than `max_bytes` of
/// decompressed data. The size in the entry header is not trusted.
pub fn read_entry(path: &Path, name: &str, max_bytes: u64) -> RuntimeResult<Vec<u8>> {
    let file = File::open(path)?;
    let mut archive = ZipArchive::new(file)?;
    let entry = archive.by_name(name).map_err(|e| match e {
        zip::result::ZipError::FileNotFound => {
            RuntimeError::PackageError(format!("{}: missing {}", path.display(), name))
        }
        other => RuntimeError::Zip(other),
    })?;
    let mut bytes = Vec::new();
    entry.take(max_bytes.saturating_add(1)).read_to_end(&mut bytes)?;
    if bytes.len() as u64 > max_bytes {
        return Err(RuntimeError::PackageError(format!(
            "{}: {} exceeds {} bytes",
            path.display(),
            name,
            max_bytes
        )));
    }
    Ok(bytes)
}

/// Names of all entries in a package.
pub fn entry_names(path: &Path) -> RuntimeResult<Vec<String>> {
    let file = File::open(path)?;
    let archive = ZipArchive::new(file)?;
    Ok(archive.file_names().map(str::to_string).collect())
}

/// Size and modification time of a package, used to notice edits on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PackageFingerprint {
    pub size: u64,
    pub modified_millis: u128,
}

impl PackageFingerprint {
    pub fn of(path: &Path) -> RuntimeResult<Self> {
        let metadata = std::fs::metadata(path)?;
        let modified_millis = metadata
            .modified()
            .ok()
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map(|d| d.as_millis())
            .unwrap_or(0);
        Ok(Self {
            size: metadata.len(),
            modified_millis,
        })
    }
}

/// Builds package archives. Used by tooling and tests.
#[derive(Debug, Clone)]
pub struct PackageBuilder {
    manifest: String,
    entries: Vec<(String, Vec<u8>)>,
}

impl PackageBuilder {
    /// Start a package from a manifest.
    pub fn new(manifest: &PluginManifest) -> RuntimeResult<Self> {
        Ok(Self::from_manifest_toml(manifest.to_toml()?))
    }

    /// Start a package from raw manifest text. The text is not validated, so
    /// this can also produce deliberately broken packages.
    pub fn from_manifest_toml(manifest: impl Into<String>) -> Self {
        Self {
            manifest: manifest.into(),
            entries: Vec::new(),
        }
    }

    /// Add an extra entry.
    pub fn with_entry(mut self, name: impl Into<String>, bytes: impl Into<Vec<u8>>) -> Self {
        self.entries.push((name.into(), bytes.into()));
        self
    }

    /// Write the archive. The file appears atomically at `path`.
    pub fn write_to(&self, path: &Path) -> RuntimeResult<PathBuf> {
        let tmp = path.with_extension(format!("{PACKAGE_EXTENSION}.tmp"));
        {
            let file = File::create(&tmp)?;
            let mut writer = ZipWriter::new(file);
            let options = FileOptions::default().compression_method(CompressionMethod::Deflated);

            writer.start_file(MANIFEST_ENTRY, options)?;
            writer.write_all(self.manifest.as_bytes())?;
            for (name, bytes) in &self.entries {
                writer.start_file(name.as_str(), options)?;
                writer.write_all(bytes)?;
            }
            writer.finish()?;
        }
        std::fs::rename(&tmp, path)?;
        Ok(path.to_path_buf())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const MANIFEST: &str = r#"
id = "core"
name = "Core"
version = "1.0.0"
main = "core.CorePlugin"
"#;

    #[test]
    fn test_write_and_read_manifest() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("core.kpk");

        PackageBuilder::from_manifest_toml(MANIFEST)
            .with_entry("assets/readme.txt", "hello")
            .write_to(&path)
            .unwrap();

        let manifest = read_manifest(&path).unwrap();
        assert_eq!(manifest.id, "core");
        assert_eq!(read_entry(&path, "assets/readme.txt", 16).unwrap(), b"hello");

        let names = entry_names(&path).unwrap();
        assert!(names.contains(&MANIFEST_ENTRY.to_string()));
    }

    #[test]
    fn test_missing_manifest_entry() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("empty.kpk");

        let file = File::create(&path).unwrap();
        let mut writer = ZipWriter::new(file);
        writer.start_file("other.txt", FileOptions::default()).unwrap();
        writer.write_all(b"x").unwrap();
        writer.finish().unwrap();

        assert!(matches!(
            read_manifest(&path),
            Err(RuntimeError::PackageError(_))
        ));
    }

    #[test]
    fn test_oversized_manifest_is_rejected() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("bloated.kpk");

        // Compresses to almost nothing, so only the decompressed size trips the limit.
        let padding = format!("# {}\n", "x".repeat(MAX_MANIFEST_BYTES as usize));
        PackageBuilder::from_manifest_toml(format!("{MANIFEST}{padding}"))
            .write_to(&path)
            .unwrap();
        assert!(std::fs::metadata(&path).unwrap().len() < MAX_MANIFEST_BYTES);

        let err = read_manifest(&path).unwrap_err();
        assert!(matches!(err, RuntimeError::PackageError(_)));
        assert!(err.to_string().contains("exceeds 65536 bytes"));
    }

    #[test]
    fn test_entry_at_limit_is_read() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("core.kpk");
        PackageBuilder::from_manifest_toml(MANIFEST)
            .with_entry("data.bin", vec![7u8; 32])
            .write_to(&path)
            .unwrap();

        assert_eq!(read_entry(&path, "data.bin", 32).unwrap().len(), 32);
        assert!(read_entry(&path, "data.bin", 31).is_err());
    }

    #[test]
    fn test_not_an_archive() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("garbage.kpk");
        std::fs::write(&path, b"not a zip").unwrap();

        assert!(matches!(read_manifest(&path), Err(RuntimeError::Zip(_))));
    }

    #[test]
    fn test_is_package_path() {
        assert!(is_package_path(Path::new("a/b/core.kpk")));
        assert!(is_package_path(Path::new("CORE.KPK")));
        assert!(!is_package_path(Path::new("core.zip")));
    }
}
