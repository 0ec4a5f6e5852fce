//! Package discovery.
//!
//! Plugins are discovered from a single plugins directory supplied by the
//! host. Every `*.kpk` file directly inside that directory is a candidate;
//! subdirectories are ignored.

use crate::error::{RuntimeError, RuntimeResult};
use crate::manifest::PluginManifest;
use crate::package::{self, is_package_path};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Attempts made to read a manifest that may still be mid-write.
const READ_ATTEMPTS: u32 = 5;
const READ_RETRY_DELAY: Duration = Duration::from_millis(80);

/// A candidate plugin: a validated manifest plus where its package lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PluginDescriptor {
    /// Parsed manifest.
    pub manifest: PluginManifest,

    /// Path to the package artifact in the plugins directory.
    pub package_path: PathBuf,
}

impl PluginDescriptor {
    pub fn new(manifest: PluginManifest, package_path: impl Into<PathBuf>) -> Self {
        Self {
            manifest,
            package_path: package_path.into(),
        }
    }

    /// Get the plugin ID.
    pub fn id(&self) -> &str {
        &self.manifest.id
    }

    /// Get the plugin version.
    pub fn version(&self) -> &str {
        &self.manifest.version
    }
}

/// A package that could not be turned into a descriptor.
#[derive(Debug, Clone)]
pub struct SkippedPackage {
    pub path: PathBuf,
    pub reason: String,
}

/// Result of scanning a plugins directory.
#[derive(Debug, Clone, Default)]
pub struct Discovery {
    pub descriptors: Vec<PluginDescriptor>,
    pub skipped: Vec<SkippedPackage>,
}

/// Read a package's manifest, retrying briefly when the archive is unreadable
/// (a copy into the plugins directory may still be in progress). Validation
/// failures are not retried.
pub fn read_descriptor(path: &Path) -> RuntimeResult<PluginDescriptor> {
    let mut attempt = 1;
    loop {
        match package::read_manifest(path) {
            Ok(manifest) => return Ok(PluginDescriptor::new(manifest, path)),
            Err(e @ (RuntimeError::Zip(_) | RuntimeError::Io(_))) if attempt < READ_ATTEMPTS => {
                debug!("Retrying manifest read for {:?} ({}): {}", path, attempt, e);
                attempt += 1;
                std::thread::sleep(READ_RETRY_DELAY);
            }
            Err(e) => return Err(e),
        }
    }
}

/// Discover packages in a directory, skipping ids listed in `exclude`.
///
/// The listing is sorted by file name so repeated scans see candidates in the
/// same order. When two packages declare the same id, the first one wins.
pub fn discover_in_directory(dir: &Path, exclude: &HashSet<String>) -> RuntimeResult<Discovery> {
    let mut discovery = Discovery::default();
    if !dir.exists() {
        return Ok(discovery);
    }

    let mut paths: Vec<PathBuf> = match std::fs::read_dir(dir) {
        Ok(entries) => entries
            .flatten()
            .map(|entry| entry.path())
            .filter(|path| path.is_file() && is_package_path(path))
            .collect(),
        Err(e) => {
            warn!("Failed to read plugins directory {:?}: {}", dir, e);
            return Ok(discovery);
        }
    };
    paths.sort();

    let mut seen_ids = HashSet::new();
    for path in paths {
        match read_descriptor(&path) {
            Ok(descriptor) => {
                let id = descriptor.id().to_string();
                if exclude.contains(&id) {
                    debug!("Skipping already loaded plugin: {}", id);
                    continue;
                }
                if !seen_ids.insert(id.clone()) {
                    warn!("Skipping duplicate plugin id '{}' at {:?}", id, path);
                    discovery.skipped.push(SkippedPackage {
                        path,
                        reason: format!("duplicate plugin id '{id}'"),
                    });
                    continue;
                }

                info!(
                    "Discovered plugin: {} v{} at {:?}",
                    descriptor.manifest.name, descriptor.manifest.version, path
                );
                discovery.descriptors.push(descriptor);
            }
            Err(e) => {
                warn!("Failed to load manifest from {:?}: {}", path, e);
                discovery.skipped.push(SkippedPackage {
                    path,
                    reason: e.to_string(),
                });
            }
        }
    }

    Ok(discovery)
}
