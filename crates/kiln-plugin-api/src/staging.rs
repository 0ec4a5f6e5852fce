//! Copies packages out of the plugins directory before they are opened.
//!
//! A plugin runs from its staged copy, so the package in the plugins
//! directory can be replaced while the old version is still loaded.

use kiln_runtime::paths::{verify_package_path, ConfinedRoot};
use kiln_runtime::{RuntimeError, RuntimeResult};
use std::path::{Path, PathBuf};
use tracing::debug;

pub struct PackageStager {
    plugins_dir: PathBuf,
    data_root: ConfinedRoot,
    max_package_bytes: u64,
}

impl PackageStager {
    pub fn new(plugins_dir: &Path, data_root: ConfinedRoot, max_package_bytes: u64) -> Self {
        Self {
            plugins_dir: plugins_dir.to_path_buf(),
            data_root,
            max_package_bytes,
        }
    }

    /// Copy `package` to `cache/<id>/<millis>-<uuid>-<file>` under the data root.
    pub fn stage(&self, plugin_id: &str, package: &Path) -> RuntimeResult<PathBuf> {
        let source = verify_package_path(&self.plugins_dir, package, self.max_package_bytes)?;
        let file_name = source
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| RuntimeError::PackageError(format!("{} has no file name", source.display())))?;

        let staged_name = format!(
            "{}-{}-{}",
            chrono::Utc::now().timestamp_millis(),
            uuid::Uuid::new_v4().simple(),
            file_name
        );
        let target = self.data_root.join(["cache", plugin_id, staged_name.as_str()])?;
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::copy(&source, &target)?;
        debug!(plugin = %plugin_id, staged = %target.display(), "Staged package");
        Ok(target)
    }

    /// Delete a staged artifact.
    pub fn discard(&self, staged: &Path) -> RuntimeResult<()> {
        self.data_root.remove_file(staged)
    }

    /// Directory holding one plugin's staged artifacts.
    pub fn cache_dir(&self, plugin_id: &str) -> RuntimeResult<PathBuf> {
        self.data_root.join(["cache", plugin_id])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kiln_runtime::{PackageBuilder, PluginManifest};
    use tempfile::TempDir;

    fn setup() -> (TempDir, PackageStager, PathBuf) {
        let dir = TempDir::new().unwrap();
        let plugins = dir.path().join("plugins");
        std::fs::create_dir_all(&plugins).unwrap();
        let manifest = PluginManifest::from_str(
            "id = \"demo\"\nname = \"Demo\"\nversion = \"1.0.0\"\nmain = \"demo.Main\"\n",
        )
        .unwrap();
        let package = PackageBuilder::new(&manifest)
            .unwrap()
            .write_to(&plugins.join("demo.kpk"))
            .unwrap();
        let root = ConfinedRoot::new(&dir.path().join("data")).unwrap();
        let stager = PackageStager::new(&plugins, root, 1024 * 1024);
        (dir, stager, package)
    }

    #[test]
    fn test_stage_and_discard() {
        let (_dir, stager, package) = setup();
        let staged = stager.stage("demo", &package).unwrap();

        assert!(staged.exists());
        assert!(staged.starts_with(stager.cache_dir("demo").unwrap()));
        assert!(staged.file_name().unwrap().to_string_lossy().ends_with("-demo.kpk"));

        stager.discard(&staged).unwrap();
        assert!(!staged.exists());
    }

    #[test]
    fn test_stage_rejects_outside_plugins_dir() {
        let (dir, stager, package) = setup();
        let outside = dir.path().join("elsewhere.kpk");
        std::fs::copy(&package, &outside).unwrap();

        assert!(matches!(
            stager.stage("demo", &outside),
            Err(RuntimeError::UnsafePath(_))
        ));
    }

    #[test]
    fn test_stage_rejects_oversized_package() {
        let (dir, _, package) = setup();
        let root = ConfinedRoot::new(&dir.path().join("data")).unwrap();
        let tiny = PackageStager::new(&dir.path().join("plugins"), root, 8);

        assert!(matches!(
            tiny.stage("demo", &package),
            Err(RuntimeError::PackageError(_))
        ));
    }
}
