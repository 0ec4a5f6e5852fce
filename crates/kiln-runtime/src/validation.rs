//! Static manifest validation.
//!
//! Runs before any plugin code is staged. Every check is a pure function of
//! the manifest so the same input always yields the same verdict.

use crate::error::{RuntimeError, RuntimeResult};
use crate::manifest::{DependencyKind, PluginManifest};
use crate::version::{parse_version, VersionRange};
use regex::Regex;
use std::collections::HashSet;
use std::sync::OnceLock;

pub const MAX_DEPENDENCIES: usize = 32;
pub const MAX_PERMISSIONS: usize = 64;
pub const MAX_RANGE_CHARS: usize = 64;

/// Entry points may not claim a host-internal namespace.
const DISALLOWED_MAIN_PREFIXES: &[&str] = &[
    "std.",
    "core.",
    "alloc.",
    "kiln.",
    "kiln_runtime.",
    "kiln_plugin_api.",
];

static ID_RE: OnceLock<Regex> = OnceLock::new();
static NAME_RE: OnceLock<Regex> = OnceLock::new();
static MAIN_RE: OnceLock<Regex> = OnceLock::new();
static API_RE: OnceLock<Regex> = OnceLock::new();
static RANGE_RE: OnceLock<Regex> = OnceLock::new();
static PERMISSION_RE: OnceLock<Regex> = OnceLock::new();

fn id_re() -> &'static Regex {
    ID_RE.get_or_init(|| Regex::new(r"^[a-z0-9._-]{2,64}$").expect("valid id regex"))
}

fn name_re() -> &'static Regex {
    NAME_RE.get_or_init(|| Regex::new(r"^[A-Za-z0-9 _.-]{2,80}$").expect("valid name regex"))
}

fn main_re() -> &'static Regex {
    MAIN_RE.get_or_init(|| {
        Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*(\.[A-Za-z_][A-Za-z0-9_]*)+$").expect("valid main regex")
    })
}

fn api_re() -> &'static Regex {
    API_RE.get_or_init(|| Regex::new(r"^\d+(\.\d+)?$").expect("valid api regex"))
}

fn range_re() -> &'static Regex {
    RANGE_RE.get_or_init(|| Regex::new(r"^[<>=0-9.\s-]+$").expect("valid range regex"))
}

fn permission_re() -> &'static Regex {
    PERMISSION_RE.get_or_init(|| Regex::new(r"^[a-z0-9._-]{2,80}$").expect("valid permission regex"))
}

/// Whether `id` is an acceptable plugin id. Ids made only of dots are refused
/// because they would name a parent directory once joined onto a data path.
pub fn is_valid_plugin_id(id: &str) -> bool {
    id_re().is_match(id) && !id.chars().all(|c| c == '.')
}

/// Validate a manifest.
pub fn validate(manifest: &PluginManifest) -> RuntimeResult<()> {
    if !is_valid_plugin_id(&manifest.id) {
        return Err(invalid(format!(
            "plugin id '{}' must match [a-z0-9._-]{{2,64}}",
            manifest.id
        )));
    }

    if !name_re().is_match(&manifest.name) {
        return Err(invalid(format!(
            "plugin '{}': name '{}' must match [A-Za-z0-9 _.-]{{2,80}}",
            manifest.id, manifest.name
        )));
    }

    if parse_version(&manifest.version).is_none() {
        return Err(invalid(format!(
            "plugin '{}': version '{}' is not a valid version",
            manifest.id, manifest.version
        )));
    }

    validate_main(manifest)?;

    if !api_re().is_match(manifest.api_version.trim()) {
        return Err(invalid(format!(
            "plugin '{}': apiVersion '{}' must look like '1' or '1.2'",
            manifest.id, manifest.api_version
        )));
    }

    validate_dependencies(manifest)?;
    validate_permissions(manifest)?;

    Ok(())
}

fn validate_main(manifest: &PluginManifest) -> RuntimeResult<()> {
    let main = manifest.main.trim();
    if !main_re().is_match(main) {
        return Err(invalid(format!(
            "plugin '{}': main '{}' must be a dotted entry point path",
            manifest.id, manifest.main
        )));
    }

    let lowered = main.to_ascii_lowercase();
    if let Some(prefix) = DISALLOWED_MAIN_PREFIXES
        .iter()
        .find(|prefix| lowered.starts_with(*prefix))
    {
        return Err(invalid(format!(
            "plugin '{}': main '{}' uses reserved namespace '{}'",
            manifest.id, manifest.main, prefix
        )));
    }

    Ok(())
}

fn validate_dependencies(manifest: &PluginManifest) -> RuntimeResult<()> {
    if manifest.dependencies.len() > MAX_DEPENDENCIES {
        return Err(invalid(format!(
            "plugin '{}': too many dependencies ({} > {})",
            manifest.id,
            manifest.dependencies.len(),
            MAX_DEPENDENCIES
        )));
    }

    let mut seen: HashSet<(&str, DependencyKind)> = HashSet::new();
    for dep in &manifest.dependencies {
        if !is_valid_plugin_id(&dep.id) {
            return Err(invalid(format!(
                "plugin '{}': dependency id '{}' is invalid",
                manifest.id, dep.id
            )));
        }
        if dep.id == manifest.id {
            return Err(invalid(format!(
                "plugin '{}' cannot depend on itself",
                manifest.id
            )));
        }
        if !seen.insert((dep.id.as_str(), dep.kind)) {
            return Err(invalid(format!(
                "plugin '{}': duplicate {} dependency '{}'",
                manifest.id, dep.kind, dep.id
            )));
        }
        if let Some(range) = &dep.version {
            validate_range(&manifest.id, &dep.id, range)?;
        }
    }

    let required: HashSet<&str> = manifest
        .dependencies_of(DependencyKind::Required)
        .map(|d| d.id.as_str())
        .collect();
    if let Some(dep) = manifest
        .dependencies_of(DependencyKind::Conflicts)
        .find(|d| required.contains(d.id.as_str()))
    {
        return Err(invalid(format!(
            "plugin '{}': '{}' is both required and conflicting",
            manifest.id, dep.id
        )));
    }

    Ok(())
}

fn validate_range(plugin: &str, dependency: &str, range: &str) -> RuntimeResult<()> {
    if range.len() > MAX_RANGE_CHARS || !range_re().is_match(range) {
        return Err(invalid(format!(
            "plugin '{plugin}': dependency '{dependency}' has invalid version range '{range}'"
        )));
    }
    VersionRange::parse(range).map_err(|e| {
        invalid(format!(
            "plugin '{plugin}': dependency '{dependency}' has invalid version range: {e}"
        ))
    })?;
    Ok(())
}

fn validate_permissions(manifest: &PluginManifest) -> RuntimeResult<()> {
    if manifest.permissions.len() > MAX_PERMISSIONS {
        return Err(invalid(format!(
            "plugin '{}': too many permissions ({} > {})",
            manifest.id,
            manifest.permissions.len(),
            MAX_PERMISSIONS
        )));
    }

    let mut seen = HashSet::new();
    for permission in &manifest.permissions {
        if !permission_re().is_match(permission) {
            return Err(invalid(format!(
                "plugin '{}': permission '{}' is invalid",
                manifest.id, permission
            )));
        }
        if !seen.insert(permission.to_ascii_lowercase()) {
            return Err(invalid(format!(
                "plugin '{}': duplicate permission '{}'",
                manifest.id, permission
            )));
        }
    }

    Ok(())
}

fn invalid(message: String) -> RuntimeError {
    RuntimeError::InvalidManifest(message)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::DependencySpec;

    fn manifest(id: &str) -> PluginManifest {
        PluginManifest {
            id: id.to_string(),
            name: "Test Plugin".to_string(),
            version: "1.0.0".to_string(),
            main: "test.TestPlugin".to_string(),
            api_version: "1".to_string(),
            dependencies: Vec::new(),
            permissions: Vec::new(),
            description: None,
            authors: Vec::new(),
        }
    }

    #[test]
    fn test_valid_manifest() {
        assert!(validate(&manifest("test-plugin")).is_ok());
    }

    #[test]
    fn test_rejects_bad_ids() {
        for id in ["a", "UPPER", "has space", "..", "a/b"] {
            assert!(validate(&manifest(id)).is_err(), "id {id:?} should be rejected");
        }
    }

    #[test]
    fn test_rejects_reserved_main() {
        let mut m = manifest("test-plugin");
        m.main = "kiln.Runtime".to_string();
        assert!(validate(&m).is_err());

        m.main = "std.process".to_string();
        assert!(validate(&m).is_err());

        m.main = "NoDots".to_string();
        assert!(validate(&m).is_err());
    }

    #[test]
    fn test_rejects_self_and_duplicate_dependencies() {
        let mut m = manifest("test-plugin");
        m.dependencies = vec![DependencySpec::required("test-plugin", None)];
        assert!(validate(&m).is_err());

        m.dependencies = vec![
            DependencySpec::required("core", None),
            DependencySpec::required("core", Some(">=1")),
        ];
        assert!(validate(&m).is_err());
    }

    #[test]
    fn test_rejects_bad_ranges() {
        let mut m = manifest("test-plugin");
        m.dependencies = vec![DependencySpec::required("core", Some("^1.0"))];
        assert!(validate(&m).is_err());

        m.dependencies = vec![DependencySpec::required("core", Some(">="))];
        assert!(validate(&m).is_err());

        m.dependencies = vec![DependencySpec::required("core", Some(">=1.0 <2.0"))];
        assert!(validate(&m).is_ok());
    }

    #[test]
    fn test_count_ceilings() {
        let mut m = manifest("test-plugin");
        m.dependencies = (0..=MAX_DEPENDENCIES)
            .map(|i| DependencySpec::required(format!("dep-{i}"), None))
            .collect();
        assert!(validate(&m).is_err());

        let mut m = manifest("test-plugin");
        m.permissions = (0..=MAX_PERMISSIONS).map(|i| format!("perm.{i}")).collect();
        assert!(validate(&m).is_err());
    }

    #[test]
    fn test_rejects_duplicate_permissions() {
        let mut m = manifest("test-plugin");
        m.permissions = vec!["host.world.read".into(), "host.world.read".into()];
        assert!(validate(&m).is_err());
    }
}
