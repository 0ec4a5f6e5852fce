//! Plugin manifest parsing.
//!
//! Every package carries a `plugin.toml` describing the plugin's identity,
//! entry point, dependencies and permissions:
//!
//! ```toml
//! id = "economy"
//! name = "Economy"
//! version = "1.4.0"
//! main = "economy.EconomyPlugin"
//! apiVersion = "1"
//! dependencies = ["core >=1.0 <2", { id = "chat", kind = "optional" }]
//! permissions = ["host.player.read", "host.inventory.write"]
//! ```

use crate::capability::PermissionSet;
use crate::error::{RuntimeError, RuntimeResult};
use crate::validation;
use crate::version::RUNTIME_API_VERSION;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;

/// Plugin manifest structure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PluginManifest {
    /// Unique identifier for the plugin.
    pub id: String,

    /// Human-readable name.
    pub name: String,

    /// Version string (semver, leniently parsed).
    pub version: String,

    /// Entry point path, resolved by the module loader.
    pub main: String,

    /// Runtime API version the plugin was built against.
    #[serde(rename = "apiVersion", alias = "api_version", default = "default_api_version")]
    pub api_version: String,

    /// Declared dependencies on other plugins.
    #[serde(default)]
    pub dependencies: Vec<DependencySpec>,

    /// Permission tokens requested from the host.
    #[serde(default)]
    pub permissions: Vec<String>,

    /// Plugin description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// Plugin author(s).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub authors: Vec<String>,
}

fn default_api_version() -> String {
    RUNTIME_API_VERSION.to_string()
}

/// How a dependency constrains loading.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DependencyKind {
    /// Must be present and in range; loads first.
    #[default]
    Required,
    /// Loads first when present; must be in range if present.
    Optional,
    /// Ordering hint only, honoured when it does not create a cycle.
    #[serde(alias = "softAfter", alias = "soft-after")]
    SoftAfter,
    /// Must not be present (in range) alongside this plugin.
    Conflicts,
}

impl fmt::Display for DependencyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            DependencyKind::Required => "required",
            DependencyKind::Optional => "optional",
            DependencyKind::SoftAfter => "soft_after",
            DependencyKind::Conflicts => "conflicts",
        };
        f.write_str(label)
    }
}

/// A dependency declared in a manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawDependency")]
pub struct DependencySpec {
    /// Id of the plugin depended upon.
    pub id: String,

    /// Optional comparator expression; `None` accepts any version.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,

    pub kind: DependencyKind,
}

impl DependencySpec {
    /// A required dependency with an optional range.
    pub fn required(id: impl Into<String>, version: Option<&str>) -> Self {
        Self {
            id: id.into(),
            version: version.map(str::to_string),
            kind: DependencyKind::Required,
        }
    }

    /// Parse the short string form: `"core >=1.0 <2"`.
    pub fn parse_short(raw: &str) -> Result<Self, String> {
        let trimmed = raw.trim();
        let (id, rest) = match trimmed.split_once(char::is_whitespace) {
            Some((id, rest)) => (id, rest.trim()),
            None => (trimmed, ""),
        };
        if id.is_empty() {
            return Err("dependency id cannot be empty".to_string());
        }
        Ok(Self {
            id: id.to_string(),
            version: (!rest.is_empty()).then(|| rest.to_string()),
            kind: DependencyKind::Required,
        })
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawDependency {
    Short(String),
    Full {
        id: String,
        #[serde(default, alias = "versionRange", alias = "range")]
        version: Option<String>,
        #[serde(default)]
        kind: DependencyKind,
    },
}

impl TryFrom<RawDependency> for DependencySpec {
    type Error = String;

    fn try_from(raw: RawDependency) -> Result<Self, Self::Error> {
        match raw {
            RawDependency::Short(s) => DependencySpec::parse_short(&s),
            RawDependency::Full { id, version, kind } => Ok(DependencySpec {
                id: id.trim().to_string(),
                version: version
                    .map(|v| v.trim().to_string())
                    .filter(|v| !v.is_empty()),
                kind,
            }),
        }
    }
}

impl PluginManifest {
    /// Load a manifest from a TOML file.
    pub fn from_file(path: &Path) -> RuntimeResult<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_str(&content)
    }

    /// Parse and validate a manifest from a TOML string.
    pub fn from_str(content: &str) -> RuntimeResult<Self> {
        let manifest: PluginManifest = toml::from_str(content)?;
        validation::validate(&manifest)?;
        Ok(manifest)
    }

    /// Render the manifest back to TOML.
    pub fn to_toml(&self) -> RuntimeResult<String> {
        toml::to_string(self).map_err(|e| RuntimeError::InvalidManifest(e.to_string()))
    }

    /// Get the permission set for this plugin.
    pub fn permission_set(&self) -> PermissionSet {
        PermissionSet::from_strings(&self.permissions)
    }

    /// Dependencies of a given kind.
    pub fn dependencies_of(&self, kind: DependencyKind) -> impl Iterator<Item = &DependencySpec> {
        self.dependencies.iter().filter(move |d| d.kind == kind)
    }

    /// Ids of required dependencies.
    pub fn required_ids(&self) -> Vec<String> {
        self.dependencies_of(DependencyKind::Required)
            .map(|d| d.id.clone())
            .collect()
    }
}
