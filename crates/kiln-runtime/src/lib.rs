//! # kiln-runtime
//!
//! Plugin-independent building blocks of the Kiln plugin host.
//!
//! This crate provides:
//! - Plugin manifest parsing and static validation
//! - Lenient semantic versions, version ranges and the API compatibility gate
//! - The `.kpk` package format and plugin discovery
//! - Dependency resolution into a safe load order
//! - Permission tokens
//! - Path confinement for everything the runtime copies or deletes
//!
//! ## Package Structure
//!
//! Packages are zip archives containing:
//! - `plugin.toml` - Plugin identity, entry point, dependencies, permissions
//! - `native/` - Compiled module (optional, for the native loader)
//!
//! ## Security Model
//!
//! Plugins declare the permission tokens they need in their manifest. The
//! hosting layer (`kiln-plugin-api`) denies every host call whose token is
//! not declared.

pub mod capability;
pub mod discovery;
pub mod error;
pub mod manifest;
pub mod package;
pub mod paths;
pub mod resolver;
pub mod validation;
pub mod version;

pub use capability::{HostPermission, PermissionSet};
pub use discovery::{discover_in_directory, read_descriptor, Discovery, PluginDescriptor};
pub use error::{RuntimeError, RuntimeResult};
pub use manifest::{DependencyKind, DependencySpec, PluginManifest};
pub use package::{PackageBuilder, PackageFingerprint};
pub use paths::ConfinedRoot;
pub use resolver::{resolve, DependencyDiagnostic, DiagnosticCode, ResolutionResult};
pub use version::{is_api_compatible, VersionRange, RUNTIME_API_VERSION};
