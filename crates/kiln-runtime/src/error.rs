//! Error types for the Kiln runtime.

use thiserror::Error;

/// Errors that can occur while loading, staging or running plugins.
#[derive(Error, Debug)]
pub enum RuntimeError {
    /// Plugin not found in the loaded table or on disk.
    #[error("Plugin not found: {0}")]
    PluginNotFound(String),

    /// Manifest failed to parse or validate.
    #[error("Invalid manifest: {0}")]
    InvalidManifest(String),

    /// Package archive is missing, unreadable or malformed.
    #[error("Package error: {0}")]
    PackageError(String),

    /// A plugin with the same id is already loaded.
    #[error("Plugin already loaded: {0}")]
    AlreadyLoaded(String),

    /// Plugin targets an API major version the runtime does not provide.
    #[error("Incompatible API version: {0}")]
    IncompatibleApi(String),

    /// A dependency is missing, conflicting or at the wrong version.
    #[error("Dependency error: {0}")]
    Dependency(String),

    /// A path escaped the directory it was confined to.
    #[error("Unsafe path: {0}")]
    UnsafePath(String),

    /// The isolated module could not be opened or did not export the entry point.
    #[error("Module load failed: {0}")]
    ModuleLoad(String),

    /// Plugin failed to initialize.
    #[error("Plugin initialization failed: {0}")]
    InitializationFailed(String),

    /// Persistent storage failed (checksum, backup, migration).
    #[error("Storage error: {0}")]
    Storage(String),

    /// An id was registered twice.
    #[error("{0}")]
    DuplicateRegistration(String),

    /// A registration was rejected (bad id, over budget, closed registry).
    #[error("Invalid registration: {0}")]
    InvalidRegistration(String),

    /// Configuration values are out of range.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// TOML parsing error.
    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),

    /// Zip archive error.
    #[error("Archive error: {0}")]
    Zip(#[from] zip::result::ZipError),
}

/// Result type for runtime operations.
pub type RuntimeResult<T> = std::result::Result<T, RuntimeError>;
