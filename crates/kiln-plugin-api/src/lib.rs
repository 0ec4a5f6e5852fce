//! # kiln-plugin-api
//!
//! The plugin author surface and the hosting runtime for Kiln.
//!
//! Plugins implement [`Plugin`] and receive a [`PluginContext`] when enabled.
//! Through it they can:
//!
//! - Register items, blocks, recipes and tick systems
//! - Schedule tasks, register commands, subscribe to events
//! - Expose adapters to the host and other plugins
//! - Exchange messages over plugin network channels
//! - Persist versioned, checksummed data
//! - Reach the host through a permission-checked [`HostAccess`] view
//!
//! The [`PluginRuntime`] loads packages discovered by `kiln-runtime`, gives
//! each plugin its own module from a [`ModuleLoader`], supervises it through
//! metrics and a fault budget, and replaces plugins in place with
//! transactional, rollback-capable reloads.

pub mod adapter;
pub mod commands;
pub mod config;
pub mod context;
pub mod diagnostics;
pub mod events;
pub mod host;
pub mod metrics;
pub mod module;
pub mod network;
pub mod plugin;
pub mod rate;
pub mod registry;
pub mod reload;
pub mod runtime;
pub mod scheduler;
pub mod staging;
pub mod standalone;
pub mod storage;

pub use adapter::{invocation_expired, AdapterInvocation, AdapterResponse, AdapterSandbox, FnAdapter, ModAdapter};
pub use commands::{CommandInvocation, CommandResult};
pub use config::{AdapterSecurityConfig, ExecutionMode, PayloadPreset, RuntimeConfig};
pub use context::{PluginContext, PluginLogger};
pub use diagnostics::RuntimeDiagnostics;
pub use events::{PluginDisabled, PluginEnabled};
pub use host::{HostAccess, NoopHost, ScopedHostAccess};
pub use metrics::{AdapterOutcome, FaultBudgetStage, PluginRuntimeProfile, RuntimeMetrics};
pub use module::{InProcessModuleLoader, ModuleGuard, ModuleLoader, PluginModule};
pub use network::{ChannelSpec, MessageStatus, PluginMessage};
pub use plugin::Plugin;
pub use registry::{BlockDefinition, ItemDefinition, RecipeDefinition};
pub use reload::{ReloadReport, ReloadStatus};
pub use runtime::{LoadedInfo, PluginRuntime, PluginState};
pub use standalone::StandaloneHost;
pub use storage::{PersistentStore, StorageProvider};

#[cfg(feature = "native")]
pub use module::NativeModuleLoader;
