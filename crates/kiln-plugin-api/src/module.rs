//! Isolated code units.
//!
//! A [`ModuleLoader`] turns a staged package into a [`PluginModule`], and the
//! module turns the manifest's `main` entry point into a plugin instance.
//! Each load opens its own module, so instances from different loads (and
//! different versions of the same plugin) never share code-loading state.
//! The runtime drops every instance before the module that created it, and
//! every callback a plugin registers carries a [`ModuleGuard`], so the module
//! stays loaded until the last call into its code has returned.

use crate::plugin::{call_guarded, Plugin};
use kiln_runtime::package::read_manifest;
use kiln_runtime::{PluginManifest, RuntimeError, RuntimeResult};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use tracing::debug;

/// Version of the native plugin ABI. Bumped whenever [`Plugin`] changes shape.
pub const ABI_VERSION: u32 = 1;

/// Creates a fresh plugin instance.
pub type PluginFactory = Arc<dyn Fn() -> anyhow::Result<Box<dyn Plugin>> + Send + Sync>;

/// One opened code unit.
pub trait PluginModule: Send + Sync {
    /// Create the plugin named by `entry` (the manifest's `main`).
    fn instantiate(&self, entry: &str) -> RuntimeResult<Box<dyn Plugin>>;
}

/// Keeps a module loaded while code it created may still run.
///
/// Cloned into everything a plugin registers. Unloading a plugin drops the
/// runtime's handle; the module itself goes when the last guard does.
#[derive(Clone, Default)]
pub struct ModuleGuard(Option<Arc<dyn PluginModule>>);

impl ModuleGuard {
    pub fn new(module: Arc<dyn PluginModule>) -> Self {
        Self(Some(module))
    }

    /// A guard that pins nothing, for components used outside a plugin load.
    pub fn none() -> Self {
        Self(None)
    }

    pub fn is_pinned(&self) -> bool {
        self.0.is_some()
    }
}

impl fmt::Debug for ModuleGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ModuleGuard").field(&self.is_pinned()).finish()
    }
}

/// Plugin code paired with the guard of the module it came from. Fields drop
/// in order, so the code always goes before the module.
pub(crate) struct Pinned<F> {
    code: F,
    _module: ModuleGuard,
}

impl<F> Pinned<F> {
    pub(crate) fn new(code: F, module: ModuleGuard) -> Self {
        Self { code, _module: module }
    }

    pub(crate) fn code(&self) -> &F {
        &self.code
    }
}

/// Opens staged packages as modules.
pub trait ModuleLoader: Send + Sync {
    fn open(&self, staged: &Path, manifest: &PluginManifest) -> RuntimeResult<Box<dyn PluginModule>>;
}

/// Loads plugins compiled into the host binary.
///
/// Factories are registered by entry point, optionally pinned to a plugin
/// version. `open` snapshots the table, so re-registering an entry affects
/// later loads only.
#[derive(Default)]
pub struct InProcessModuleLoader {
    symbols: RwLock<HashMap<String, PluginFactory>>,
}

fn symbol_key(entry: &str, version: Option<&str>) -> String {
    match version {
        Some(v) => format!("{entry}@{v}"),
        None => entry.to_string(),
    }
}

impl InProcessModuleLoader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `factory` for every version of the plugin whose `main` is `entry`.
    pub fn register<F>(&self, entry: &str, factory: F)
    where
        F: Fn() -> anyhow::Result<Box<dyn Plugin>> + Send + Sync + 'static,
    {
        self.symbols
            .write()
            .insert(symbol_key(entry, None), Arc::new(factory));
    }

    /// Register `factory` for one version only. Takes precedence over
    /// [`register`](Self::register).
    pub fn register_version<F>(&self, entry: &str, version: &str, factory: F)
    where
        F: Fn() -> anyhow::Result<Box<dyn Plugin>> + Send + Sync + 'static,
    {
        self.symbols
            .write()
            .insert(symbol_key(entry, Some(version)), Arc::new(factory));
    }

    pub fn unregister(&self, entry: &str) -> bool {
        self.symbols.write().remove(&symbol_key(entry, None)).is_some()
    }
}

impl ModuleLoader for InProcessModuleLoader {
    fn open(&self, staged: &Path, manifest: &PluginManifest) -> RuntimeResult<Box<dyn PluginModule>> {
        let packaged = read_manifest(staged)?;
        if packaged.id != manifest.id || packaged.version != manifest.version {
            return Err(RuntimeError::ModuleLoad(format!(
                "staged package {} holds {} v{}, expected {} v{}",
                staged.display(),
                packaged.id,
                packaged.version,
                manifest.id,
                manifest.version
            )));
        }

        let symbols = self.symbols.read().clone();
        debug!(plugin = %manifest.id, symbols = symbols.len(), "Opened in-process module");
        Ok(Box::new(InProcessModule {
            plugin_id: manifest.id.clone(),
            version: manifest.version.clone(),
            symbols,
        }))
    }
}

struct InProcessModule {
    plugin_id: String,
    version: String,
    symbols: HashMap<String, PluginFactory>,
}

impl PluginModule for InProcessModule {
    fn instantiate(&self, entry: &str) -> RuntimeResult<Box<dyn Plugin>> {
        let factory = self
            .symbols
            .get(&symbol_key(entry, Some(&self.version)))
            .or_else(|| self.symbols.get(&symbol_key(entry, None)))
            .ok_or_else(|| {
                RuntimeError::ModuleLoad(format!(
                    "entry point '{}' of plugin '{}' is not registered",
                    entry, self.plugin_id
                ))
            })?;

        call_guarded(&format!("plugin '{}' constructor", self.plugin_id), || factory())
            .map_err(|e| RuntimeError::InitializationFailed(format!("{}: {:#}", self.plugin_id, e)))
    }
}

/// Export the symbols [`NativeModuleLoader`] looks for from a plugin cdylib.
///
/// ```ignore
/// kiln_plugin_api::declare_native_plugin!(MyPlugin::default);
/// ```
#[macro_export]
macro_rules! declare_native_plugin {
    ($constructor:expr) => {
        #[no_mangle]
        pub extern "C" fn kiln_plugin_abi_version() -> u32 {
            $crate::module::ABI_VERSION
        }

        #[no_mangle]
        pub extern "C" fn kiln_create_plugin() -> *mut ::std::boxed::Box<dyn $crate::Plugin> {
            let plugin: ::std::boxed::Box<dyn $crate::Plugin> = ::std::boxed::Box::new($constructor());
            ::std::boxed::Box::into_raw(::std::boxed::Box::new(plugin))
        }
    };
}

#[cfg(feature = "native")]
pub use native::NativeModuleLoader;

#[cfg(feature = "native")]
mod native {
    use super::{PluginModule, ABI_VERSION};
    use crate::plugin::Plugin;
    use kiln_runtime::package::{entry_names, read_entry, MAX_NATIVE_MODULE_BYTES, NATIVE_DIR};
    use kiln_runtime::{PluginManifest, RuntimeError, RuntimeResult};
    use libloading::{Library, Symbol};
    use std::env::consts::DLL_EXTENSION;
    use std::path::{Path, PathBuf};
    use tracing::{debug, warn};

    type AbiVersionFn = unsafe extern "C" fn() -> u32;
    type CreatePluginFn = unsafe extern "C" fn() -> *mut Box<dyn Plugin>;

    /// Loads the shared library shipped under `native/` in a package.
    ///
    /// The library is extracted next to the staged package and removed again
    /// once the module, and with it the library, is dropped.
    #[derive(Debug, Default)]
    pub struct NativeModuleLoader;

    impl NativeModuleLoader {
        pub fn new() -> Self {
            Self
        }
    }

    impl super::ModuleLoader for NativeModuleLoader {
        fn open(&self, staged: &Path, manifest: &PluginManifest) -> RuntimeResult<Box<dyn PluginModule>> {
            let suffix = format!(".{DLL_EXTENSION}");
            let entry = entry_names(staged)?
                .into_iter()
                .find(|name| name.starts_with(NATIVE_DIR) && name.ends_with(&suffix))
                .ok_or_else(|| {
                    RuntimeError::ModuleLoad(format!(
                        "package for '{}' has no {}*{} library",
                        manifest.id, NATIVE_DIR, suffix
                    ))
                })?;

            let bytes = read_entry(staged, &entry, MAX_NATIVE_MODULE_BYTES)?;
            let parent = staged.parent().unwrap_or_else(|| Path::new("."));
            let library_path = parent.join(format!(
                "{}-{}{}",
                manifest.id,
                uuid::Uuid::new_v4().simple(),
                suffix
            ));
            std::fs::write(&library_path, bytes)?;

            // SAFETY: the library comes from a package that passed staging;
            // its initialisers run here as with any dynamically linked code.
            let library = match unsafe { Library::new(&library_path) } {
                Ok(library) => library,
                Err(e) => {
                    let _ = std::fs::remove_file(&library_path);
                    return Err(RuntimeError::ModuleLoad(format!("{}: {}", manifest.id, e)));
                }
            };

            let module = NativeModule {
                plugin_id: manifest.id.clone(),
                library: Some(library),
                library_path,
            };
            module.check_abi()?;
            debug!(plugin = %manifest.id, "Opened native module");
            Ok(Box::new(module))
        }
    }

    struct NativeModule {
        plugin_id: String,
        library: Option<Library>,
        library_path: PathBuf,
    }

    impl NativeModule {
        fn library(&self) -> RuntimeResult<&Library> {
            self.library
                .as_ref()
                .ok_or_else(|| RuntimeError::ModuleLoad(format!("{}: library released", self.plugin_id)))
        }

        fn check_abi(&self) -> RuntimeResult<()> {
            // SAFETY: the symbol type matches what declare_native_plugin! exports.
            let version = unsafe {
                let symbol: Symbol<AbiVersionFn> = self
                    .library()?
                    .get(b"kiln_plugin_abi_version\0")
                    .map_err(|e| RuntimeError::ModuleLoad(format!("{}: {}", self.plugin_id, e)))?;
                symbol()
            };
            if version != ABI_VERSION {
                return Err(RuntimeError::ModuleLoad(format!(
                    "{}: plugin ABI {} does not match host ABI {}",
                    self.plugin_id, version, ABI_VERSION
                )));
            }
            Ok(())
        }
    }

    impl PluginModule for NativeModule {
        fn instantiate(&self, _entry: &str) -> RuntimeResult<Box<dyn Plugin>> {
            // SAFETY: see check_abi. The returned pointer was produced by
            // Box::into_raw in declare_native_plugin!.
            unsafe {
                let symbol: Symbol<CreatePluginFn> = self
                    .library()?
                    .get(b"kiln_create_plugin\0")
                    .map_err(|e| RuntimeError::ModuleLoad(format!("{}: {}", self.plugin_id, e)))?;
                let raw = symbol();
                if raw.is_null() {
                    return Err(RuntimeError::InitializationFailed(format!(
                        "{}: kiln_create_plugin returned null",
                        self.plugin_id
                    )));
                }
                Ok(*Box::from_raw(raw))
            }
        }
    }

    impl Drop for NativeModule {
        fn drop(&mut self) {
            drop(self.library.take());
            if let Err(e) = std::fs::remove_file(&self.library_path) {
                warn!(plugin = %self.plugin_id, "Failed to remove extracted library: {}", e);
            }
        }
    }
}
