//! The plugin entry point and guarded callback execution.

use crate::context::PluginContext;
use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};

/// Implemented by every plugin's main type.
///
/// `on_enable` runs once after the plugin's module is instantiated and is
/// where the plugin registers its content, systems, commands and adapters
/// through the [`PluginContext`]. `on_disable` runs when the plugin is
/// unloaded; anything registered through the context is removed by the
/// runtime afterwards, whether or not `on_disable` succeeds.
pub trait Plugin: Send + Sync {
    fn on_enable(&mut self, ctx: &PluginContext) -> anyhow::Result<()>;

    fn on_disable(&mut self, _ctx: &PluginContext) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Run plugin code, turning a panic into an error.
pub fn call_guarded<T>(label: &str, f: impl FnOnce() -> anyhow::Result<T>) -> anyhow::Result<T> {
    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(result) => result,
        Err(payload) => Err(anyhow::anyhow!("{} panicked: {}", label, panic_message(&*payload))),
    }
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
