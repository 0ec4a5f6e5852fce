//! Runtime-wide command registry.
//!
//! Command names are unique across every loaded plugin. Each command remembers
//! its owner so everything a plugin registered can be dropped when it unloads.

use crate::module::{ModuleGuard, Pinned};
use crate::plugin::call_guarded;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use kiln_runtime::{RuntimeError, RuntimeResult};
use serde::Serialize;
use std::sync::Arc;

/// Who ran a command and with what arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandInvocation {
    pub sender: String,
    pub args: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CommandResult {
    pub success: bool,
    pub message: String,
}

impl CommandResult {
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
        }
    }
}

pub type CommandAction = Arc<dyn Fn(&CommandInvocation) -> anyhow::Result<CommandResult> + Send + Sync>;

struct RegisteredCommand {
    owner: String,
    description: String,
    action: CommandAction,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CommandInfo {
    pub name: String,
    pub owner: String,
    pub description: String,
}

/// What happened when a command ran.
pub struct CommandExecution {
    /// Owning plugin, if the command exists.
    pub owner: Option<String>,
    pub result: CommandResult,
    /// Whether the action itself failed (returned an error or panicked).
    pub faulted: bool,
}

#[derive(Default)]
pub struct CommandRegistry {
    commands: DashMap<String, RegisteredCommand>,
}

impl CommandRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, owner: &str, name: &str, description: &str, action: CommandAction) -> RuntimeResult<()> {
        let name = name.trim().to_ascii_lowercase();
        if name.is_empty() || name.len() > 32 || name.contains(char::is_whitespace) {
            return Err(RuntimeError::InvalidRegistration(format!(
                "command name '{}' in plugin '{}' must be 1..=32 characters without spaces",
                name, owner
            )));
        }
        match self.commands.entry(name) {
            Entry::Occupied(entry) => Err(RuntimeError::DuplicateRegistration(format!(
                "Duplicate command '{}' in plugin '{}' (registered by '{}')",
                entry.key(),
                owner,
                entry.get().owner
            ))),
            Entry::Vacant(entry) => {
                entry.insert(RegisteredCommand {
                    owner: owner.to_string(),
                    description: description.to_string(),
                    action,
                });
                Ok(())
            }
        }
    }

    /// Run a command. Unknown names and failing actions produce an error result.
    pub fn execute(&self, name: &str, invocation: &CommandInvocation) -> CommandExecution {
        let key = name.trim().to_ascii_lowercase();
        let Some((owner, action)) = self
            .commands
            .get(&key)
            .map(|c| (c.owner.clone(), Arc::clone(&c.action)))
        else {
            return CommandExecution {
                owner: None,
                result: CommandResult::error(format!("Unknown command '{name}'")),
                faulted: false,
            };
        };

        match call_guarded(&format!("command '{key}'"), || action(invocation)) {
            Ok(result) => CommandExecution {
                owner: Some(owner),
                result,
                faulted: false,
            },
            Err(e) => CommandExecution {
                owner: Some(owner),
                result: CommandResult::error(format!("Command '{key}' failed: {e}")),
                faulted: true,
            },
        }
    }

    pub fn list(&self) -> Vec<CommandInfo> {
        let mut commands: Vec<CommandInfo> = self
            .commands
            .iter()
            .map(|c| CommandInfo {
                name: c.key().clone(),
                owner: c.owner.clone(),
                description: c.description.clone(),
            })
            .collect();
        commands.sort_by(|a, b| a.name.cmp(&b.name));
        commands
    }

    /// Drop every command owned by `owner`.
    pub fn remove_plugin(&self, owner: &str) -> usize {
        let before = self.commands.len();
        self.commands.retain(|_, c| c.owner != owner);
        before - self.commands.len()
    }
}

/// A plugin's handle on the command registry.
#[derive(Clone)]
pub struct PluginCommands {
    plugin_id: String,
    registry: Arc<CommandRegistry>,
    module: ModuleGuard,
}

impl PluginCommands {
    pub fn new(plugin_id: impl Into<String>, registry: Arc<CommandRegistry>) -> Self {
        Self {
            plugin_id: plugin_id.into(),
            registry,
            module: ModuleGuard::none(),
        }
    }

    pub fn with_module(mut self, module: ModuleGuard) -> Self {
        self.module = module;
        self
    }

    pub fn register<F>(&self, name: &str, description: &str, action: F) -> RuntimeResult<()>
    where
        F: Fn(&CommandInvocation) -> anyhow::Result<CommandResult> + Send + Sync + 'static,
    {
        let pinned = Pinned::new(action, self.module.clone());
        let action: CommandAction = Arc::new(move |invocation: &CommandInvocation| (pinned.code())(invocation));
        self.registry.register(&self.plugin_id, name, description, action)
    }

    /// Commands this plugin registered.
    pub fn registered(&self) -> Vec<CommandInfo> {
        self.registry
            .list()
            .into_iter()
            .filter(|c| c.owner == self.plugin_id)
            .collect()
    }
}
