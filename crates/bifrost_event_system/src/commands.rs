//! Command registry used by the console, backend agents and plugins.
//!
//! Command names and aliases are case-insensitive. Handlers run on the
//! dispatching thread; a handler that panics is reported as a failed
//! command instead of unwinding into the caller.

use crate::error::CommandError;
use crate::types::BackendId;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use tracing::{debug, warn};

/// Where a command invocation came from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CommandSource {
    Console,
    Backend(BackendId),
    Plugin(String),
}

/// Outcome of a command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandResult {
    pub success: bool,
    pub message: Option<String>,
}

impl CommandResult {
    pub fn success(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: Some(message.into()),
        }
    }

    pub fn empty() -> Self {
        Self {
            success: true,
            message: None,
        }
    }

    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: Some(message.into()),
        }
    }
}

/// Arguments handed to a command handler.
#[derive(Debug)]
pub struct CommandInvocation<'a> {
    /// Canonical (registered) command name
    pub name: &'a str,
    /// Name or alias exactly as the caller typed it
    pub label: &'a str,
    pub args: &'a [String],
    pub source: &'a CommandSource,
}

/// Boxed command handler.
pub type CommandHandler = Arc<dyn Fn(&CommandInvocation<'_>) -> CommandResult + Send + Sync>;

/// Public description of a registered command, used by `help`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandInfo {
    pub name: String,
    pub description: String,
    pub aliases: Vec<String>,
}

struct RegisteredCommand {
    info: CommandInfo,
    handler: CommandHandler,
}

#[derive(Default)]
struct RegistryInner {
    commands: HashMap<String, Arc<RegisteredCommand>>,
    aliases: HashMap<String, String>,
}

impl RegistryInner {
    fn resolve(&self, label: &str) -> Option<Arc<RegisteredCommand>> {
        let key = label.to_lowercase();
        let canonical = self.aliases.get(&key).unwrap_or(&key);
        self.commands.get(canonical).cloned()
    }

    fn is_taken(&self, key: &str) -> bool {
        self.commands.contains_key(key) || self.aliases.contains_key(key)
    }
}

/// Thread-safe table of named commands.
#[derive(Default)]
pub struct CommandRegistry {
    inner: RwLock<RegistryInner>,
}

impl CommandRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a command under `name` plus any number of aliases.
    ///
    /// Fails with [`CommandError::AlreadyRegistered`] if the name or any alias
    /// is already used by another command; nothing is registered in that case.
    pub fn register<F>(
        &self,
        name: &str,
        description: &str,
        aliases: &[&str],
        handler: F,
    ) -> Result<(), CommandError>
    where
        F: Fn(&CommandInvocation<'_>) -> CommandResult + Send + Sync + 'static,
    {
        let name = name.trim().to_lowercase();
        if name.is_empty() {
            return Err(CommandError::EmptyCommandLine);
        }
        let aliases: Vec<String> = aliases
            .iter()
            .map(|a| a.trim().to_lowercase())
            .filter(|a| !a.is_empty() && *a != name)
            .collect();

        let mut inner = self.inner.write();
        if inner.is_taken(&name) {
            return Err(CommandError::AlreadyRegistered(name));
        }
        if let Some(taken) = aliases.iter().find(|a| inner.is_taken(a)) {
            return Err(CommandError::AlreadyRegistered(taken.clone()));
        }

        for alias in &aliases {
            inner.aliases.insert(alias.clone(), name.clone());
        }
        inner.commands.insert(
            name.clone(),
            Arc::new(RegisteredCommand {
                info: CommandInfo {
                    name: name.clone(),
                    description: description.to_string(),
                    aliases,
                },
                handler: Arc::new(handler),
            }),
        );
        debug!("Registered command '{}'", name);
        Ok(())
    }

    /// Removes a command (looked up by name or alias) together with its aliases.
    pub fn unregister(&self, label: &str) -> bool {
        let mut inner = self.inner.write();
        let Some(command) = inner.resolve(label) else {
            return false;
        };
        for alias in &command.info.aliases {
            inner.aliases.remove(alias);
        }
        inner.commands.remove(&command.info.name).is_some()
    }

    /// Runs a command by name or alias.
    pub fn dispatch(
        &self,
        label: &str,
        args: &[String],
        source: &CommandSource,
    ) -> Result<CommandResult, CommandError> {
        // Clone the handler out so it runs without the lock held.
        let command = self
            .inner
            .read()
            .resolve(label)
            .ok_or_else(|| CommandError::UnknownCommand(label.to_string()))?;

        let invocation = CommandInvocation {
            name: &command.info.name,
            label,
            args,
            source,
        };

        match catch_unwind(AssertUnwindSafe(|| (command.handler)(&invocation))) {
            Ok(result) => Ok(result),
            Err(panic) => {
                let detail = panic_message(panic.as_ref());
                warn!("⚠️ Command '{}' panicked: {}", command.info.name, detail);
                Ok(CommandResult::failure(format!(
                    "command '{}' failed: {}",
                    command.info.name, detail
                )))
            }
        }
    }

    /// Parses a whitespace-separated command line and dispatches it.
    ///
    /// A single leading `/` is accepted and ignored.
    pub fn execute(
        &self,
        command_line: &str,
        source: &CommandSource,
    ) -> Result<CommandResult, CommandError> {
        let mut parts = command_line.split_whitespace();
        let label = parts
            .next()
            .map(|l| l.strip_prefix('/').unwrap_or(l))
            .filter(|l| !l.is_empty())
            .ok_or(CommandError::EmptyCommandLine)?;
        let args: Vec<String> = parts.map(str::to_string).collect();
        self.dispatch(label, &args, source)
    }

    pub fn contains(&self, label: &str) -> bool {
        self.inner.read().resolve(label).is_some()
    }

    /// All registered commands sorted by name.
    pub fn list(&self) -> Vec<CommandInfo> {
        let mut infos: Vec<CommandInfo> = self
            .inner
            .read()
            .commands
            .values()
            .map(|c| c.info.clone())
            .collect();
        infos.sort_by(|a, b| a.name.cmp(&b.name));
        infos
    }
}

pub(crate) fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn echo_registry() -> CommandRegistry {
        let registry = CommandRegistry::new();
        registry
            .register("echo", "Echo arguments", &["say"], |inv| {
                CommandResult::success(inv.args.join(" "))
            })
            .expect("register echo");
        registry
    }

    #[test]
    fn test_dispatch_by_name_and_alias() {
        let registry = echo_registry();
        let args = vec!["hello".to_string(), "world".to_string()];

        let result = registry
            .dispatch("echo", &args, &CommandSource::Console)
            .expect("echo exists");
        assert_eq!(result, CommandResult::success("hello world"));

        let result = registry
            .dispatch("SAY", &args, &CommandSource::Console)
            .expect("alias resolves case-insensitively");
        assert!(result.success);
    }

    #[test]
    fn test_unknown_command() {
        let registry = echo_registry();
        let err = registry
            .dispatch("nope", &[], &CommandSource::Console)
            .expect_err("unknown command");
        assert_eq!(err, CommandError::UnknownCommand("nope".to_string()));
    }

    #[test]
    fn test_duplicate_registration_rejected() {
        let registry = echo_registry();
        let err = registry
            .register("say", "", &[], |_| CommandResult::empty())
            .expect_err("alias is taken");
        assert_eq!(err, CommandError::AlreadyRegistered("say".to_string()));

        let err = registry
            .register("other", "", &["ECHO"], |_| CommandResult::empty())
            .expect_err("name is taken");
        assert_eq!(err, CommandError::AlreadyRegistered("echo".to_string()));
        assert!(!registry.contains("other"));
    }

    #[test]
    fn test_unregister_removes_aliases() {
        let registry = echo_registry();
        assert!(registry.unregister("say"));
        assert!(!registry.contains("echo"));
        assert!(!registry.contains("say"));
        assert!(!registry.unregister("echo"));
    }

    #[test]
    fn test_execute_parses_command_line() {
        let registry = echo_registry();
        let result = registry
            .execute("/echo  a   b ", &CommandSource::Console)
            .expect("parsed");
        assert_eq!(result.message.as_deref(), Some("a b"));

        assert_eq!(
            registry.execute("   ", &CommandSource::Console),
            Err(CommandError::EmptyCommandLine)
        );
    }

    #[test]
    fn test_panicking_command_is_isolated() {
        let registry = CommandRegistry::new();
        registry
            .register("boom", "", &[], |_| panic!("kaboom"))
            .expect("register");

        let result = registry
            .dispatch("boom", &[], &CommandSource::Console)
            .expect("panic becomes a failure result");
        assert!(!result.success);
        assert!(result.message.unwrap_or_default().contains("kaboom"));
    }
}
