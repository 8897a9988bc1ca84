//! Operator commands registered by the server itself.
//!
//! Handlers hold weak references so the dispatcher never keeps the session
//! manager or registry alive on its own.

use crate::bridge::BridgeManager;
use crate::error::{ProxyError, Result};
use crate::registry::{BackendRegistry, DeregisterOutcome};
use crate::session::{SessionManager, TransferOutcome};
use bifrost_event_system::{CommandInvocation, CommandResult, Dispatcher};
use std::sync::{Arc, Weak};
use tracing::{info, warn};

pub(crate) fn register_builtin_commands(
    dispatcher: &Arc<Dispatcher>,
    registry: &Arc<BackendRegistry>,
    sessions: &Arc<SessionManager>,
    bridge: &Arc<BridgeManager>,
) -> Result<()> {
    let commands = Arc::downgrade(dispatcher);
    add(
        dispatcher,
        "help",
        "Lists available commands",
        &["?"],
        move |_: &CommandInvocation<'_>| match commands.upgrade() {
            Some(dispatcher) => {
                let lines: Vec<String> = dispatcher
                    .commands()
                    .into_iter()
                    .map(|info| {
                        if info.aliases.is_empty() {
                            format!("{} - {}", info.name, info.description)
                        } else {
                            format!("{} ({}) - {}", info.name, info.aliases.join(", "), info.description)
                        }
                    })
                    .collect();
                CommandResult::success(lines.join("\n"))
            }
            None => CommandResult::failure("proxy is shutting down"),
        },
    )?;

    let backends = Arc::downgrade(registry);
    add(
        dispatcher,
        "servers",
        "Lists backends with their state and player count",
        &["backends"],
        move |_: &CommandInvocation<'_>| {
            let Some(registry) = backends.upgrade() else {
                return CommandResult::failure("proxy is shutting down");
            };
            let snapshots = registry.snapshots();
            if snapshots.is_empty() {
                return CommandResult::success("No backends registered");
            }
            let lines: Vec<String> = snapshots
                .iter()
                .map(|b| {
                    format!(
                        "{} [{}] {} at {} - {} player(s){}",
                        b.name,
                        b.id,
                        b.state,
                        b.address,
                        b.session_count,
                        if b.default_server { " (default)" } else { "" }
                    )
                })
                .collect();
            CommandResult::success(lines.join("\n"))
        },
    )?;

    let (table, names) = (Arc::downgrade(sessions), Arc::downgrade(registry));
    add(
        dispatcher,
        "sessions",
        "Lists connected players and their backend",
        &["list", "glist"],
        move |_: &CommandInvocation<'_>| {
            let (Some(sessions), Some(registry)) = (table.upgrade(), names.upgrade()) else {
                return CommandResult::failure("proxy is shutting down");
            };
            let mut snapshots = sessions.snapshots();
            snapshots.sort_by(|a, b| a.player.username.cmp(&b.player.username));
            let mut lines = vec![format!("{} player(s) online", snapshots.len())];
            for s in snapshots {
                let backend = registry.name(s.backend).unwrap_or_else(|| s.backend.to_string());
                match s.pending_backend {
                    Some(target) => lines.push(format!(
                        "{} -> {} (moving to {})",
                        s.player.username,
                        backend,
                        registry.name(target).unwrap_or_else(|| target.to_string())
                    )),
                    None => lines.push(format!("{} -> {}", s.player.username, backend)),
                }
            }
            CommandResult::success(lines.join("\n"))
        },
    )?;

    let (table, names) = (Arc::downgrade(sessions), Arc::downgrade(registry));
    add(
        dispatcher,
        "find",
        "Shows which backend a player is on: find <player>",
        &[],
        move |inv: &CommandInvocation<'_>| {
            let (Some(sessions), Some(registry)) = (table.upgrade(), names.upgrade()) else {
                return CommandResult::failure("proxy is shutting down");
            };
            let Some(username) = inv.args.first() else {
                return CommandResult::failure("usage: find <player>");
            };
            match sessions.find_by_username(username) {
                Some(s) => CommandResult::success(format!(
                    "{} is on {}",
                    s.player.username,
                    registry.name(s.backend).unwrap_or_else(|| s.backend.to_string())
                )),
                None => CommandResult::failure(format!("{} is not online", username)),
            }
        },
    )?;

    let (table, names) = (Arc::downgrade(sessions), Arc::downgrade(registry));
    add(
        dispatcher,
        "send",
        "Moves a player to another backend: send <player> <server>",
        &["transfer"],
        move |inv: &CommandInvocation<'_>| send_player(inv, &table, &names),
    )?;

    let (channels, names) = (Arc::downgrade(bridge), Arc::downgrade(registry));
    add(
        dispatcher,
        "deregister",
        "Drains and removes a backend: deregister <server>",
        &[],
        move |inv: &CommandInvocation<'_>| {
            let (Some(bridge), Some(registry)) = (channels.upgrade(), names.upgrade()) else {
                return CommandResult::failure("proxy is shutting down");
            };
            let Some(name) = inv.args.first() else {
                return CommandResult::failure("usage: deregister <server>");
            };
            let Some(id) = registry.find_by_name(name) else {
                return CommandResult::failure(format!("unknown server '{}'", name));
            };
            match bridge.deregister(id) {
                Ok(DeregisterOutcome::Removed) => CommandResult::success(format!("Removed {}", name)),
                Ok(DeregisterOutcome::Draining) => {
                    CommandResult::success(format!("Draining {}; it is removed once empty", name))
                }
                Err(e) => CommandResult::failure(e.to_string()),
            }
        },
    )?;

    Ok(())
}

fn add<F>(dispatcher: &Dispatcher, name: &str, description: &str, aliases: &[&str], handler: F) -> Result<()>
where
    F: Fn(&CommandInvocation<'_>) -> CommandResult + Send + Sync + 'static,
{
    dispatcher
        .register_command(name, description, aliases, handler)
        .map_err(|e| ProxyError::Config(format!("cannot register command '{}': {}", name, e)))
}

fn send_player(
    inv: &CommandInvocation<'_>,
    sessions: &Weak<SessionManager>,
    registry: &Weak<BackendRegistry>,
) -> CommandResult {
    let (Some(sessions), Some(registry)) = (sessions.upgrade(), registry.upgrade()) else {
        return CommandResult::failure("proxy is shutting down");
    };
    let (Some(username), Some(server)) = (inv.args.first(), inv.args.get(1)) else {
        return CommandResult::failure("usage: send <player> <server>");
    };
    let Some(session) = sessions.find_by_username(username) else {
        return CommandResult::failure(format!("{} is not online", username));
    };
    let Some(target) = registry.find_by_name(server) else {
        return CommandResult::failure(format!("unknown server '{}'", server));
    };
    let Ok(runtime) = tokio::runtime::Handle::try_current() else {
        return CommandResult::failure("no async runtime available");
    };

    let session_id = session.session_id;
    let player = session.player.username.clone();
    let reply = format!("Sending {} to {}", player, server);
    let server = server.clone();
    runtime.spawn(async move {
        match sessions.transfer_session(session_id, target).await {
            Ok(handle) => match handle.outcome().await {
                TransferOutcome::Completed { .. } => info!("🔁 Sent {} to {}", player, server),
                TransferOutcome::RolledBack { reason } => {
                    warn!("⚠️ Could not send {} to {}: {}", player, server, reason)
                }
            },
            Err(e) => warn!("⚠️ Could not send {} to {}: {}", player, server, e),
        }
    });
    CommandResult::success(reply)
}
