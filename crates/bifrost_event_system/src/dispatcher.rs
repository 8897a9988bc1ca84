//! Synchronous event bus and command front door.
//!
//! `publish` runs every handler for the event's kind on the calling thread,
//! ordered by priority and then by subscription order. The handler table is
//! only locked long enough to clone the list, so handlers may subscribe or
//! publish themselves without deadlocking.

use crate::commands::{panic_message, CommandRegistry, CommandResult, CommandSource, CommandInvocation, CommandInfo};
use crate::error::{CommandError, EventError};
use crate::events::{EventKind, ProxyEvent, Verdict};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, error};

/// Handler ordering bucket. Lower buckets run first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub enum HandlerPriority {
    First,
    Early,
    #[default]
    Normal,
    Late,
    Last,
}

/// Token returned by `subscribe`/`intercept`, used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

type ObserverFn = dyn Fn(&ProxyEvent) -> Result<(), EventError> + Send + Sync;
type InterceptorFn = dyn Fn(&ProxyEvent) -> Result<Verdict, EventError> + Send + Sync;

#[derive(Clone)]
enum HandlerFn {
    Observer(Arc<ObserverFn>),
    Interceptor(Arc<InterceptorFn>),
}

#[derive(Clone)]
struct Registration {
    id: HandlerId,
    name: String,
    priority: HandlerPriority,
    handler: HandlerFn,
}

/// A handler that returned an error or panicked.
#[derive(Debug, Clone)]
pub struct HandlerFailure {
    pub handler: String,
    pub kind: EventKind,
    pub error: String,
}

/// Result of one `publish` call.
#[derive(Debug, Clone, Default)]
pub struct PublishReport {
    /// Handlers that ran to completion without error
    pub delivered: usize,
    pub failures: Vec<HandlerFailure>,
    /// Combined verdict of all interceptors; `Continue` for non-interceptable kinds
    pub verdict: Verdict,
}

/// Statistics about dispatcher usage.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DispatcherStats {
    pub total_handlers: usize,
    pub events_published: u64,
    pub handler_failures: u64,
    pub commands_dispatched: u64,
}

/// Event/command dispatcher shared by the proxy core and plugins.
pub struct Dispatcher {
    handlers: RwLock<HashMap<EventKind, Vec<Registration>>>,
    commands: CommandRegistry,
    next_handler_id: AtomicU64,
    stats: Mutex<DispatcherStats>,
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl Dispatcher {
    pub fn new() -> Self {
        Self {
            handlers: RwLock::new(HashMap::new()),
            commands: CommandRegistry::new(),
            next_handler_id: AtomicU64::new(1),
            stats: Mutex::new(DispatcherStats::default()),
        }
    }

    /// Subscribes an observer at normal priority.
    ///
    /// # Arguments
    ///
    /// * `kind` - Event kind to listen for
    /// * `name` - Handler name used in logs and failure reports
    /// * `handler` - Callback invoked on the publishing thread
    pub fn subscribe<F>(&self, kind: EventKind, name: &str, handler: F) -> HandlerId
    where
        F: Fn(&ProxyEvent) -> Result<(), EventError> + Send + Sync + 'static,
    {
        self.subscribe_with_priority(kind, name, HandlerPriority::Normal, handler)
    }

    pub fn subscribe_with_priority<F>(
        &self,
        kind: EventKind,
        name: &str,
        priority: HandlerPriority,
        handler: F,
    ) -> HandlerId
    where
        F: Fn(&ProxyEvent) -> Result<(), EventError> + Send + Sync + 'static,
    {
        self.insert(kind, name, priority, HandlerFn::Observer(Arc::new(handler)))
    }

    /// Registers an interceptor that can deny or redirect `PreConnect` and
    /// `PreTransfer` decisions.
    ///
    /// Interceptors on other kinds still run, but their verdict is ignored.
    pub fn intercept<F>(
        &self,
        kind: EventKind,
        name: &str,
        priority: HandlerPriority,
        handler: F,
    ) -> HandlerId
    where
        F: Fn(&ProxyEvent) -> Result<Verdict, EventError> + Send + Sync + 'static,
    {
        self.insert(kind, name, priority, HandlerFn::Interceptor(Arc::new(handler)))
    }

    fn insert(
        &self,
        kind: EventKind,
        name: &str,
        priority: HandlerPriority,
        handler: HandlerFn,
    ) -> HandlerId {
        let id = HandlerId(self.next_handler_id.fetch_add(1, Ordering::Relaxed));
        let registration = Registration {
            id,
            name: name.to_string(),
            priority,
            handler,
        };

        let mut handlers = self.handlers.write();
        let list = handlers.entry(kind).or_default();
        // Insert after every handler of the same or earlier priority so equal
        // priorities keep subscription order.
        let position = list
            .iter()
            .position(|r| r.priority > priority)
            .unwrap_or(list.len());
        list.insert(position, registration);
        drop(handlers);

        self.stats.lock().total_handlers += 1;
        debug!("📝 Registered handler '{}' for {}", name, kind);
        id
    }

    /// Removes a previously registered handler.
    pub fn unsubscribe(&self, id: HandlerId) -> bool {
        let removed = {
            let mut handlers = self.handlers.write();
            handlers.values_mut().any(|list| {
                match list.iter().position(|r| r.id == id) {
                    Some(position) => {
                        list.remove(position);
                        true
                    }
                    None => false,
                }
            })
        };
        if removed {
            let mut stats = self.stats.lock();
            stats.total_handlers = stats.total_handlers.saturating_sub(1);
        }
        removed
    }

    /// Delivers an event to every handler registered for its kind.
    ///
    /// Handler errors and panics are isolated: they are logged, recorded in
    /// the report, and delivery continues with the next handler. For
    /// interceptable kinds the first `Deny` wins; otherwise the last
    /// `Redirect` wins.
    pub fn publish(&self, event: &ProxyEvent) -> PublishReport {
        let kind = event.kind();
        let registrations = match self.handlers.read().get(&kind) {
            Some(list) => list.clone(),
            None => Vec::new(),
        };

        let mut report = PublishReport::default();
        for registration in &registrations {
            let outcome = catch_unwind(AssertUnwindSafe(|| match &registration.handler {
                HandlerFn::Observer(f) => f(event).map(|_| Verdict::Continue),
                HandlerFn::Interceptor(f) => f(event),
            }));

            let result = match outcome {
                Ok(result) => result,
                Err(panic) => Err(EventError::HandlerPanicked(panic_message(panic.as_ref()))),
            };

            match result {
                Ok(verdict) => {
                    report.delivered += 1;
                    if kind.is_interceptable() {
                        merge_verdict(&mut report.verdict, verdict);
                    }
                }
                Err(e) => {
                    error!("❌ Handler '{}' failed on {}: {}", registration.name, kind, e);
                    report.failures.push(HandlerFailure {
                        handler: registration.name.clone(),
                        kind,
                        error: e.to_string(),
                    });
                }
            }
        }

        let mut stats = self.stats.lock();
        stats.events_published += 1;
        stats.handler_failures += report.failures.len() as u64;
        report
    }

    /// Registers a command; see [`CommandRegistry::register`].
    pub fn register_command<F>(
        &self,
        name: &str,
        description: &str,
        aliases: &[&str],
        handler: F,
    ) -> Result<(), CommandError>
    where
        F: Fn(&CommandInvocation<'_>) -> CommandResult + Send + Sync + 'static,
    {
        self.commands.register(name, description, aliases, handler)
    }

    pub fn unregister_command(&self, name: &str) -> bool {
        self.commands.unregister(name)
    }

    /// Runs a registered command by name or alias.
    pub fn dispatch_command(
        &self,
        name: &str,
        args: &[String],
        source: &CommandSource,
    ) -> Result<CommandResult, CommandError> {
        let result = self.commands.dispatch(name, args, source);
        if result.is_ok() {
            self.stats.lock().commands_dispatched += 1;
        }
        result
    }

    /// Parses and runs a full command line such as `send alice lobby`.
    pub fn execute_command(
        &self,
        command_line: &str,
        source: &CommandSource,
    ) -> Result<CommandResult, CommandError> {
        let result = self.commands.execute(command_line, source);
        if result.is_ok() {
            self.stats.lock().commands_dispatched += 1;
        }
        result
    }

    pub fn commands(&self) -> Vec<CommandInfo> {
        self.commands.list()
    }

    pub fn get_stats(&self) -> DispatcherStats {
        self.stats.lock().clone()
    }
}

fn merge_verdict(current: &mut Verdict, next: Verdict) {
    if current.is_deny() {
        return;
    }
    match next {
        Verdict::Continue => {}
        other => *current = other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::ViolationKind;
    use crate::types::BackendId;

    fn violation() -> ProxyEvent {
        ProxyEvent::SecurityViolation {
            kind: ViolationKind::TamperedMessage,
            peer: "lobby".to_string(),
            detail: "bad tag".to_string(),
        }
    }

    fn pre_connect() -> ProxyEvent {
        ProxyEvent::PreConnect {
            player: crate::types::PlayerIdentity {
                uuid: uuid::Uuid::new_v4(),
                username: "alice".to_string(),
            },
            remote_addr: "127.0.0.1:5000".parse().expect("addr"),
            proposed: Some(BackendId(1)),
        }
    }

    #[test]
    fn test_merge_verdict_first_deny_wins() {
        let mut verdict = Verdict::Continue;
        merge_verdict(&mut verdict, Verdict::redirect(BackendId(2)));
        merge_verdict(&mut verdict, Verdict::deny("banned"));
        merge_verdict(&mut verdict, Verdict::redirect(BackendId(3)));
        merge_verdict(&mut verdict, Verdict::deny("second"));
        assert_eq!(verdict, Verdict::deny("banned"));
    }

    #[test]
    fn test_unsubscribe() {
        let dispatcher = Dispatcher::new();
        let id = dispatcher.subscribe(EventKind::SecurityViolation, "audit", |_| Ok(()));
        assert_eq!(dispatcher.publish(&violation()).delivered, 1);

        assert!(dispatcher.unsubscribe(id));
        assert!(!dispatcher.unsubscribe(id));
        assert_eq!(dispatcher.publish(&violation()).delivered, 0);
        assert_eq!(dispatcher.get_stats().total_handlers, 0);
    }

    #[test]
    fn test_verdict_ignored_for_notifications() {
        let dispatcher = Dispatcher::new();
        dispatcher.intercept(
            EventKind::SecurityViolation,
            "denier",
            HandlerPriority::Normal,
            |_| Ok(Verdict::deny("no")),
        );
        let report = dispatcher.publish(&violation());
        assert_eq!(report.verdict, Verdict::Continue);
        assert_eq!(report.delivered, 1);
    }

    #[test]
    fn test_redirect_verdict() {
        let dispatcher = Dispatcher::new();
        dispatcher.intercept(EventKind::PreConnect, "router", HandlerPriority::Normal, |_| {
            Ok(Verdict::redirect(BackendId(7)))
        });
        let report = dispatcher.publish(&pre_connect());
        assert_eq!(report.verdict, Verdict::redirect(BackendId(7)));
    }

    #[test]
    fn test_handler_can_publish_reentrantly() {
        let dispatcher = Arc::new(Dispatcher::new());
        let inner = dispatcher.clone();
        dispatcher.subscribe(EventKind::PreConnect, "reentrant", move |_| {
            inner.publish(&violation());
            Ok(())
        });
        let report = dispatcher.publish(&pre_connect());
        assert_eq!(report.delivered, 1);
        assert_eq!(dispatcher.get_stats().events_published, 2);
    }
}
