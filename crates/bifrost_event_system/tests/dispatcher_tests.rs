//! Integration tests for event delivery ordering and isolation.

use bifrost_event_system::{
    BackendId, CommandError, CommandResult, CommandSource, Dispatcher, EventError, EventKind,
    HandlerPriority, PlayerIdentity, ProxyEvent, SessionId, Verdict,
};
use std::sync::{Arc, Mutex};

fn switch_event() -> ProxyEvent {
    ProxyEvent::BackendSwitch {
        session_id: SessionId::new(),
        player: PlayerIdentity {
            uuid: uuid::Uuid::new_v4(),
            username: "alice".to_string(),
        },
        from: BackendId(1),
        to: BackendId(2),
    }
}

fn pre_connect_event() -> ProxyEvent {
    ProxyEvent::PreConnect {
        player: PlayerIdentity {
            uuid: uuid::Uuid::new_v4(),
            username: "bob".to_string(),
        },
        remote_addr: "10.0.0.1:40000".parse().unwrap(),
        proposed: None,
    }
}

#[test]
fn test_delivery_in_subscription_order() {
    let dispatcher = Dispatcher::new();
    let seen = Arc::new(Mutex::new(Vec::new()));

    for name in ["first", "second", "third"] {
        let seen = seen.clone();
        dispatcher.subscribe(EventKind::BackendSwitch, name, move |_| {
            seen.lock().unwrap().push(name);
            Ok(())
        });
    }

    let report = dispatcher.publish(&switch_event());
    assert_eq!(report.delivered, 3);
    assert_eq!(*seen.lock().unwrap(), vec!["first", "second", "third"]);
}

#[test]
fn test_priority_orders_before_subscription_order() {
    let dispatcher = Dispatcher::new();
    let seen = Arc::new(Mutex::new(Vec::new()));

    let entries = [
        ("normal-a", HandlerPriority::Normal),
        ("last", HandlerPriority::Last),
        ("first", HandlerPriority::First),
        ("normal-b", HandlerPriority::Normal),
        ("early", HandlerPriority::Early),
    ];
    for (name, priority) in entries {
        let seen = seen.clone();
        dispatcher.subscribe_with_priority(EventKind::BackendSwitch, name, priority, move |_| {
            seen.lock().unwrap().push(name);
            Ok(())
        });
    }

    dispatcher.publish(&switch_event());
    assert_eq!(
        *seen.lock().unwrap(),
        vec!["first", "early", "normal-a", "normal-b", "last"]
    );
}

#[test]
fn test_failing_handler_does_not_stop_delivery() {
    let dispatcher = Dispatcher::new();
    let seen = Arc::new(Mutex::new(Vec::new()));

    {
        let seen = seen.clone();
        dispatcher.subscribe(EventKind::BackendSwitch, "before", move |_| {
            seen.lock().unwrap().push("before");
            Ok(())
        });
    }
    dispatcher.subscribe(EventKind::BackendSwitch, "broken", |_| {
        Err(EventError::HandlerExecution("database offline".to_string()))
    });
    dispatcher.subscribe(EventKind::BackendSwitch, "panics", |_| panic!("plugin bug"));
    {
        let seen = seen.clone();
        dispatcher.subscribe(EventKind::BackendSwitch, "after", move |_| {
            seen.lock().unwrap().push("after");
            Ok(())
        });
    }

    let report = dispatcher.publish(&switch_event());
    assert_eq!(report.delivered, 2);
    assert_eq!(report.failures.len(), 2);
    assert_eq!(report.failures[0].handler, "broken");
    assert!(report.failures[1].error.contains("plugin bug"));
    assert_eq!(*seen.lock().unwrap(), vec!["before", "after"]);

    let stats = dispatcher.get_stats();
    assert_eq!(stats.events_published, 1);
    assert_eq!(stats.handler_failures, 2);
}

#[test]
fn test_deny_beats_later_redirect() {
    let dispatcher = Dispatcher::new();
    dispatcher.intercept(EventKind::PreConnect, "ban-list", HandlerPriority::Early, |_| {
        Ok(Verdict::deny("banned"))
    });
    dispatcher.intercept(EventKind::PreConnect, "router", HandlerPriority::Normal, |_| {
        Ok(Verdict::redirect(BackendId(9)))
    });

    let report = dispatcher.publish(&pre_connect_event());
    assert_eq!(report.verdict, Verdict::deny("banned"));
}

#[test]
fn test_events_for_other_kinds_are_not_delivered() {
    let dispatcher = Dispatcher::new();
    let count = Arc::new(Mutex::new(0));
    {
        let count = count.clone();
        dispatcher.subscribe(EventKind::SessionDisconnected, "counter", move |_| {
            *count.lock().unwrap() += 1;
            Ok(())
        });
    }
    dispatcher.publish(&switch_event());
    assert_eq!(*count.lock().unwrap(), 0);
}

#[test]
fn test_command_dispatch_through_dispatcher() {
    let dispatcher = Dispatcher::new();
    dispatcher
        .register_command("ping", "Replies with pong", &["p"], |_| {
            CommandResult::success("pong")
        })
        .unwrap();

    let result = dispatcher
        .dispatch_command("P", &[], &CommandSource::Console)
        .unwrap();
    assert_eq!(result.message.as_deref(), Some("pong"));

    let err = dispatcher
        .execute_command("teleport alice", &CommandSource::Backend(BackendId(1)))
        .unwrap_err();
    assert_eq!(err, CommandError::UnknownCommand("teleport".to_string()));

    assert_eq!(dispatcher.get_stats().commands_dispatched, 1);
    assert_eq!(dispatcher.commands()[0].aliases, vec!["p".to_string()]);
}
