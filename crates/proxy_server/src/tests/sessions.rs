use super::*;
use crate::bridge::{
    AckPayload, BridgeEvent, BridgeMessage, CommandPayload, EventPayload, ForwardFrame,
    HandoffPayload, HandoffReason, MessageKind, OutboundMessage, ReleasePayload,
};
use crate::codec::Packet;
use crate::connection::CloseReason;
use crate::error::ProxyError;
use crate::session::TransferOutcome;
use bifrost_event_system::{current_timestamp, CommandResult, HandlerPriority, SessionId, Verdict};
use tokio::sync::mpsc::error::TryRecvError;

fn inbound(kind: MessageKind, correlation_id: u64, payload: &impl serde::Serialize) -> BridgeMessage {
    OutboundMessage::json(kind, correlation_id, payload)
        .unwrap()
        .seal(1, current_timestamp(), &secret(9))
}

fn ack(accepted: bool) -> AckPayload {
    AckPayload {
        accepted,
        message: (!accepted).then(|| "full".to_string()),
    }
}

#[tokio::test]
async fn test_connect_without_authenticated_backend_fails() {
    let harness = Harness::new();
    harness.registered("lobby");

    let result = harness.try_connect("alice").await;
    assert!(matches!(result, Err(ProxyError::NoBackendAvailable)));
    assert!(harness.sessions.is_empty());
}

#[tokio::test]
async fn test_new_session_goes_to_least_loaded_backend() {
    let harness = Harness::new();
    let busy = harness.backend("busy");
    let quiet = harness.backend("quiet");
    for _ in 0..3 {
        harness.registry.claim(busy).unwrap();
    }
    harness.registry.claim(quiet).unwrap();

    let client = harness.connect("alice").await;
    assert_eq!(client.session.backend, quiet);
    assert_eq!(harness.count(busy), 3);
    assert_eq!(harness.count(quiet), 2);

    let handoffs = harness.transport.sent_to(quiet, MessageKind::Handoff);
    assert_eq!(handoffs.len(), 1);
    let payload: HandoffPayload = serde_json::from_slice(&handoffs[0].payload).unwrap();
    assert_eq!(payload.session_id, client.session.session_id);
    assert_eq!(payload.reason, HandoffReason::Connect);
}

#[tokio::test]
async fn test_unreachable_backend_is_skipped() {
    let harness = Harness::new();
    let lobby = harness.backend("lobby");
    let arena = harness.backend("arena");
    harness.transport.set_offline(lobby, true);

    let client = harness.connect("alice").await;
    assert_eq!(client.session.backend, arena);
    assert_eq!(harness.count(lobby), 0);
    assert_eq!(harness.count(arena), 1);
}

#[tokio::test]
async fn test_pre_connect_deny_and_redirect() {
    let harness = Harness::new();
    harness.backend("lobby");
    let arena = harness.backend("arena");

    harness.dispatcher.intercept(
        EventKind::PreConnect,
        "test:gate",
        HandlerPriority::Normal,
        move |event| match event {
            ProxyEvent::PreConnect { player, .. } if player.username == "mallory" => {
                Ok(Verdict::deny("banned"))
            }
            _ => Ok(Verdict::redirect(arena)),
        },
    );

    let denied = harness.try_connect("mallory").await;
    assert!(matches!(denied, Err(ProxyError::ConnectDenied(reason)) if reason == "banned"));

    let client = harness.connect("alice").await;
    assert_eq!(client.session.backend, arena);
}

#[tokio::test]
async fn test_count_moves_only_after_ack() {
    let harness = Harness::new();
    let lobby = harness.backend("lobby");
    let arena = harness.backend("arena");
    let events = record(&harness.dispatcher, &[EventKind::BackendSwitch]);

    let client = harness.connect("alice").await;
    assert_eq!(client.session.backend, lobby);
    let session_id = client.session.session_id;

    let handle = harness.sessions.transfer_session(session_id, arena).await.unwrap();
    let snapshot = harness.sessions.get(session_id).unwrap();
    assert_eq!(snapshot.backend, lobby);
    assert_eq!(snapshot.pending_backend, Some(arena));
    assert_eq!((harness.count(lobby), harness.count(arena)), (1, 0));

    let handoff = harness.transport.last_to(arena, MessageKind::Handoff).unwrap();
    assert_eq!(handoff.correlation_id, handle.correlation_id);
    let payload: HandoffPayload = serde_json::from_slice(&handoff.payload).unwrap();
    assert_eq!(payload.reason, HandoffReason::Transfer);
    assert_eq!(payload.previous_backend.as_deref(), Some("lobby"));

    // An ack from the wrong backend is ignored.
    harness
        .sessions
        .handle_handoff_ack(lobby, handle.correlation_id, ack(true))
        .await;
    assert_eq!((harness.count(lobby), harness.count(arena)), (1, 0));

    harness
        .sessions
        .handle_handoff_ack(arena, handle.correlation_id, ack(true))
        .await;
    assert_eq!(handle.outcome().await, TransferOutcome::Completed { to: arena });
    assert_eq!((harness.count(lobby), harness.count(arena)), (0, 1));

    let snapshot = harness.sessions.get(session_id).unwrap();
    assert_eq!(snapshot.backend, arena);
    assert_eq!(snapshot.pending_backend, None);
    assert_eq!(harness.transport.sent_to(lobby, MessageKind::Release).len(), 1);
    assert_eq!(events.lock().len(), 1);
}

#[tokio::test]
async fn test_target_channel_drop_rolls_back_transfer() {
    let harness = Harness::new();
    let lobby = harness.backend("lobby");
    let arena = harness.backend("arena");
    let failures = record(&harness.dispatcher, &[EventKind::TransferFailed]);

    let mut client = harness.connect("alice").await;
    let session_id = client.session.session_id;
    let handle = harness.sessions.transfer_session(session_id, arena).await.unwrap();

    // The target's channel drops before it acks.
    harness.registry.transition(arena, ChannelState::Draining).unwrap();
    harness
        .sessions
        .handle_bridge_event(BridgeEvent::Draining { backend: arena })
        .await;

    assert!(matches!(handle.outcome().await, TransferOutcome::RolledBack { .. }));
    let snapshot = harness.sessions.get(session_id).unwrap();
    assert_eq!(snapshot.backend, lobby);
    assert_eq!(snapshot.pending_backend, None);
    assert_eq!((harness.count(lobby), harness.count(arena)), (1, 0));

    let failures = failures.lock();
    assert_eq!(failures.len(), 1);
    assert!(matches!(
        &failures[0],
        ProxyEvent::TransferFailed { from, to, .. } if *from == lobby && *to == arena
    ));
    assert!(matches!(client.commands.try_recv(), Err(TryRecvError::Empty)));
}

#[tokio::test]
async fn test_unacknowledged_handoff_times_out() {
    let harness = Harness::with_settings(SessionSettings {
        handoff_timeout: Duration::from_millis(50),
        ..SessionSettings::default()
    });
    let lobby = harness.backend("lobby");
    let arena = harness.backend("arena");

    let client = harness.connect("alice").await;
    let session_id = client.session.session_id;
    let handle = harness.sessions.transfer_session(session_id, arena).await.unwrap();
    let correlation_id = handle.correlation_id;

    match within(Duration::from_secs(2), handle.outcome()).await {
        TransferOutcome::RolledBack { reason } => assert!(reason.contains("timed out")),
        other => panic!("unexpected outcome {:?}", other),
    }
    assert_eq!(harness.sessions.get(session_id).unwrap().backend, lobby);

    // A late ack changes nothing.
    harness
        .sessions
        .handle_handoff_ack(arena, correlation_id, ack(true))
        .await;
    assert_eq!((harness.count(lobby), harness.count(arena)), (1, 0));
}

#[tokio::test]
async fn test_rejected_handoff_keeps_session() {
    let harness = Harness::new();
    let lobby = harness.backend("lobby");
    let arena = harness.backend("arena");

    let client = harness.connect("alice").await;
    let session_id = client.session.session_id;
    let handle = harness.sessions.transfer_session(session_id, arena).await.unwrap();
    let reply = inbound(MessageKind::Ack, handle.correlation_id, &ack(false));
    harness
        .sessions
        .handle_bridge_event(BridgeEvent::Message {
            backend: arena,
            message: reply,
        })
        .await;

    assert_eq!(
        handle.outcome().await,
        TransferOutcome::RolledBack {
            reason: "full".to_string()
        }
    );
    assert_eq!(harness.sessions.get(session_id).unwrap().backend, lobby);
    assert_eq!(harness.count(lobby), 1);
}

#[tokio::test]
async fn test_transfer_preconditions() {
    let harness = Harness::new();
    let lobby = harness.backend("lobby");
    let arena = harness.backend("arena");
    let offline = harness.registered("offline");

    let client = harness.connect("alice").await;
    let session_id = client.session.session_id;

    assert!(matches!(
        harness.sessions.transfer_session(session_id, lobby).await,
        Err(ProxyError::TransferDenied(_))
    ));
    assert!(matches!(
        harness.sessions.transfer_session(session_id, offline).await,
        Err(ProxyError::ChannelUnavailable(_))
    ));
    assert!(matches!(
        harness.sessions.transfer_session(SessionId::new(), arena).await,
        Err(ProxyError::UnknownSession(_))
    ));

    let _handle = harness.sessions.transfer_session(session_id, arena).await.unwrap();
    assert!(matches!(
        harness.sessions.transfer_session(session_id, arena).await,
        Err(ProxyError::TransferInProgress(_))
    ));
}

#[tokio::test]
async fn test_pre_transfer_deny() {
    let harness = Harness::new();
    harness.backend("lobby");
    let arena = harness.backend("arena");
    harness.dispatcher.intercept(
        EventKind::PreTransfer,
        "test:lock",
        HandlerPriority::Normal,
        |_| Ok(Verdict::deny("arena is closed")),
    );

    let client = harness.connect("alice").await;
    let result = harness.sessions.transfer_session(client.session.session_id, arena).await;
    assert!(matches!(result, Err(ProxyError::TransferDenied(_))));
    assert!(harness.transport.sent_to(arena, MessageKind::Handoff).is_empty());
}

#[tokio::test]
async fn test_destroy_session_is_idempotent() {
    let harness = Harness::new();
    let lobby = harness.backend("lobby");
    let disconnects = record(&harness.dispatcher, &[EventKind::SessionDisconnected]);

    let client = harness.connect("alice").await;
    let session_id = client.session.session_id;
    let connection_id = client.session.connection_id;
    assert_eq!(harness.count(lobby), 1);

    assert!(harness.sessions.destroy_session(session_id, "quit").await);
    assert!(!harness.sessions.destroy_session(session_id, "quit").await);
    assert!(!harness.sessions.destroy_for_connection(connection_id, "quit").await);

    assert_eq!(harness.count(lobby), 0);
    assert_eq!(disconnects.lock().len(), 1);
    assert_eq!(harness.transport.sent_to(lobby, MessageKind::Release).len(), 1);
    assert!(harness.sessions.session_for_connection(connection_id).is_none());
}

#[tokio::test]
async fn test_concurrent_destroy_releases_once() {
    let harness = Harness::new();
    let lobby = harness.backend("lobby");
    let client = harness.connect("alice").await;
    let session_id = client.session.session_id;

    let (first, second) = tokio::join!(
        harness.sessions.destroy_session(session_id, "a"),
        harness.sessions.destroy_session(session_id, "b"),
    );
    assert!(first ^ second);
    assert_eq!(harness.count(lobby), 0);
}

#[tokio::test]
async fn test_destroy_during_transfer_cancels_it() {
    let harness = Harness::new();
    let lobby = harness.backend("lobby");
    let arena = harness.backend("arena");

    let client = harness.connect("alice").await;
    let session_id = client.session.session_id;
    let handle = harness.sessions.transfer_session(session_id, arena).await.unwrap();
    let correlation_id = handle.correlation_id;

    assert!(harness.sessions.destroy_session(session_id, "quit").await);
    assert_eq!(
        handle.outcome().await,
        TransferOutcome::RolledBack {
            reason: "session closed".to_string()
        }
    );

    harness
        .sessions
        .handle_handoff_ack(arena, correlation_id, ack(true))
        .await;
    assert_eq!((harness.count(lobby), harness.count(arena)), (0, 0));
}

#[tokio::test]
async fn test_draining_backend_sessions_move_elsewhere() {
    let harness = Harness::new();
    let lobby = harness.backend("lobby");
    let first = harness.connect("alice").await;
    let second = harness.connect("bob").await;
    assert_eq!(harness.count(lobby), 2);
    let arena = harness.backend("arena");

    harness.registry.transition(lobby, ChannelState::Draining).unwrap();
    harness
        .sessions
        .handle_bridge_event(BridgeEvent::Draining { backend: lobby })
        .await;

    let handoffs = harness.transport.sent_to(arena, MessageKind::Handoff);
    assert_eq!(handoffs.len(), 2);

    // Nothing new lands on the draining backend meanwhile.
    let third = harness.connect("carol").await;
    assert_eq!(third.session.backend, arena);

    for handoff in handoffs {
        harness
            .sessions
            .handle_handoff_ack(arena, handoff.correlation_id, ack(true))
            .await;
    }
    assert_eq!(harness.count(lobby), 0);
    assert_eq!(harness.count(arena), 3);
    assert_eq!(harness.sessions.get(first.session.session_id).unwrap().backend, arena);
    assert_eq!(harness.sessions.get(second.session.session_id).unwrap().backend, arena);
    assert!(harness.transport.drained().contains(&lobby));
}

#[tokio::test]
async fn test_draining_without_alternative_disconnects() {
    let harness = Harness::new();
    let lobby = harness.backend("lobby");
    let mut client = harness.connect("alice").await;

    harness.registry.transition(lobby, ChannelState::Draining).unwrap();
    harness.sessions.on_backend_draining(lobby).await;

    match client.commands.try_recv() {
        Ok(ConnectionCommand::Close { reason }) => assert_eq!(reason, CloseReason::BackendUnavailable),
        other => panic!("expected close, got {:?}", other),
    }
    assert!(harness.sessions.is_empty());
    assert_eq!(harness.count(lobby), 0);
}

/// alice is moving lobby -> game when lobby starts draining.
async fn drain_during_transfer(harness: &Harness) -> (BackendId, BackendId, TestClient, crate::session::TransferHandle) {
    let lobby = harness.backend("lobby");
    let client = harness.connect("alice").await;
    let game = harness.backend("game");
    let handle = harness
        .sessions
        .transfer_session(client.session.session_id, game)
        .await
        .unwrap();

    harness.registry.transition(lobby, ChannelState::Draining).unwrap();
    harness.sessions.on_backend_draining(lobby).await;
    (lobby, game, client, handle)
}

#[tokio::test]
async fn test_drain_waits_for_outgoing_transfer_ack() {
    let harness = Harness::new();
    let (lobby, game, client, handle) = drain_during_transfer(&harness).await;

    // The claim is still on lobby, so it is not drained yet.
    assert_eq!(harness.count(lobby), 1);
    assert!(!harness.transport.drained().contains(&lobby));
    assert_eq!(harness.transport.sent_to(game, MessageKind::Handoff).len(), 1);

    harness
        .sessions
        .handle_handoff_ack(game, handle.correlation_id, ack(true))
        .await;
    assert_eq!(handle.outcome().await, TransferOutcome::Completed { to: game });
    assert_eq!((harness.count(lobby), harness.count(game)), (0, 1));
    assert_eq!(harness.sessions.get(client.session.session_id).unwrap().backend, game);
    assert!(harness.transport.drained().contains(&lobby));
}

#[tokio::test]
async fn test_rejected_transfer_off_draining_backend_moves_again() {
    let harness = Harness::new();
    let (lobby, game, client, handle) = drain_during_transfer(&harness).await;
    let session_id = client.session.session_id;

    harness
        .sessions
        .handle_bridge_event(BridgeEvent::Message {
            backend: game,
            message: inbound(MessageKind::Ack, handle.correlation_id, &ack(false)),
        })
        .await;
    assert_eq!(
        handle.outcome().await,
        TransferOutcome::RolledBack {
            reason: "full".to_string()
        }
    );

    // Back on lobby, which is draining: a second handoff goes out at once.
    let handoffs = harness.transport.sent_to(game, MessageKind::Handoff);
    assert_eq!(handoffs.len(), 2);
    let snapshot = harness.sessions.get(session_id).unwrap();
    assert_eq!(snapshot.backend, lobby);
    assert_eq!(snapshot.pending_backend, Some(game));

    harness
        .sessions
        .handle_handoff_ack(game, handoffs[1].correlation_id, ack(true))
        .await;
    assert_eq!((harness.count(lobby), harness.count(game)), (0, 1));
    assert_eq!(harness.sessions.get(session_id).unwrap().backend, game);
    assert!(harness.transport.drained().contains(&lobby));
}

#[tokio::test]
async fn test_timed_out_transfer_off_draining_backend_disconnects() {
    let harness = Harness::with_settings(SessionSettings {
        handoff_timeout: Duration::from_millis(50),
        ..SessionSettings::default()
    });
    let failures = record(&harness.dispatcher, &[EventKind::TransferFailed]);
    let (lobby, game, mut client, handle) = drain_during_transfer(&harness).await;

    match within(Duration::from_secs(2), handle.outcome()).await {
        TransferOutcome::RolledBack { reason } => assert!(reason.contains("timed out")),
        other => panic!("unexpected outcome {:?}", other),
    }

    // The second move off lobby times out too; then the player is dropped.
    assert!(eventually(Duration::from_secs(2), || harness.sessions.is_empty()).await);
    match client.commands.try_recv() {
        Ok(ConnectionCommand::Close { reason }) => assert_eq!(reason, CloseReason::BackendUnavailable),
        other => panic!("expected close, got {:?}", other),
    }
    assert_eq!(harness.transport.sent_to(game, MessageKind::Handoff).len(), 2);
    assert_eq!(failures.lock().len(), 2);
    assert_eq!((harness.count(lobby), harness.count(game)), (0, 0));
    assert!(harness.transport.drained().contains(&lobby));
}

#[tokio::test]
async fn test_slow_client_does_not_stall_bridge_traffic() {
    let harness = Harness::new();
    let lobby = harness.backend("lobby");
    let alice = harness.connect("alice").await;
    let bob = harness.connect("bob").await;
    let arena = harness.backend("arena");
    let handle = harness
        .sessions
        .transfer_session(bob.session.session_id, arena)
        .await
        .unwrap();

    // alice never reads; her queue holds 16 commands.
    for sequence in 1..=20 {
        let frame = ForwardFrame {
            session_id: alice.session.session_id,
            stream_id: 1,
            packet: Packet::new(0x21, &b"tick"[..]),
        };
        let message = frame.into_message().seal(sequence, current_timestamp(), &secret(9));
        within(
            Duration::from_secs(1),
            harness.sessions.handle_bridge_event(BridgeEvent::Message {
                backend: lobby,
                message,
            }),
        )
        .await;
    }
    assert!(harness.sessions.get(alice.session.session_id).is_none());

    within(
        Duration::from_secs(1),
        harness.sessions.handle_bridge_event(BridgeEvent::Message {
            backend: arena,
            message: inbound(MessageKind::Ack, handle.correlation_id, &ack(true)),
        }),
    )
    .await;
    assert_eq!(
        within(Duration::from_secs(2), handle.outcome()).await,
        TransferOutcome::Completed { to: arena }
    );
    assert_eq!((harness.count(lobby), harness.count(arena)), (0, 1));
}

#[tokio::test]
async fn test_backend_release_kicks_player() {
    let harness = Harness::new();
    let lobby = harness.backend("lobby");
    let arena = harness.backend("arena");
    let mut client = harness.connect("alice").await;
    let session_id = client.session.session_id;
    let payload = ReleasePayload {
        session_id,
        reason: "kicked".to_string(),
    };

    // Only the serving backend may release a player.
    harness
        .sessions
        .handle_bridge_event(BridgeEvent::Message {
            backend: arena,
            message: inbound(MessageKind::Release, 0, &payload),
        })
        .await;
    assert!(harness.sessions.get(session_id).is_some());

    harness
        .sessions
        .handle_bridge_event(BridgeEvent::Message {
            backend: lobby,
            message: inbound(MessageKind::Release, 0, &payload),
        })
        .await;
    assert!(matches!(
        client.commands.try_recv(),
        Ok(ConnectionCommand::Close {
            reason: CloseReason::Kicked
        })
    ));
    assert!(harness.sessions.get(session_id).is_none());
}

#[tokio::test]
async fn test_forwarding_both_directions() {
    let harness = Harness::new();
    let lobby = harness.backend("lobby");
    let arena = harness.backend("arena");
    let mut client = harness.connect("alice").await;
    let session_id = client.session.session_id;

    harness
        .sessions
        .forward_to_backend(session_id, 4, Packet::new(0x20, &b"move"[..]))
        .await
        .unwrap();
    let forwarded = harness.transport.last_to(lobby, MessageKind::Forward).unwrap();
    let frame = ForwardFrame::from_bytes(forwarded.payload).unwrap();
    assert_eq!(frame.stream_id, 4);
    assert_eq!(frame.packet.body.as_ref(), b"move");

    let reply = ForwardFrame {
        session_id,
        stream_id: 4,
        packet: Packet::new(0x21, &b"moved"[..]),
    };
    let message = reply.clone().into_message().seal(2, current_timestamp(), &secret(9));
    harness
        .sessions
        .handle_bridge_event(BridgeEvent::Message {
            backend: arena,
            message: message.clone(),
        })
        .await;
    assert!(matches!(client.commands.try_recv(), Err(TryRecvError::Empty)));

    harness
        .sessions
        .handle_bridge_event(BridgeEvent::Message {
            backend: lobby,
            message,
        })
        .await;
    match client.commands.try_recv() {
        Ok(ConnectionCommand::Deliver { stream_id, packet }) => {
            assert_eq!(stream_id, 4);
            assert_eq!(packet, reply.packet);
        }
        other => panic!("expected delivery, got {:?}", other),
    }
}

#[tokio::test]
async fn test_backend_command_and_event() {
    let harness = Harness::new();
    let lobby = harness.backend("lobby");
    let messages = record(&harness.dispatcher, &[EventKind::BackendMessage]);
    harness
        .dispatcher
        .register_command("ping", "Replies pong", &[], |_| CommandResult::success("pong"))
        .unwrap();

    let run = CommandPayload {
        command_line: "PING".to_string(),
    };
    harness
        .sessions
        .handle_bridge_event(BridgeEvent::Message {
            backend: lobby,
            message: inbound(MessageKind::Command, 9, &run),
        })
        .await;
    let replied = |count: usize| harness.transport.sent_to(lobby, MessageKind::Ack).len() == count;
    assert!(eventually(Duration::from_secs(1), || replied(1)).await);
    let reply = harness.transport.last_to(lobby, MessageKind::Ack).unwrap();
    assert_eq!(reply.correlation_id, 9);
    let reply: AckPayload = serde_json::from_slice(&reply.payload).unwrap();
    assert!(reply.accepted);
    assert_eq!(reply.message.as_deref(), Some("pong"));

    let unknown = CommandPayload {
        command_line: "teleport alice".to_string(),
    };
    harness
        .sessions
        .handle_bridge_event(BridgeEvent::Message {
            backend: lobby,
            message: inbound(MessageKind::Command, 10, &unknown),
        })
        .await;
    assert!(eventually(Duration::from_secs(1), || replied(2)).await);
    let reply = harness.transport.last_to(lobby, MessageKind::Ack).unwrap();
    let reply: AckPayload = serde_json::from_slice(&reply.payload).unwrap();
    assert!(!reply.accepted);

    let event = EventPayload {
        channel: "party:invite".to_string(),
        data: serde_json::json!({ "from": "alice" }),
    };
    harness
        .sessions
        .handle_bridge_event(BridgeEvent::Message {
            backend: lobby,
            message: inbound(MessageKind::Event, 0, &event),
        })
        .await;
    let messages = messages.lock();
    assert!(matches!(
        &messages[..],
        [ProxyEvent::BackendMessage { channel, .. }] if channel == "party:invite"
    ));
}

#[tokio::test]
async fn test_every_session_counted_exactly_once() {
    let harness = Harness::new();
    let lobby = harness.backend("lobby");
    let arena = harness.backend("arena");
    let mut clients = Vec::new();
    for name in ["a", "b", "c", "d", "e"] {
        clients.push(harness.connect(name).await);
    }
    let handle = harness
        .sessions
        .transfer_session(clients[0].session.session_id, if clients[0].session.backend == lobby { arena } else { lobby })
        .await
        .unwrap();

    let total = |h: &Harness| h.count(lobby) + h.count(arena);
    assert_eq!(total(&harness), harness.sessions.len());

    harness
        .sessions
        .handle_handoff_ack(handle.target, handle.correlation_id, ack(true))
        .await;
    assert_eq!(total(&harness), harness.sessions.len());
    for backend in [lobby, arena] {
        assert_eq!(harness.sessions.sessions_on(backend).len(), harness.count(backend));
    }

    harness.sessions.destroy_session(clients[1].session.session_id, "quit").await;
    assert_eq!(total(&harness), 4);
}
