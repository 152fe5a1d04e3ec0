//! Mesh clients meeting through an in-process broker

mod common;

use std::time::Duration;

use meshcall::client::{ClientError, ClientEvent};
use meshcall::network::HealthEvent;
use meshcall::session::{
    LeaveReason, ModerationEvent, RemoteMicEvent, RemoteMicRole, RoomEvent, RoomState,
    ValidationError,
};

use common::{start_system_client, EventLog, StubBroker};

fn joined(event: &ClientEvent, name: &str) -> bool {
    matches!(event, ClientEvent::Room(RoomEvent::PeerJoined { display_name, .. })
        if display_name == name)
}

/// Test: Invalid room ids are refused before connecting
/// Given a client and a running broker
/// When joining a room with an invalid id
/// Then the join fails and no connection is opened
#[tokio::test]
async fn test_invalid_room_id_never_connects() {
    let broker = StubBroker::start().await;
    let client = start_system_client(&broker);

    let result = client.join_room("ab", "Alice").await;
    assert!(matches!(
        result,
        Err(ClientError::Validation(ValidationError::InvalidRoomId(_)))
    ));

    let result = client.join_room("bad room!", "Alice").await;
    assert!(matches!(
        result,
        Err(ClientError::Validation(ValidationError::InvalidRoomId(_)))
    ));

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(broker.accepted(), 0);
    client.shutdown().await;
}

/// Test: Two clients find each other and chat
/// Given two clients joining the same room
/// When A sends a chat message
/// Then each sees the other join and B receives the message
#[tokio::test]
async fn test_two_clients_meet_and_chat() {
    let broker = StubBroker::start().await;
    let alice = start_system_client(&broker);
    let bob = start_system_client(&broker);
    let alice_log = EventLog::attach(&alice);
    let bob_log = EventLog::attach(&bob);

    alice.join_room("room-1", "Alice").await.unwrap();
    bob.join_room("room-1", "Bob").await.unwrap();

    alice_log.wait_for("Bob joining", |e| joined(e, "Bob")).await;
    bob_log.wait_for("Alice joining", |e| joined(e, "Alice")).await;

    let snapshot = alice.snapshot().await.unwrap();
    assert_eq!(snapshot.room_id.as_deref(), Some("room-1"));
    assert_eq!(snapshot.room_state, RoomState::Connected);
    assert_eq!(snapshot.members.len(), 1);
    assert!(snapshot.members.contains_key(bob.local_peer_id()));

    alice.send_chat_message("hello bob").await.unwrap();
    let event = bob_log
        .wait_for("chat", |e| {
            matches!(e, ClientEvent::Room(RoomEvent::ChatMessage { .. }))
        })
        .await;
    match event {
        ClientEvent::Room(RoomEvent::ChatMessage {
            peer_id,
            display_name,
            text,
            ..
        }) => {
            assert_eq!(&peer_id, alice.local_peer_id());
            assert_eq!(display_name, "Alice");
            assert_eq!(text, "hello bob");
        }
        other => panic!("unexpected event {:?}", other),
    }

    alice.shutdown().await;
    bob.shutdown().await;
}

/// Test: Leaving while the join is still connecting cancels the join
/// Given a client whose join is waiting for the broker connection
/// When it leaves before the connection completes
/// Then the join fails as cancelled and the room is never entered
#[tokio::test]
async fn test_leave_cancels_connecting_join() {
    let broker = StubBroker::start().await;
    let client = start_system_client(&broker);

    let (join, leave) = tokio::join!(client.join_room("room-1", "Alice"), client.leave_room());
    assert!(matches!(join, Err(ClientError::JoinCancelled)));
    assert!(leave.is_ok());

    tokio::time::sleep(Duration::from_millis(300)).await;
    let snapshot = client.snapshot().await.unwrap();
    assert!(snapshot.room_id.is_none());
    assert_eq!(snapshot.room_state, RoomState::Idle);
    assert_eq!(broker.subscribe_count("meshcall/room-1"), 0);

    // The connection is reused by the next join
    client.join_room("room-1", "Alice").await.unwrap();
    let snapshot = client.snapshot().await.unwrap();
    assert_eq!(snapshot.room_id.as_deref(), Some("room-1"));
    assert_eq!(broker.accepted(), 1);
    client.shutdown().await;
}

/// Test: Chat validation happens in the client
/// Given a client in a room
/// When sending an empty or oversized message
/// Then it is rejected with a validation error
#[tokio::test]
async fn test_chat_validation() {
    let broker = StubBroker::start().await;
    let client = start_system_client(&broker);

    assert!(matches!(
        client.send_chat_message("hi").await,
        Err(ClientError::Validation(ValidationError::NotInRoom))
    ));

    client.join_room("room-1", "Alice").await.unwrap();
    assert!(matches!(
        client.send_chat_message("   ").await,
        Err(ClientError::Validation(ValidationError::EmptyMessage))
    ));
    assert!(matches!(
        client.send_chat_message(&"x".repeat(1001)).await,
        Err(ClientError::Validation(ValidationError::MessageTooLong { .. }))
    ));
    client.shutdown().await;
}

/// Test: Leaving is seen by the remaining peer
/// Given two clients in a room
/// When B leaves
/// Then A sees B leave and goes back to searching
#[tokio::test]
async fn test_leave_room() {
    let broker = StubBroker::start().await;
    let alice = start_system_client(&broker);
    let bob = start_system_client(&broker);
    let alice_log = EventLog::attach(&alice);

    alice.join_room("room-1", "Alice").await.unwrap();
    bob.join_room("room-1", "Bob").await.unwrap();
    alice_log.wait_for("Bob joining", |e| joined(e, "Bob")).await;

    bob.leave_room().await.unwrap();
    let bob_id = bob.local_peer_id().clone();
    alice_log
        .wait_for("Bob leaving", |e| {
            matches!(e, ClientEvent::Room(RoomEvent::PeerLeft { peer_id, reason: LeaveReason::Left })
                if *peer_id == bob_id)
        })
        .await;

    let snapshot = alice.snapshot().await.unwrap();
    assert_eq!(snapshot.room_state, RoomState::Searching);
    assert!(snapshot.members.is_empty());

    let snapshot = bob.snapshot().await.unwrap();
    assert_eq!(snapshot.room_state, RoomState::Idle);
    assert!(snapshot.room_id.is_none());

    alice.shutdown().await;
    bob.shutdown().await;
}

/// Test: A locked room turns newcomers away
/// Given A and B in a room that A locks
/// When C tries to join
/// Then C is told the room is locked and leaves
#[tokio::test]
async fn test_locked_room_refuses_newcomer() {
    let broker = StubBroker::start().await;
    let alice = start_system_client(&broker);
    let bob = start_system_client(&broker);
    let carol = start_system_client(&broker);
    let alice_log = EventLog::attach(&alice);
    let bob_log = EventLog::attach(&bob);
    let carol_log = EventLog::attach(&carol);

    alice.join_room("room-1", "Alice").await.unwrap();
    bob.join_room("room-1", "Bob").await.unwrap();
    alice_log.wait_for("Bob joining", |e| joined(e, "Bob")).await;

    alice.set_room_locked(true).await.unwrap();
    bob_log
        .wait_for("lock", |e| {
            matches!(e, ClientEvent::Moderation(ModerationEvent::RoomLockChanged { locked: true, .. }))
        })
        .await;

    carol.join_room("room-1", "Carol").await.unwrap();
    carol_log
        .wait_for("locked notice", |e| {
            matches!(e, ClientEvent::Moderation(ModerationEvent::RoomLocked))
        })
        .await;
    carol_log
        .wait_for("error", |e| matches!(e, ClientEvent::Error(_)))
        .await;

    let snapshot = carol.snapshot().await.unwrap();
    assert!(snapshot.room_id.is_none());

    // Only B is a member for A
    let snapshot = alice.snapshot().await.unwrap();
    assert_eq!(snapshot.members.len(), 1);
    assert!(!alice_log.snapshot().iter().any(|e| joined(e, "Carol")));

    // Bob cannot unlock a room Alice locked
    assert!(matches!(
        bob.set_room_locked(false).await,
        Err(ClientError::Moderation(_))
    ));

    alice.shutdown().await;
    bob.shutdown().await;
    carol.shutdown().await;
}

/// Test: Remote mic between two clients
/// Given two clients in a room with the virtual device ready
/// When A requests B's speakers and B accepts
/// Then both report the session started
#[tokio::test]
async fn test_remote_mic_between_clients() {
    let broker = StubBroker::start().await;
    let alice = start_system_client(&broker);
    let bob = start_system_client(&broker);
    let alice_log = EventLog::attach(&alice);
    let bob_log = EventLog::attach(&bob);

    alice.join_room("room-1", "Alice").await.unwrap();
    bob.join_room("room-1", "Bob").await.unwrap();
    alice_log.wait_for("Bob joining", |e| joined(e, "Bob")).await;
    bob_log.wait_for("Alice joining", |e| joined(e, "Alice")).await;

    let request_id = alice.request_remote_mic(bob.local_peer_id()).await.unwrap();
    bob_log
        .wait_for("incoming request", |e| {
            matches!(e, ClientEvent::RemoteMic(RemoteMicEvent::IncomingRequest { .. }))
        })
        .await;

    // A second request while one is pending is refused locally
    assert!(matches!(
        alice.request_remote_mic(bob.local_peer_id()).await,
        Err(ClientError::Conflict(_))
    ));

    bob.respond_remote_mic_request(true).await.unwrap();

    let expected = ClientEvent::RemoteMic(RemoteMicEvent::Started {
        request_id: request_id.clone(),
        role: RemoteMicRole::Source,
        peer_id: bob.local_peer_id().clone(),
    });
    alice_log.wait_for("source started", |e| *e == expected).await;
    bob_log
        .wait_for("target started", |e| {
            matches!(e, ClientEvent::RemoteMic(RemoteMicEvent::Started { role: RemoteMicRole::Target, .. }))
        })
        .await;

    alice.stop_remote_mic().unwrap();
    bob_log
        .wait_for("stopped", |e| {
            matches!(e, ClientEvent::RemoteMic(RemoteMicEvent::Stopped { .. }))
        })
        .await;

    alice.shutdown().await;
    bob.shutdown().await;
}

/// Test: Broker loss is reported and recovered
/// Given a client in a room
/// When the broker drops the connection
/// Then the client reports going offline and back online
#[tokio::test]
async fn test_network_loss_and_recovery() {
    let broker = StubBroker::start().await;
    let client = start_system_client(&broker);
    let log = EventLog::attach(&client);

    client.join_room("room-1", "Alice").await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    broker.kick_all();
    log.wait_for("offline", |e| {
        matches!(e, ClientEvent::Health(HealthEvent::NetworkChanged(status))
            if !status.is_online && status.was_in_room_when_offline)
    })
    .await;

    let count_online = || {
        log.snapshot()
            .iter()
            .filter(|e| {
                matches!(e, ClientEvent::Health(HealthEvent::NetworkChanged(status))
                    if status.is_online)
            })
            .count()
    };
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while count_online() == 0 {
        assert!(tokio::time::Instant::now() < deadline, "never came back online");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    assert!(!client.manual_reconnect().await.unwrap());
    while broker.subscribe_count("meshcall/room-1") < 2 {
        assert!(tokio::time::Instant::now() < deadline, "room never resubscribed");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    client.shutdown().await;
}
