//! Dispatcher behavior over in-memory sockets

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use duggu_api::{FrameStream, MessageDispatcher};
use duggu_core::auth::Identity;
use duggu_core::models::{MessageType, RoomId};
use duggu_core::test_helpers::{memory_connection, MemorySink};
use duggu_hub::{Broadcaster, RoomRegistry};
use duggu_sfu::test_helpers::FakeEngine;
use duggu_sfu::{SfuConfig, SfuManager};
use serde_json::json;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

struct ScriptedStream(mpsc::UnboundedReceiver<Result<String, String>>);

#[async_trait::async_trait]
impl FrameStream for ScriptedStream {
    async fn recv(&mut self) -> Option<Result<String, String>> {
        self.0.recv().await
    }
}

struct Client {
    frames: mpsc::UnboundedSender<Result<String, String>>,
    sink: MemorySink,
    session: JoinHandle<()>,
}

impl Client {
    fn connect(dispatcher: &Arc<MessageDispatcher>) -> Self {
        Self::connect_as(dispatcher, Identity::anonymous())
    }

    fn connect_as(dispatcher: &Arc<MessageDispatcher>, identity: Identity) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let (connection, sink) = memory_connection();
        let dispatcher = Arc::clone(dispatcher);
        let session = tokio::spawn(async move {
            let mut stream = ScriptedStream(rx);
            dispatcher.run(connection, identity, &mut stream).await;
        });
        Self {
            frames: tx,
            sink,
            session,
        }
    }

    fn send(&self, message: serde_json::Value) {
        self.send_raw(&message.to_string());
    }

    fn send_raw(&self, frame: &str) {
        self.frames.send(Ok(frame.to_string())).unwrap();
    }

    fn of_type(&self, message_type: MessageType) -> Vec<duggu_core::models::Envelope> {
        self.sink
            .envelopes()
            .into_iter()
            .filter(|e| e.message_type == message_type)
            .collect()
    }

    async fn disconnect(self) -> MemorySink {
        drop(self.frames);
        self.session.await.unwrap();
        self.sink
    }
}

struct Harness {
    dispatcher: Arc<MessageDispatcher>,
    engine: Arc<FakeEngine>,
}

impl Harness {
    fn new() -> Self {
        let registry = Arc::new(RoomRegistry::new());
        let broadcaster = Arc::new(Broadcaster::new(registry));
        let engine = FakeEngine::new();
        let sfu = SfuManager::new(
            engine.clone(),
            SfuConfig {
                ice_servers: Vec::new(),
                max_sync_attempts: 25,
                resync_backoff: Duration::from_millis(50),
            },
        );
        Self {
            dispatcher: Arc::new(MessageDispatcher::new(broadcaster, sfu, 16)),
            engine,
        }
    }

    fn registry(&self) -> &Arc<RoomRegistry> {
        self.dispatcher.registry()
    }
}

async fn eventually<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..300 {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {what}");
}

fn join(room: i64, user: &str) -> serde_json::Value {
    json!({"messagetype": 1, "roomid": room, "user": user})
}

#[tokio::test]
async fn test_join_then_text_reaches_every_member() {
    let h = Harness::new();
    let room = RoomId::new(7);

    let x = Client::connect(&h.dispatcher);
    x.send(join(7, "alice"));
    eventually("alice to join", || async { h.registry().member_count(room) == 1 }).await;

    let y = Client::connect(&h.dispatcher);
    y.send(join(7, "bob"));
    eventually("bob to join", || async { h.registry().member_count(room) == 2 }).await;

    x.send(json!({"messagetype": 0, "roomid": 7, "data": "hi"}));
    eventually("both to get the text", || async {
        x.of_type(MessageType::Text).len() == 1 && y.of_type(MessageType::Text).len() == 1
    })
    .await;

    for client in [&x, &y] {
        let text = &client.of_type(MessageType::Text)[0];
        assert_eq!(text.data, "hi");
        assert_eq!(text.user, "alice");
        assert!(!text.time.is_empty());
    }

    // both joins were announced to alice, with distinct membership ids
    let joins = x.of_type(MessageType::JoinRoom);
    assert_eq!(joins.len(), 2);
    assert_eq!(joins[0].user, "alice");
    assert_eq!(joins[1].user, "bob");
    assert_ne!(joins[0].connection_id, joins[1].connection_id);

    let stamps: Vec<String> = x.sink.envelopes().into_iter().map(|e| e.time).collect();
    assert!(stamps.windows(2).all(|w| w[0] <= w[1]));
}

#[tokio::test]
async fn test_join_is_visible_before_the_next_message() {
    let h = Harness::new();
    let x = Client::connect(&h.dispatcher);

    x.send(join(3, "alice"));
    x.send(json!({"messagetype": 0, "roomid": 3, "data": "first"}));

    eventually("the text to arrive", || async { !x.of_type(MessageType::Text).is_empty() }).await;
    let types: Vec<MessageType> = x.sink.envelopes().into_iter().map(|e| e.message_type).collect();
    assert_eq!(types, vec![MessageType::JoinRoom, MessageType::Text]);
}

#[tokio::test]
async fn test_malformed_frames_are_skipped() {
    let h = Harness::new();
    let x = Client::connect(&h.dispatcher);

    x.send_raw("not json");
    x.send_raw(r#"{"messagetype": 42, "roomid": 1}"#);
    x.send(join(1, "alice"));

    eventually("the join after garbage", || async { !x.of_type(MessageType::JoinRoom).is_empty() }).await;
    assert_eq!(x.sink.frames().len(), 1);
    assert!(!x.sink.is_closed());
}

#[tokio::test]
async fn test_leave_deletes_the_room_for_everyone() {
    let h = Harness::new();
    let room = RoomId::new(7);

    let x = Client::connect(&h.dispatcher);
    let y = Client::connect(&h.dispatcher);
    x.send(join(7, "alice"));
    eventually("alice to join", || async { h.registry().member_count(room) == 1 }).await;
    y.send(join(7, "bob"));
    eventually("bob to join", || async { h.registry().member_count(room) == 2 }).await;

    y.send(json!({"messagetype": 2, "roomid": 7}));
    eventually("both to hear the leave", || async {
        x.of_type(MessageType::LeaveRoom).len() == 1 && y.of_type(MessageType::LeaveRoom).len() == 1
    })
    .await;
    assert!(!h.registry().contains(room));

    // a text to the deleted room reaches nobody; the join after it marks the
    // point where it has been handled
    x.send(json!({"messagetype": 0, "roomid": 7, "data": "anyone?"}));
    x.send(join(8, "alice"));
    eventually("alice to join room 8", || async { h.registry().member_count(RoomId::new(8)) == 1 }).await;
    eventually("the room 8 join to be delivered", || async {
        x.of_type(MessageType::JoinRoom).iter().any(|e| e.room_id == RoomId::new(8))
    })
    .await;

    assert!(x.of_type(MessageType::Text).is_empty());
    assert!(y.of_type(MessageType::Text).is_empty());
}

#[tokio::test]
async fn test_non_member_cannot_borrow_a_membership_id() {
    let h = Harness::new();
    let room = RoomId::new(7);

    let bob = Client::connect(&h.dispatcher);
    bob.send(join(7, "bob"));
    eventually("bob's join", || async { !bob.of_type(MessageType::JoinRoom).is_empty() }).await;
    let bob_id = bob.of_type(MessageType::JoinRoom)[0].connection_id.clone();
    assert!(!bob_id.is_empty());

    let z = Client::connect(&h.dispatcher);
    z.send(json!({"messagetype": 0, "roomid": 7, "connectionid": bob_id, "data": "it's me"}));
    eventually("the text", || async { !bob.of_type(MessageType::Text).is_empty() }).await;

    let text = &bob.of_type(MessageType::Text)[0];
    assert_eq!(text.connection_id, "");
    assert_eq!(h.registry().member_count(room), 1);
}

#[tokio::test]
async fn test_video_call_for_unknown_room_gets_an_error_reply() {
    let h = Harness::new();
    let x = Client::connect(&h.dispatcher);

    x.send(json!({"messagetype": 4, "roomid": 99}));

    eventually("the error reply", || async { !x.sink.frames().is_empty() }).await;
    let reply: serde_json::Value = serde_json::from_str(&x.sink.frames()[0]).unwrap();
    assert_eq!(reply, json!({"error": "room 99 does not exist"}));
    assert!(h.engine.peers().is_empty());
}

#[tokio::test]
async fn test_video_call_negotiates_and_routes_answers_and_candidates() {
    let h = Harness::new();
    let room = RoomId::new(5);
    let x = Client::connect(&h.dispatcher);

    x.send(join(5, "alice"));
    x.send(json!({"messagetype": 4, "roomid": 5}));
    eventually("the offer", || async { !x.of_type(MessageType::Offer).is_empty() }).await;

    let offer = x.of_type(MessageType::Offer).remove(0);
    assert_eq!(offer.room_id, room);
    assert!(!offer.peer_id.is_empty());

    x.send(json!({
        "messagetype": 7,
        "roomid": 5,
        "rtcpeerid": offer.peer_id,
        "data": r#"{"type":"answer","sdp":"v=0"}"#,
    }));
    x.send(json!({
        "messagetype": 5,
        "roomid": 5,
        "rtcpeerid": offer.peer_id,
        "data": r#"{"candidate":"candidate:1 1 udp 1 10.0.0.1 5000 typ host","sdpMid":"0"}"#,
    }));
    // a client offer is never applied
    x.send(json!({
        "messagetype": 6,
        "roomid": 5,
        "rtcpeerid": offer.peer_id,
        "data": r#"{"type":"offer","sdp":"v=0"}"#,
    }));

    let peer = h.engine.last_peer().unwrap();
    eventually("answer and candidate to be applied", || {
        let peer = peer.clone();
        async move { peer.remote_descriptions().len() == 1 && peer.candidates().len() == 1 }
    })
    .await;

    // signaling is never broadcast
    assert!(x.of_type(MessageType::Answer).is_empty());
    assert!(x.of_type(MessageType::Candidate).is_empty());
    assert_eq!(h.dispatcher.sfu().peer_ids(room).await.len(), 1);
}

#[tokio::test]
async fn test_room_deleted_during_admission_leaves_no_peer() {
    let h = Harness::new();
    let room = RoomId::new(11);

    let x = Client::connect(&h.dispatcher);
    x.send(join(11, "alice"));
    eventually("alice to join", || async { h.registry().member_count(room) == 1 }).await;

    let gate = h.engine.hold_peer_creation();
    x.send(json!({"messagetype": 4, "roomid": 11}));
    eventually("admission to start", || async { h.engine.creations_waiting() == 1 }).await;

    let y = Client::connect(&h.dispatcher);
    y.send(json!({"messagetype": 2, "roomid": 11}));
    eventually("the room to go", || async { !h.registry().contains(room) }).await;

    gate.add_permits(1);
    eventually("the error reply", || async {
        x.sink.frames().iter().any(|f| f.contains("room 11 does not exist"))
    })
    .await;

    assert!(h.dispatcher.sfu().peer_ids(room).await.is_empty());
    assert_eq!(h.engine.peers().len(), 1);
    assert_eq!(h.engine.peers()[0].state(), duggu_sfu::PeerConnectionState::Closed);
}

#[tokio::test]
async fn test_delete_channel_releases_one_peer() {
    let h = Harness::new();
    let room = RoomId::new(6);
    let x = Client::connect(&h.dispatcher);

    x.send(join(6, "alice"));
    x.send(json!({"messagetype": 4, "roomid": 6}));
    eventually("the offer", || async { !x.of_type(MessageType::Offer).is_empty() }).await;
    let peer_id = x.of_type(MessageType::Offer).remove(0).peer_id;

    x.send(json!({"messagetype": 8, "roomid": 6, "rtcpeerid": peer_id}));
    eventually("the peer to go", || async { h.dispatcher.sfu().peer_ids(room).await.is_empty() }).await;

    // the chat room is untouched
    assert_eq!(h.registry().member_count(room), 1);
}

#[tokio::test]
async fn test_disconnect_releases_memberships_and_peers() {
    let h = Harness::new();
    let room = RoomId::new(9);

    let stays = Client::connect(&h.dispatcher);
    stays.send(join(9, "bob"));
    eventually("bob to join", || async { h.registry().member_count(room) == 1 }).await;

    let x = Client::connect(&h.dispatcher);
    x.send(join(9, "alice"));
    x.send(json!({"messagetype": 4, "roomid": 9}));
    eventually("alice's offer", || async { !x.of_type(MessageType::Offer).is_empty() }).await;
    assert_eq!(h.registry().member_count(room), 2);

    let sink = x.disconnect().await;

    assert!(sink.is_closed());
    assert_eq!(h.registry().member_count(room), 1);
    assert!(h.dispatcher.sfu().peer_ids(room).await.is_empty());
    assert!(h
        .engine
        .peers()
        .iter()
        .all(|p| p.state() == duggu_sfu::PeerConnectionState::Closed));
}

#[tokio::test]
async fn test_read_error_ends_the_session() {
    let h = Harness::new();
    let x = Client::connect(&h.dispatcher);

    x.send(join(4, "alice"));
    x.frames.send(Err("protocol violation".to_string())).unwrap();
    // never read; the session may already be gone
    let _ = x
        .frames
        .send(Ok(json!({"messagetype": 0, "roomid": 4, "data": "late"}).to_string()));

    tokio::time::timeout(Duration::from_secs(3), async {
        while !x.session.is_finished() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();

    assert!(x.sink.is_closed());
    assert!(!h.registry().contains(RoomId::new(4)));
    assert!(x.of_type(MessageType::Text).is_empty());
}

#[tokio::test]
async fn test_verified_identity_names_the_member() {
    let h = Harness::new();
    let x = Client::connect_as(
        &h.dispatcher,
        Identity {
            user_id: Some(1),
            display_name: "carol".to_string(),
        },
    );

    x.send(join(2, "mallory"));
    eventually("the join", || async { !x.of_type(MessageType::JoinRoom).is_empty() }).await;

    assert_eq!(x.of_type(MessageType::JoinRoom)[0].user, "carol");
    assert_eq!(h.registry().members_of(RoomId::new(2))[0].1.display_name, "carol");
}
