//! End-to-end scenarios driving a real [`wireio::Server`] over an in-memory
//! channel pair, covering the attach/emit, ack, broadcast-ack, heartbeat,
//! binary, and middleware-rejection flows a Socket.IO v5 server must support.

mod common;

use std::sync::atomic::Ordering;
use std::time::Duration;

use serde_json::json;

use wireio::adapter::LocalAdapter;
use wireio::ack::BroadcastOutcome;
use wireio::error::NamespaceError;
use wireio::packet::{ArgValue, Packet};
use wireio::{Server, ServerConfig, SocketId};

use common::{as_binary, as_text, channel_pair, parse_ack_event_header};

async fn attach(client: &mut common::TestClient) -> SocketId {
    let open = as_text(client.recv_within(500).await);
    assert!(open.starts_with("Hopen"), "expected the handshake control frame, got {open:?}");

    client.send_text("0");
    let ack = as_text(client.recv_within(500).await);
    assert!(ack.starts_with('0'), "expected a CONNECT ack, got {ack:?}");
    let payload: serde_json::Value = serde_json::from_str(&ack[1..]).unwrap();
    payload["sid"].as_str().unwrap().parse().unwrap()
}

#[tokio::test]
async fn attach_and_emit() {
    let server = Server::<LocalAdapter>::new(ServerConfig::default());
    let ns = server.of("/");
    ns.on_connection(|socket| {
        socket.emit("welcome", json!({"msg": "hi"})).unwrap();
    });

    let (channel, mut client) = channel_pair();
    server.accept(Box::new(channel));

    attach(&mut client).await;
    let event = as_text(client.recv_within(500).await);
    assert_eq!(event, r#"2["welcome",{"msg":"hi"}]"#);
}

#[tokio::test]
async fn acknowledged_request_from_client_to_server() {
    let server = Server::<LocalAdapter>::new(ServerConfig::default());
    let ns = server.of("/");
    ns.on_connection(|socket| {
        socket.on("add", |socket, args, _bin, ack_id| {
            let items = args.as_array().expect("event args are an array");
            let sum = items[0].as_i64().unwrap() + items[1].as_i64().unwrap();
            socket.ack(ack_id.expect("client asked for an ack"), json!(sum)).unwrap();
        });
    });

    let (channel, mut client) = channel_pair();
    server.accept(Box::new(channel));
    attach(&mut client).await;

    client.send_text(r#"217["add",2,3]"#);
    let reply = as_text(client.recv_within(500).await);
    assert_eq!(reply, "317[5]");
}

#[tokio::test]
async fn acknowledged_broadcast_times_out_for_a_silent_target() {
    let config = ServerConfig::builder().ack_timeout_default(Duration::from_millis(150)).build();
    let server = Server::<LocalAdapter>::new(config);
    let ns = server.of("/");

    let (channel1, mut client1) = channel_pair();
    server.accept(Box::new(channel1));
    let sid1 = attach(&mut client1).await;

    let (channel2, mut client2) = channel_pair();
    server.accept(Box::new(channel2));
    let _sid2 = attach(&mut client2).await;

    let handle = ns.emit_with_ack("ping", json!(null)).unwrap();

    let event1 = as_text(client1.recv_within(500).await);
    let (ack_id, payload) = parse_ack_event_header(&event1);
    assert_eq!(payload, json!(["ping", null]));
    client1.send_text(format!("3{ack_id}[\"pong\"]"));

    // client2 is sent the same request but never answers it.
    let _event2 = client2.recv_within(500).await;

    match tokio::time::timeout(Duration::from_secs(1), handle.wait()).await.unwrap() {
        BroadcastOutcome::TimedOut(entries) => {
            assert_eq!(entries.len(), 1);
            assert_eq!(entries[0].socket, sid1);
            assert_eq!(entries[0].result.as_ref().unwrap().args, vec![json!("pong")]);
        }
        BroadcastOutcome::Complete(_) => panic!("the second target never acknowledged; this must time out"),
    }
}

#[tokio::test]
async fn a_silent_client_is_disconnected_after_the_ping_timeout() {
    tokio::time::pause();

    let config = ServerConfig::builder()
        .ping_interval(Duration::from_millis(10))
        .ping_timeout(Duration::from_millis(15))
        .build();
    let server = Server::<LocalAdapter>::new(config);

    let (channel, mut client) = channel_pair();
    server.accept(Box::new(channel));
    attach(&mut client).await;

    // Never answer any ping; drain frames (handshake pings) until the
    // connection gives up and drops the channel.
    let closed = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match client.recv().await {
                Some(_) => continue,
                None => return,
            }
        }
    })
    .await;

    assert!(closed.is_ok(), "connection never closed the channel");
    assert!(client.closed.load(Ordering::SeqCst), "close() was never called on the channel");
}

#[tokio::test]
async fn binary_attachment_round_trips_through_an_echo_handler() {
    let server = Server::<LocalAdapter>::new(ServerConfig::default());
    let ns = server.of("/");
    ns.on_connection(|socket| {
        socket.on("frame", |socket, _args, bin, _ack_id| {
            socket.emit_binary("frame-ack", json!(null), bin).unwrap();
        });
    });

    let (channel, mut client) = channel_pair();
    server.accept(Box::new(channel));
    attach(&mut client).await;

    let blob = vec![0xDE, 0xAD, 0xBE, 0xEF];
    let inbound = Packet::event("/", "frame", vec![ArgValue::Binary(blob.clone())]);
    for frame in inbound.encode() {
        client.send_frame(frame);
    }

    let header = as_text(client.recv_within(500).await);
    assert_eq!(header, r#"51-["frame-ack",null,{"_placeholder":true,"num":0}]"#);
    let attachment = as_binary(client.recv_within(500).await);
    assert_eq!(attachment, blob);
}

#[tokio::test]
async fn rejecting_middleware_sends_a_connect_error() {
    let server = Server::<LocalAdapter>::new(ServerConfig::default());
    let ns = server.of("/");
    ns.use_middleware(|_handshake| Err(NamespaceError::new("unauthorized")));

    let (channel, mut client) = channel_pair();
    server.accept(Box::new(channel));

    let open = as_text(client.recv_within(500).await);
    assert!(open.starts_with("Hopen"));

    client.send_text("0");
    let reply = as_text(client.recv_within(500).await);
    assert_eq!(reply, r#"4{"message":"unauthorized"}"#);
    assert_eq!(ns.socket_count(), 0);
}

#[tokio::test]
async fn room_scoped_broadcast_excludes_non_members() {
    let server = Server::<LocalAdapter>::new(ServerConfig::default());
    let ns = server.of("/");

    let (channel1, mut client1) = channel_pair();
    server.accept(Box::new(channel1));
    let sid1 = attach(&mut client1).await;

    let (channel2, mut client2) = channel_pair();
    server.accept(Box::new(channel2));
    let _sid2 = attach(&mut client2).await;

    let socket1 = ns.get_socket(sid1).expect("socket1 attached");
    socket1.join("lobby").unwrap();

    ns.to("lobby").emit("lobby-only", json!("hi")).unwrap();

    let event = as_text(client1.recv_within(500).await);
    assert_eq!(event, r#"2["lobby-only","hi"]"#);

    // client2 never joined "lobby"; it should see nothing beyond its own
    // handshake traffic within a short window.
    let nothing = tokio::time::timeout(Duration::from_millis(50), client2.recv()).await;
    assert!(nothing.is_err(), "client2 should not have received a room-scoped broadcast");
}
