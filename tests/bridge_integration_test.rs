//! Integration tests against a fake bridge on a real TCP socket.
//!
//! The test acts as the remote peer: it accepts the client's connection,
//! reads the frames it sends, and writes records back.

use std::sync::Arc;
use std::time::Duration;

use busbridge::bridge::{read_frame, write_frame, DEFAULT_MAX_FRAME_SIZE};
use busbridge::{BridgeClient, BridgeConfig, BridgeError, Dispatcher, DispatcherState, MessageKind};
use serde_json::{json, Value};
use tokio::net::{TcpListener, TcpStream};

const WAIT: Duration = Duration::from_secs(5);

/// Bind a fake bridge and connect a client to it.
async fn connected_pair() -> (BridgeClient, TcpStream) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let address = listener.local_addr().unwrap().to_string();

    let (client, accepted) = tokio::join!(BridgeClient::connect(&address), listener.accept());
    (client.unwrap(), accepted.unwrap().0)
}

async fn peer_read(peer: &mut TcpStream) -> Value {
    let payload = tokio::time::timeout(WAIT, read_frame(peer, DEFAULT_MAX_FRAME_SIZE))
        .await
        .expect("timed out waiting for a frame")
        .unwrap();
    serde_json::from_slice(&payload).unwrap()
}

async fn peer_write(peer: &mut TcpStream, record: Value) {
    let payload = serde_json::to_vec(&record).unwrap();
    write_frame(peer, &payload, DEFAULT_MAX_FRAME_SIZE).await.unwrap();
}

#[tokio::test]
async fn test_register_is_observed_by_peer() {
    let (client, mut peer) = connected_pair().await;

    client.register("foo.bar").await.unwrap();

    let record = peer_read(&mut peer).await;
    assert_eq!(record["type"], json!("register"));
    assert_eq!(record["address"], json!("foo.bar"));
    assert!(record["body"].is_null());
    assert!(record.get("replyAddress").is_none());
}

#[tokio::test]
async fn test_send_and_publish_reach_peer_in_order() {
    let (client, mut peer) = connected_pair().await;

    client
        .send_with_reply("foo.bar", "anywhere", None, &json!({"text": "hello"}))
        .await
        .unwrap();
    client
        .publish("news", Some(json!({"h": "v"})), &json!([1, 2]))
        .await
        .unwrap();

    let sent = peer_read(&mut peer).await;
    assert_eq!(sent["type"], json!("send"));
    assert_eq!(sent["replyAddress"], json!("anywhere"));
    assert_eq!(sent["body"], json!({"text": "hello"}));

    let published = peer_read(&mut peer).await;
    assert_eq!(published["type"], json!("publish"));
    assert_eq!(published["headers"], json!({"h": "v"}));
    assert!(published.get("replyAddress").is_none());
}

#[tokio::test]
async fn test_receive_reply_from_peer() {
    let (client, mut peer) = connected_pair().await;

    client.send_with_reply("svc", "reply.1", None, &json!(7)).await.unwrap();
    let request = peer_read(&mut peer).await;
    let reply_to = request["replyAddress"].as_str().unwrap().to_string();

    peer_write(
        &mut peer,
        json!({"type": "message", "address": reply_to, "headers": null, "body": {"ok": true}}),
    )
    .await;

    let reply = tokio::time::timeout(WAIT, client.receive()).await.unwrap().unwrap();
    assert_eq!(reply.kind, MessageKind::Message);
    assert_eq!(reply.address, "reply.1");
    assert_eq!(reply.body, Some(json!({"ok": true})));
}

#[tokio::test]
async fn test_peer_disconnect_is_reported() {
    let (client, peer) = connected_pair().await;
    drop(peer);

    let err = tokio::time::timeout(WAIT, client.receive()).await.unwrap().unwrap_err();
    assert!(err.is_disconnect(), "got {err:?}");
}

#[tokio::test]
async fn test_connect_with_config_applies_frame_limit() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let config = BridgeConfig {
        address: listener.local_addr().unwrap().to_string(),
        max_frame_size: 32,
        ..BridgeConfig::default()
    };

    let (client, accepted) = tokio::join!(BridgeClient::connect_with_config(&config), listener.accept());
    let client = client.unwrap();
    let _peer = accepted.unwrap().0;

    let err = client.send("a", None, &"x".repeat(64)).await.unwrap_err();
    assert!(matches!(err, BridgeError::FrameTooLarge { max: 32, .. }));
}

#[tokio::test]
async fn test_dispatcher_end_to_end() {
    let (client, mut peer) = connected_pair().await;
    let dispatcher = Dispatcher::new(Arc::new(client));

    let mut orders = dispatcher.register("orders", 8).await.unwrap();
    let mut audit = dispatcher.register("orders", 8).await.unwrap();
    assert_eq!(peer_read(&mut peer).await["type"], json!("register"));
    dispatcher.start().unwrap();

    peer_write(&mut peer, json!({"type": "message", "address": "orders", "body": {"id": 1}})).await;
    peer_write(&mut peer, json!({"type": "message", "address": "orders", "body": {"id": 2}})).await;

    for subscription in [&mut orders, &mut audit] {
        for id in 1..=2 {
            let got = tokio::time::timeout(WAIT, subscription.recv()).await.unwrap().unwrap();
            assert_eq!(got.body, Some(json!({"id": id})));
        }
    }

    dispatcher.unregister("orders", &orders.id).await.unwrap();
    dispatcher.unregister("orders", &audit.id).await.unwrap();
    let record = peer_read(&mut peer).await;
    assert_eq!(record["type"], json!("unregister"));
    assert_eq!(record["address"], json!("orders"));

    // Peer goes away; the dispatcher records it and stops.
    drop(peer);
    let error = tokio::time::timeout(WAIT, dispatcher.wait_for_error()).await.unwrap().unwrap();
    assert!(error.is_disconnect(), "got {error:?}");

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(dispatcher.state(), DispatcherState::Stopped);
}

#[tokio::test]
async fn test_dispatcher_request_reply() {
    let (client, mut peer) = connected_pair().await;
    let dispatcher = Dispatcher::new(Arc::new(client));
    dispatcher.start().unwrap();

    let args = json!([2, 3]);
    let (reply, ()) = tokio::join!(
        dispatcher.request("math.add", None, &args, WAIT),
        async {
            let request = peer_read(&mut peer).await;
            assert_eq!(request["body"], json!([2, 3]));
            let reply_to = request["replyAddress"].clone();
            peer_write(&mut peer, json!({"type": "message", "address": reply_to, "body": 5})).await;
        }
    );

    assert_eq!(reply.unwrap().body, Some(json!(5)));
    dispatcher.stop();
}
