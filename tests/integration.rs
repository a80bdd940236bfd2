//! Black-box end-to-end tests driving a real `Hub` over TCP with
//! `tokio-tungstenite` clients, mirroring the six scenarios called out as
//! testable properties: fan-out, slow-consumer shedding, error-handler
//! disconnect, ping cadence, graceful close, and empty-list subscribe.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use wshub::{ClientId, Hub, HubConfig, Message};

async fn spawn_hub(config: HubConfig) -> (Hub, SocketAddr) {
    let hub = Hub::new(config, "/ws");
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let router = hub.router();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    // Give the accept loop a moment to start polling.
    tokio::time::sleep(Duration::from_millis(20)).await;
    (hub, addr)
}

/// Wires `on_connect` to forward every newly-assigned id over a channel, so
/// tests can correlate a client-side connection with its server-side
/// `ClientId`.
fn track_connects(hub: &Hub) -> mpsc::UnboundedReceiver<ClientId> {
    let (tx, rx) = mpsc::unbounded_channel();
    hub.on_connect(Arc::new(move |id| {
        let _ = tx.send(id);
    }));
    rx
}

#[tokio::test]
async fn fan_out_delivers_to_every_subscriber() {
    let (hub, addr) = spawn_hub(HubConfig::default()).await;
    let mut connects = track_connects(&hub);

    let url = format!("ws://{addr}/ws");
    let (mut a, _) = tokio_tungstenite::connect_async(&url).await.unwrap();
    let (mut b, _) = tokio_tungstenite::connect_async(&url).await.unwrap();

    let id_a = connects.recv().await.unwrap();
    let id_b = connects.recv().await.unwrap();
    hub.subscribe(id_a, &["room".into()]).unwrap();
    hub.subscribe(id_b, &["room".into()]).unwrap();

    let delivered = hub.publish(Message::text("hello"), &["room".into()]);
    assert_eq!(delivered, 2);

    for client in [&mut a, &mut b] {
        let frame = client.next().await.unwrap().unwrap();
        assert_eq!(frame, WsMessage::Text("hello".into()));
    }
}

#[tokio::test]
async fn publish_targets_every_client_when_channels_empty() {
    let (hub, addr) = spawn_hub(HubConfig::default()).await;
    let mut connects = track_connects(&hub);
    let url = format!("ws://{addr}/ws");

    let (mut a, _) = tokio_tungstenite::connect_async(&url).await.unwrap();
    let _id_a = connects.recv().await.unwrap();

    let delivered = hub.publish(Message::text("broadcast"), &[]);
    assert_eq!(delivered, 1);

    let frame = a.next().await.unwrap().unwrap();
    assert_eq!(frame, WsMessage::Text("broadcast".into()));
}

#[tokio::test]
async fn slow_consumer_is_shed_on_overflow() {
    let mut config = HubConfig::default();
    config.send_buffer_capacity = 2;
    let (hub, addr) = spawn_hub(config).await;
    let mut connects = track_connects(&hub);

    let disconnected = Arc::new(AtomicBool::new(false));
    let flag = disconnected.clone();
    hub.on_disconnect(Arc::new(move |_id| {
        flag.store(true, Ordering::SeqCst);
    }));

    let url = format!("ws://{addr}/ws");
    let (_conn, _) = tokio_tungstenite::connect_async(&url).await.unwrap();
    let id = connects.recv().await.unwrap();
    hub.subscribe(id, &["feed".into()]).unwrap();

    // No `.await` between these calls: on the current-thread test runtime
    // this starves the client's writer task of a chance to drain the queue,
    // so publishing faster than the bounded queue's capacity overflows it.
    for i in 0..20 {
        hub.publish(Message::text(format!("msg {i}")), &["feed".into()]);
    }

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(disconnected.load(Ordering::SeqCst), "overflowing client should have been disconnected");
    assert!(!hub.is_subscribed(id));
}

#[tokio::test]
async fn peer_disconnect_triggers_error_handler_and_cleanup() {
    let (hub, addr) = spawn_hub(HubConfig::default()).await;
    let mut connects = track_connects(&hub);

    let error_seen = Arc::new(AtomicBool::new(false));
    let flag = error_seen.clone();
    hub.on_error(Arc::new(move |_id, _err| {
        flag.store(true, Ordering::SeqCst);
    }));

    let url = format!("ws://{addr}/ws");
    let (client, _) = tokio_tungstenite::connect_async(&url).await.unwrap();
    let id = connects.recv().await.unwrap();

    drop(client); // peer goes away without a clean close handshake
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert!(error_seen.load(Ordering::SeqCst));
    assert!(hub.channels(id).is_err(), "client should have been removed from the store");
}

#[tokio::test]
async fn writer_sends_ping_frames_on_the_configured_cadence() {
    let mut config = HubConfig::default();
    config.ping_interval = Duration::from_millis(30);
    let (_hub, addr) = spawn_hub(config).await;

    let url = format!("ws://{addr}/ws");
    let (mut client, _) = tokio_tungstenite::connect_async(&url).await.unwrap();

    let mut saw_ping = false;
    for _ in 0..10 {
        match tokio::time::timeout(Duration::from_millis(200), client.next()).await {
            Ok(Some(Ok(WsMessage::Ping(_)))) => {
                saw_ping = true;
                break;
            }
            Ok(Some(Ok(_))) => continue,
            _ => break,
        }
    }
    assert!(saw_ping, "expected at least one ping frame within the deadline");
}

#[tokio::test]
async fn close_disconnects_every_remaining_client() {
    let (hub, addr) = spawn_hub(HubConfig::default()).await;
    let mut connects = track_connects(&hub);
    let url = format!("ws://{addr}/ws");

    let (mut a, _) = tokio_tungstenite::connect_async(&url).await.unwrap();
    let (mut b, _) = tokio_tungstenite::connect_async(&url).await.unwrap();
    let _ = connects.recv().await.unwrap();
    let _ = connects.recv().await.unwrap();

    hub.close().await;
    assert_eq!(hub.count(&[]), 0);

    for client in [&mut a, &mut b] {
        let next = tokio::time::timeout(Duration::from_millis(200), client.next()).await;
        match next {
            Ok(Some(Ok(WsMessage::Close(_)))) | Ok(None) | Err(_) => {}
            Ok(Some(Ok(other))) => panic!("expected a close, got {other:?}"),
            Ok(Some(Err(_))) => {}
        }
    }
}

#[tokio::test]
async fn subscribe_with_empty_channels_is_rejected_and_unsubscribe_does_not_disconnect() {
    let (hub, addr) = spawn_hub(HubConfig::default()).await;
    let mut connects = track_connects(&hub);
    let url = format!("ws://{addr}/ws");

    let (_client, _) = tokio_tungstenite::connect_async(&url).await.unwrap();
    let id = connects.recv().await.unwrap();

    let err = hub.subscribe(id, &[]).unwrap_err();
    assert!(matches!(err, wshub::HubError::SubscriptionChannelRequired));

    hub.subscribe(id, &["a".into(), "b".into()]).unwrap();
    assert_eq!(hub.channels(id).unwrap().len(), 2);

    hub.unsubscribe(id, &[]).unwrap();
    assert_eq!(hub.channels(id).unwrap().len(), 0);
    // Unsubscribing from everything does not disconnect the client.
    assert!(hub.channels(id).is_ok());
}
