//! End-to-end tests for the relay over loopback WebSockets.
//!
//! Covers:
//! - fan-out to every other client, sender excluded, text unchanged
//! - rejection of malformed envelopes without dropping the connection
//! - departure detection and registry cleanup
//! - a client that stops reading is dropped after the write timeout
//! - ping/pong keepalive and idle disconnect

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use castlink_relay::{router, spawn_relay, AppState, RelayConfig, RelayHandle};
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

const OFFER: &str = r#"{"sdp":{"type":"offer","sdp":"v=0..."}}"#;

async fn start_relay(config: RelayConfig) -> (SocketAddr, RelayHandle) {
    let (relay, _dispatch) = spawn_relay(config.dispatch_capacity);
    let state = AppState {
        relay: relay.clone(),
        config: Arc::new(config),
    };
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(
            listener,
            router(state).into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await
        .unwrap();
    });
    (addr, relay)
}

async fn connect(addr: SocketAddr) -> Client {
    let (ws, _) = connect_async(format!("ws://{}/signal", addr))
        .await
        .expect("connect to relay");
    ws
}

async fn wait_for_clients(relay: &RelayHandle, expected: usize) {
    for _ in 0..200 {
        if relay.stats().await.unwrap().clients == expected {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("relay never reached {} clients", expected);
}

async fn next_text(ws: &mut Client) -> String {
    loop {
        let msg = timeout(Duration::from_secs(2), ws.next())
            .await
            .expect("message within deadline")
            .expect("stream open")
            .expect("valid frame");
        if let Message::Text(text) = msg {
            return text;
        }
    }
}

async fn assert_silent(ws: &mut Client) {
    if let Ok(Some(Ok(Message::Text(text)))) =
        timeout(Duration::from_millis(200), ws.next()).await
    {
        panic!("unexpected message: {}", text);
    }
}

#[tokio::test]
async fn test_offer_delivered_unchanged_to_other_client_only() {
    let (addr, relay) = start_relay(RelayConfig::default()).await;
    let mut a = connect(addr).await;
    let mut b = connect(addr).await;
    wait_for_clients(&relay, 2).await;

    a.send(Message::Text(OFFER.to_string())).await.unwrap();

    assert_eq!(next_text(&mut b).await, OFFER);
    assert_silent(&mut a).await;
}

#[tokio::test]
async fn test_three_clients_each_receive_once() {
    let (addr, relay) = start_relay(RelayConfig::default()).await;
    let mut a = connect(addr).await;
    let mut b = connect(addr).await;
    let mut c = connect(addr).await;
    wait_for_clients(&relay, 3).await;

    let candidate = r#"{"candidate":{"candidate":"candidate:1 1 udp 1 192.0.2.7 5000 typ host","sdpMid":"0","sdpMLineIndex":0}}"#;
    a.send(Message::Text(candidate.to_string())).await.unwrap();

    assert_eq!(next_text(&mut b).await, candidate);
    assert_eq!(next_text(&mut c).await, candidate);
    assert_silent(&mut b).await;
    assert_silent(&mut c).await;
    assert_silent(&mut a).await;

    let stats = relay.stats().await.unwrap();
    assert_eq!(stats.published, 1);
    assert_eq!(stats.delivered, 2);
}

#[tokio::test]
async fn test_malformed_envelope_rejected_connection_kept() {
    let (addr, relay) = start_relay(RelayConfig::default()).await;
    let mut a = connect(addr).await;
    let mut b = connect(addr).await;
    wait_for_clients(&relay, 2).await;

    a.send(Message::Text("not json".into())).await.unwrap();
    a.send(Message::Text(
        r#"{"sdp":{"type":"offer","sdp":"x"},"candidate":{"candidate":"y"}}"#.into(),
    ))
    .await
    .unwrap();
    a.send(Message::Text("{}".into())).await.unwrap();
    a.send(Message::Text(OFFER.to_string())).await.unwrap();

    assert_eq!(next_text(&mut b).await, OFFER);
    assert_eq!(relay.stats().await.unwrap().published, 1);
    assert_eq!(relay.stats().await.unwrap().clients, 2);
}

#[tokio::test]
async fn test_disconnected_client_removed_from_registry() {
    let (addr, relay) = start_relay(RelayConfig::default()).await;
    let mut a = connect(addr).await;
    let mut b = connect(addr).await;
    wait_for_clients(&relay, 2).await;

    b.close(None).await.unwrap();
    drop(b);
    wait_for_clients(&relay, 1).await;

    a.send(Message::Text(OFFER.to_string())).await.unwrap();
    for _ in 0..100 {
        if relay.stats().await.unwrap().published == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    let stats = relay.stats().await.unwrap();
    assert_eq!(stats.published, 1);
    assert_eq!(stats.delivered, 0);
}

#[tokio::test]
async fn test_stalled_reader_unregistered_after_write_timeout() {
    let config = RelayConfig {
        max_message_bytes: 1 << 20,
        write_timeout: Duration::from_millis(100),
        ..Default::default()
    };
    let (addr, relay) = start_relay(config).await;
    let mut a = connect(addr).await;
    // b never reads, so the socket buffers fill and the relay's writes stall
    let _b = connect(addr).await;
    wait_for_clients(&relay, 2).await;

    let big_offer = format!(
        r#"{{"sdp":{{"type":"offer","sdp":"v=0 {}"}}}}"#,
        "x".repeat(512 * 1024)
    );
    for _ in 0..64 {
        a.send(Message::Text(big_offer.clone())).await.unwrap();
    }

    wait_for_clients(&relay, 1).await;

    a.send(Message::Text(OFFER.to_string())).await.unwrap();
    assert_silent(&mut a).await;
    assert_eq!(relay.stats().await.unwrap().clients, 1);
}

#[tokio::test]
async fn test_ping_answered_by_exactly_one_pong() {
    let (addr, relay) = start_relay(RelayConfig::default()).await;
    let mut a = connect(addr).await;
    wait_for_clients(&relay, 1).await;

    a.send(Message::Ping(b"keepalive".to_vec())).await.unwrap();

    let mut pongs = Vec::new();
    let _ = timeout(Duration::from_millis(500), async {
        while let Some(Ok(msg)) = a.next().await {
            if let Message::Pong(payload) = msg {
                pongs.push(payload);
            }
        }
    })
    .await;
    assert_eq!(pongs, vec![b"keepalive".to_vec()]);
}

#[tokio::test]
async fn test_ping_does_not_displace_queued_envelopes() {
    let config = RelayConfig {
        outbox_capacity: 1,
        ..Default::default()
    };
    let (addr, relay) = start_relay(config).await;
    let mut a = connect(addr).await;
    let mut b = connect(addr).await;
    wait_for_clients(&relay, 2).await;

    for _ in 0..5 {
        b.send(Message::Ping(b"k".to_vec())).await.unwrap();
    }
    a.send(Message::Text(OFFER.to_string())).await.unwrap();

    assert_eq!(next_text(&mut b).await, OFFER);
    assert_eq!(relay.stats().await.unwrap().dropped_messages, 0);
}

#[tokio::test]
async fn test_idle_client_dropped() {
    let config = RelayConfig {
        idle_timeout: Duration::from_millis(200),
        ..Default::default()
    };
    let (addr, relay) = start_relay(config).await;
    let _a = connect(addr).await;
    wait_for_clients(&relay, 1).await;
    wait_for_clients(&relay, 0).await;
}
