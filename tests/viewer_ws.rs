// tests/viewer_ws.rs
use dobot_relay::{
    Relay, build_router,
    config::Settings,
    handlers::cors_layer,
    models::WsMessage,
    transport::{MemoryTransport, Transport},
};
use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async, tungstenite::Message};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

async fn serve() -> (Arc<Relay>, SocketAddr) {
    let transport: Arc<dyn Transport> = Arc::new(MemoryTransport::new());
    let relay = Relay::new(&Settings::default(), transport);
    let app = build_router(Arc::clone(&relay), cors_layer("*").expect("cors"));

    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local addr");
    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("serve");
    });
    (relay, addr)
}

async fn connect(addr: SocketAddr, query: &str) -> Socket {
    let (socket, _) = connect_async(format!("ws://{addr}/ws{query}"))
        .await
        .expect("websocket handshake");
    socket
}

async fn next_message(socket: &mut Socket) -> WsMessage {
    loop {
        let frame = tokio::time::timeout(Duration::from_secs(5), socket.next())
            .await
            .expect("message before timeout")
            .expect("socket open")
            .expect("valid frame");
        if let Message::Text(text) = frame {
            return serde_json::from_str(text.as_str()).expect("relay sends valid json");
        }
    }
}

async fn send(socket: &mut Socket, text: &str) {
    socket
        .send(Message::Text(text.to_string().into()))
        .await
        .expect("send frame");
}

async fn http_get(addr: SocketAddr, path: &str) -> String {
    let mut stream = TcpStream::connect(addr).await.expect("connect");
    let request = format!("GET {path} HTTP/1.1\r\nHost: {addr}\r\nConnection: close\r\n\r\n");
    stream.write_all(request.as_bytes()).await.expect("write request");
    let mut response = String::new();
    stream.read_to_string(&mut response).await.expect("read response");
    response
}

#[tokio::test]
async fn viewer_gets_snapshot_then_updates_and_command_replies() {
    let (relay, addr) = serve().await;
    let mut socket = connect(addr, "").await;

    assert!(matches!(
        next_message(&mut socket).await,
        WsMessage::StateSnapshot { sequence: 0, .. }
    ));

    send(&mut socket, r#"{"type":"send_command","action":"calibrate"}"#).await;
    match next_message(&mut socket).await {
        WsMessage::CommandAccepted { action, correlation_id } => {
            assert_eq!(action, "calibrate");
            assert!(!correlation_id.is_empty());
        }
        other => panic!("expected command_accepted, got {other:?}"),
    }

    relay
        .ingest_device_message("device/status", br#"{"status":"Running"}"#)
        .await
        .expect("ingest");
    match next_message(&mut socket).await {
        WsMessage::StateUpdate { sequence, delta } => {
            assert_eq!(sequence, 1);
            assert!(delta.status.is_some());
            assert!(delta.telemetry.is_none());
        }
        other => panic!("expected state_update, got {other:?}"),
    }
}

#[tokio::test]
async fn bad_viewer_frames_get_error_replies() {
    let (_relay, addr) = serve().await;
    let mut socket = connect(addr, "").await;
    next_message(&mut socket).await;

    send(&mut socket, "not json").await;
    assert!(matches!(
        next_message(&mut socket).await,
        WsMessage::Error { code, .. } if code == "parse_error"
    ));

    send(&mut socket, r#"{"type":"send_command","action":"fly"}"#).await;
    assert!(matches!(
        next_message(&mut socket).await,
        WsMessage::Error { code, .. } if code == "invalid_command"
    ));

    send(&mut socket, r#"{"type":"transport_status","connected":true}"#).await;
    assert!(matches!(
        next_message(&mut socket).await,
        WsMessage::Error { code, .. } if code == "invalid_command"
    ));
}

#[tokio::test]
async fn reconnecting_viewer_resumes_from_its_last_sequence() {
    let (relay, addr) = serve().await;
    for status in ["Running", "Idle"] {
        let payload = format!(r#"{{"status":"{status}"}}"#);
        relay
            .ingest_device_message("device/status", payload.as_bytes())
            .await
            .expect("ingest");
    }

    let mut socket = connect(addr, "?resume_from=1").await;
    assert!(matches!(
        next_message(&mut socket).await,
        WsMessage::TransportStatus { connected: false }
    ));
    assert!(matches!(
        next_message(&mut socket).await,
        WsMessage::StateUpdate { sequence: 2, .. }
    ));
}

#[tokio::test]
async fn disconnecting_viewer_is_unregistered() {
    let (relay, addr) = serve().await;
    let mut socket = connect(addr, "").await;
    next_message(&mut socket).await;
    assert_eq!(relay.sessions().len(), 1);

    socket.close(None).await.expect("close");
    drop(socket);

    for _ in 0..50 {
        if relay.sessions().is_empty() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("session still registered after close");
}

#[tokio::test]
async fn http_endpoints_report_state_and_health() {
    let (relay, addr) = serve().await;
    relay
        .ingest_device_message("device/status", br#"{"status":"Moving"}"#)
        .await
        .expect("ingest");

    let state = http_get(addr, "/api/state").await;
    assert!(state.starts_with("HTTP/1.1 200"), "{state}");
    assert!(state.contains(r#""status":"Moving""#), "{state}");
    assert!(state.contains(r#""max_history":50"#), "{state}");

    let health = http_get(addr, "/health").await;
    assert!(health.starts_with("HTTP/1.1 200"), "{health}");
    assert!(health.contains(r#""transport_connected":false"#), "{health}");

    let docs = http_get(addr, "/api-doc/openapi.json").await;
    assert!(docs.contains("/api/state"), "{docs}");
}
