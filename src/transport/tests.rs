use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc::{self, UnboundedReceiver};
use tokio::time::timeout;
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::Message as WsMessage;

use crate::broker::engine::Router;
use crate::broker::message::{Envelope, Payload, PayloadKind, TargetKind};
use crate::client::consumer::quit_payload;
use crate::transport::message::{AckStage, ClientMessage, ServerMessage};
use crate::transport::websocket::{Connection, handle_message, serve};

type Ws = WebSocketStream<TcpStream>;

async fn setup_server() -> (String, Router) {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("Failed to bind");
    let addr = listener.local_addr().unwrap().to_string();
    let router = Router::default();
    tokio::spawn(serve(listener, router.clone()));
    (addr, router)
}

async fn connect(addr: &str) -> Ws {
    let stream = TcpStream::connect(addr).await.expect("Failed to connect");
    let (ws_stream, _) = tokio_tungstenite::client_async("ws://localhost/", stream)
        .await
        .expect("WebSocket handshake failed");
    ws_stream
}

async fn send(ws: &mut Ws, msg: serde_json::Value) {
    ws.send(WsMessage::text(msg.to_string()))
        .await
        .expect("Failed to send frame");
}

async fn recv(ws: &mut Ws) -> ServerMessage {
    loop {
        let frame = timeout(Duration::from_secs(2), ws.next())
            .await
            .expect("Timed out waiting for a frame")
            .expect("Connection closed")
            .unwrap();
        if frame.is_text() {
            let text = frame.to_text().unwrap();
            return serde_json::from_str(text)
                .unwrap_or_else(|e| panic!("Failed to deserialize {text:?}: {e}"));
        }
    }
}

async fn create_endpoint(ws: &mut Ws, request_id: u64) -> crate::broker::id::EndpointId {
    send(
        ws,
        json!({
            "type": "create_endpoint",
            "request_id": request_id,
            "topic": "non-blocking",
            "subjects": ["event/test_broadcast"]
        }),
    )
    .await;
    match recv(ws).await {
        ServerMessage::EndpointCreated {
            request_id: got,
            endpoint_id,
        } => {
            assert_eq!(got, request_id);
            endpoint_id
        }
        other => panic!("Expected EndpointCreated, got {other:?}"),
    }
}

async fn wait_until(router: &Router, check: impl Fn(&Router) -> bool) {
    timeout(Duration::from_secs(2), async {
        while !check(router) {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("Condition never held");
}

#[test]
fn test_send_defaults_to_available() {
    let msg: ClientMessage = serde_json::from_value(json!({
        "type": "send",
        "topic": "t",
        "subjects": ["a"],
        "payload": { "kind": "text", "data": [104, 105] }
    }))
    .unwrap();
    match msg {
        ClientMessage::Send {
            target_kind,
            payload,
            ..
        } => {
            assert_eq!(target_kind, TargetKind::Available);
            assert_eq!(payload.kind, PayloadKind::Text);
            assert_eq!(payload.data, b"hi");
        }
        other => panic!("Expected Send, got {other:?}"),
    }
}

#[test]
fn test_ack_message_shape() {
    let msg: ClientMessage = serde_json::from_value(json!({
        "type": "ack",
        "copy_id": 42,
        "stage": "processed"
    }))
    .unwrap();
    assert!(matches!(
        msg,
        ClientMessage::Ack {
            copy_id,
            stage: AckStage::Processed
        } if copy_id.get() == 42
    ));

    let reply = serde_json::to_value(ServerMessage::Error {
        message: "nope".into(),
    })
    .unwrap();
    assert_eq!(reply, json!({ "type": "error", "message": "nope" }));
}

#[tokio::test]
async fn test_gateway_delivers_and_applies_acks() {
    let (addr, router) = setup_server().await;
    let mut consumer = connect(&addr).await;
    let mut producer = connect(&addr).await;

    let endpoint_id = create_endpoint(&mut consumer, 1).await;

    send(
        &mut producer,
        json!({
            "type": "send",
            "topic": "non-blocking",
            "subjects": ["event/test_broadcast"],
            "payload": { "kind": "text", "data": [104, 105] }
        }),
    )
    .await;
    let message_id = match recv(&mut producer).await {
        ServerMessage::Sent { message_id, fanout } => {
            assert_eq!(fanout, 1);
            message_id
        }
        other => panic!("Expected Sent, got {other:?}"),
    };

    let copy_id = match recv(&mut consumer).await {
        ServerMessage::Message {
            endpoint_id: got,
            copy_id,
            envelope,
        } => {
            assert_eq!(got, endpoint_id);
            assert_eq!(envelope.id, message_id);
            assert_eq!(envelope.payload.data, b"hi");
            assert!(envelope.sender.is_some());
            copy_id
        }
        other => panic!("Expected Message, got {other:?}"),
    };

    send(
        &mut consumer,
        json!({ "type": "ack", "copy_id": copy_id, "stage": "received" }),
    )
    .await;
    send(
        &mut consumer,
        json!({ "type": "ack", "copy_id": copy_id, "stage": "processed" }),
    )
    .await;
    wait_until(&router, |r| r.stats().processed == 1).await;
    assert_eq!(router.outstanding(&endpoint_id), 0);
}

#[tokio::test]
async fn test_gateway_reports_errors() {
    let (addr, _router) = setup_server().await;
    let mut ws = connect(&addr).await;

    ws.send(WsMessage::text("not json")).await.unwrap();
    assert!(matches!(recv(&mut ws).await, ServerMessage::Error { .. }));

    send(
        &mut ws,
        json!({
            "type": "send",
            "topic": "nowhere",
            "subjects": ["x"],
            "payload": { "kind": "text", "data": [] }
        }),
    )
    .await;
    match recv(&mut ws).await {
        ServerMessage::Error { message } => assert!(message.contains("unknown topic")),
        other => panic!("Expected Error, got {other:?}"),
    }
}

#[tokio::test]
async fn test_close_endpoint_over_gateway() {
    let (addr, router) = setup_server().await;
    let mut ws = connect(&addr).await;
    let mut other = connect(&addr).await;
    let endpoint_id = create_endpoint(&mut ws, 7).await;

    // Only the owning connection may close it.
    send(
        &mut other,
        json!({ "type": "close_endpoint", "endpoint_id": endpoint_id }),
    )
    .await;
    assert!(matches!(recv(&mut other).await, ServerMessage::Error { .. }));

    send(
        &mut ws,
        json!({ "type": "close_endpoint", "endpoint_id": endpoint_id }),
    )
    .await;
    match recv(&mut ws).await {
        ServerMessage::EndpointClosed { endpoint_id: got } => assert_eq!(got, endpoint_id),
        other => panic!("Expected EndpointClosed, got {other:?}"),
    }
    assert_eq!(router.endpoint_state(&endpoint_id), None);
}

#[tokio::test]
async fn test_socket_close_disconnects_node() {
    let (addr, router) = setup_server().await;
    let mut ws = connect(&addr).await;
    create_endpoint(&mut ws, 1).await;
    assert_eq!(router.stats().endpoints, 1);

    ws.close(None).await.unwrap();
    wait_until(&router, |r| {
        let stats = r.stats();
        stats.nodes == 0 && stats.endpoints == 0
    })
    .await;
}

async fn next_reply(rx: &mut UnboundedReceiver<ServerMessage>) -> ServerMessage {
    timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("Timed out waiting for a reply")
        .expect("Reply channel closed")
}

async fn open_endpoint(
    conn: &Arc<Connection>,
    rx: &mut UnboundedReceiver<ServerMessage>,
) -> crate::broker::id::EndpointId {
    let msg = serde_json::from_value(json!({
        "type": "create_endpoint",
        "request_id": 1,
        "topic": "non-blocking",
        "subjects": ["event/test_broadcast"]
    }))
    .unwrap();
    handle_message(conn, msg).await;
    match next_reply(rx).await {
        ServerMessage::EndpointCreated { endpoint_id, .. } => endpoint_id,
        other => panic!("Expected EndpointCreated, got {other:?}"),
    }
}

async fn next_copy_id(rx: &mut UnboundedReceiver<ServerMessage>) -> crate::broker::id::CopyId {
    match next_reply(rx).await {
        ServerMessage::Message { copy_id, .. } => copy_id,
        other => panic!("Expected Message, got {other:?}"),
    }
}

fn quit_envelope() -> Envelope {
    Envelope::new(
        "non-blocking",
        ["event/test_broadcast"],
        TargetKind::Available,
        quit_payload().unwrap(),
    )
}

#[tokio::test]
async fn test_closed_endpoint_releases_unprocessed_deliveries() {
    let router = Router::default();
    let (tx, mut rx) = mpsc::unbounded_channel();
    let conn = Arc::new(Connection::new(&router, tx));
    let endpoint_id = open_endpoint(&conn, &mut rx).await;

    router.publish(quit_envelope()).unwrap();
    let copy_id = next_copy_id(&mut rx).await;
    handle_message(
        &conn,
        ClientMessage::Ack {
            copy_id,
            stage: AckStage::Received,
        },
    )
    .await;
    assert_eq!(conn.tracked_deliveries(), 1);

    handle_message(&conn, ClientMessage::CloseEndpoint { endpoint_id }).await;
    assert!(matches!(
        next_reply(&mut rx).await,
        ServerMessage::EndpointClosed { .. }
    ));
    assert_eq!(conn.tracked_deliveries(), 0);
    assert_eq!(router.stats().outstanding, 0);
}

#[tokio::test]
async fn test_ack_for_expired_copy_drops_delivery() {
    let router = Router::default();
    let (tx, mut rx) = mpsc::unbounded_channel();
    let conn = Arc::new(Connection::new(&router, tx));
    open_endpoint(&conn, &mut rx).await;

    router
        .publish(Envelope::new(
            "non-blocking",
            ["event/test_broadcast"],
            TargetKind::Available,
            Payload::text("late"),
        ))
        .unwrap();
    let copy_id = next_copy_id(&mut rx).await;
    assert_eq!(conn.tracked_deliveries(), 1);

    let report = router.sweep_expired(Instant::now() + Duration::from_secs(3600));
    assert_eq!(report.dropped, 1);
    handle_message(
        &conn,
        ClientMessage::Ack {
            copy_id,
            stage: AckStage::Received,
        },
    )
    .await;
    assert_eq!(conn.tracked_deliveries(), 0);
}

#[tokio::test]
async fn test_node_disconnect_releases_deliveries() {
    let router = Router::default();
    let (tx, mut rx) = mpsc::unbounded_channel();
    let conn = Arc::new(Connection::new(&router, tx));
    open_endpoint(&conn, &mut rx).await;

    router.publish(quit_envelope()).unwrap();
    next_copy_id(&mut rx).await;
    assert_eq!(conn.tracked_deliveries(), 1);

    assert_eq!(conn.node().disconnect(), 1);
    assert!(matches!(
        next_reply(&mut rx).await,
        ServerMessage::EndpointClosed { .. }
    ));
    assert_eq!(conn.tracked_deliveries(), 0);
}
