//! WebSocket gateway
//!
//! This file implements a minimal WebSocket server that lets remote clients
//! take part as nodes. Responsibilities:
//! - Accept TCP/WebSocket connections
//! - Connect a `Node` for each connection; disconnecting the socket
//!   disconnects the node and ends all of its endpoints
//! - Forward each endpoint's copies to the socket and apply the client's
//!   acknowledgments to the matching deliveries
//! - Serialize/deserialize the JSON protocol in `transport::message`
//!
//! Sends are handled in the connection's read loop, so a send to a full
//! blocking topic holds up that connection's later frames until it resolves.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc::{self, UnboundedSender};
use tokio_tungstenite::accept_async;
use tracing::{debug, info, warn};
use tungstenite::protocol::Message as WsMessage;

use crate::broker::endpoint::{Delivery, Endpoint};
use crate::broker::engine::Router;
use crate::broker::id::{CopyId, EndpointId};
use crate::broker::message::Envelope;
use crate::client::Node;
use crate::transport::message::{AckStage, ClientMessage, ServerMessage};
use crate::utils::error::Result;

pub(crate) struct Connection {
    node: Node,
    tx: UnboundedSender<ServerMessage>,
    endpoints: Mutex<HashSet<EndpointId>>,
    /// Copies handed to the client and not yet retired. An endpoint's entries
    /// are dropped when its forwarder ends.
    deliveries: Mutex<HashMap<CopyId, Delivery>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Connection {
    pub(crate) fn new(router: &Router, tx: UnboundedSender<ServerMessage>) -> Self {
        Self {
            node: Node::connect(router),
            tx,
            endpoints: Mutex::new(HashSet::new()),
            deliveries: Mutex::new(HashMap::new()),
        }
    }

    pub(crate) fn node(&self) -> &Node {
        &self.node
    }

    pub(crate) fn tracked_deliveries(&self) -> usize {
        lock(&self.deliveries).len()
    }

    fn reply(&self, msg: ServerMessage) {
        if self.tx.send(msg).is_err() {
            debug!("Dropping reply for node {}: writer closed", self.node.id());
        }
    }

    fn error(&self, message: impl Into<String>) {
        self.reply(ServerMessage::Error {
            message: message.into(),
        });
    }

    fn forget_endpoint(&self, endpoint_id: EndpointId) {
        lock(&self.endpoints).remove(&endpoint_id);
        lock(&self.deliveries).retain(|_, d| d.endpoint_id() != endpoint_id);
    }
}

pub async fn start_websocket_server(addr: String, router: Router) -> Result<()> {
    let listener = TcpListener::bind(&addr).await?;
    info!("WebSocket gateway listening on ws://{addr}");
    serve(listener, router).await
}

/// Accept connections on an already bound listener until accepting fails.
pub async fn serve(listener: TcpListener, router: Router) -> Result<()> {
    loop {
        let (stream, peer) = listener.accept().await?;
        let router = router.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_connection(stream, router).await {
                warn!("Connection from {peer} failed: {e}");
            }
        });
    }
}

async fn handle_connection(stream: TcpStream, router: Router) -> Result<()> {
    let ws_stream = accept_async(stream).await?;
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<ServerMessage>();

    let conn = Arc::new(Connection::new(&router, tx));
    let node_id = conn.node.id();

    let writer = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            let text = match serde_json::to_string(&msg) {
                Ok(json) => json,
                Err(e) => {
                    warn!("Failed to serialize reply for node {node_id}: {e}");
                    continue;
                }
            };
            if let Err(e) = ws_sender.send(WsMessage::text(text)).await {
                debug!("Send loop for node {node_id} closed: {e}");
                break;
            }
        }
    });

    while let Some(frame) = ws_receiver.next().await {
        let frame = match frame {
            Ok(frame) => frame,
            Err(e) => {
                debug!("Read error from node {node_id}: {e}");
                break;
            }
        };
        if frame.is_close() {
            break;
        }
        if !frame.is_text() {
            continue;
        }
        let Ok(text) = frame.to_text() else {
            continue;
        };
        match serde_json::from_str::<ClientMessage>(text) {
            Ok(msg) => handle_message(&conn, msg).await,
            Err(err) => {
                warn!(
                    "Invalid client message from node {node_id}: {err} | {}",
                    text.chars().take(100).collect::<String>()
                );
                conn.error(format!("invalid message: {err}"));
            }
        }
    }

    conn.node.disconnect();
    drop(conn);
    let _ = writer.await;
    info!("Connection for node {node_id} closed");
    Ok(())
}

pub(crate) async fn handle_message(conn: &Arc<Connection>, msg: ClientMessage) {
    match msg {
        ClientMessage::CreateEndpoint {
            request_id,
            topic,
            subjects,
        } => match conn.node.create_endpoint(&topic, subjects) {
            Ok(endpoint) => {
                let endpoint_id = endpoint.id();
                lock(&conn.endpoints).insert(endpoint_id);
                conn.reply(ServerMessage::EndpointCreated {
                    request_id,
                    endpoint_id,
                });
                spawn_forwarder(conn.clone(), endpoint);
            }
            Err(e) => conn.error(e.to_string()),
        },
        ClientMessage::CloseEndpoint { endpoint_id } => {
            if lock(&conn.endpoints).contains(&endpoint_id) {
                conn.node.router().close_endpoint(endpoint_id);
            } else {
                conn.error(format!("unknown endpoint {endpoint_id}"));
            }
        }
        ClientMessage::Send {
            topic,
            subjects,
            target_kind,
            payload,
        } => {
            let envelope = Envelope::new(topic, subjects, target_kind, payload);
            match conn.node.send_message(envelope).await {
                Ok(outcome) => conn.reply(ServerMessage::Sent {
                    message_id: outcome.message,
                    fanout: outcome.fanout,
                }),
                Err(e) => conn.error(e.to_string()),
            }
        }
        ClientMessage::Ack { copy_id, stage } => {
            let Some(delivery) = lock(&conn.deliveries).get(&copy_id).cloned() else {
                debug!("Ack for unknown {copy_id} from node {}", conn.node.id());
                return;
            };
            if delivery.ack_state().is_none() {
                // Retired by close, expiry or eviction; nothing left to ack.
                lock(&conn.deliveries).remove(&copy_id);
                debug!("Ack for retired {copy_id} from node {}", conn.node.id());
                return;
            }
            match stage {
                AckStage::Received => delivery.received(),
                AckStage::Processed => {
                    lock(&conn.deliveries).remove(&copy_id);
                    delivery.processed();
                }
            }
        }
    }
}

/// Pump one endpoint's copies into the socket until the endpoint ends.
fn spawn_forwarder(conn: Arc<Connection>, endpoint: Endpoint) {
    tokio::spawn(async move {
        let endpoint_id = endpoint.id();
        while let Some(delivery) = endpoint.next_copy().await {
            let msg = ServerMessage::Message {
                endpoint_id,
                copy_id: delivery.copy_id(),
                envelope: delivery.envelope().clone(),
            };
            lock(&conn.deliveries).insert(delivery.copy_id(), delivery);
            if conn.tx.send(msg).is_err() {
                break;
            }
        }
        conn.forget_endpoint(endpoint_id);
        conn.reply(ServerMessage::EndpointClosed { endpoint_id });
    });
}
