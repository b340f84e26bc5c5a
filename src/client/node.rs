//! Node representation
//!
//! A `Node` is one participant attached to a router: it creates endpoints and
//! sends envelopes. Every endpoint it creates belongs to it, and
//! disconnecting the node (explicitly or by dropping it) closes them all, so
//! their consumers see end-of-stream. Use [`Node::is_connected`] to tell a
//! disconnect apart from an ordinary end of messages.

use std::sync::atomic::{AtomicBool, Ordering};

use tracing::info;

use crate::broker::ack::DeliveryReport;
use crate::broker::endpoint::Endpoint;
use crate::broker::engine::{PublishOutcome, Router};
use crate::broker::id::NodeId;
use crate::broker::message::Envelope;
use crate::utils::error::{Error, Result};

#[derive(Debug)]
pub struct Node {
    id: NodeId,
    router: Router,
    connected: AtomicBool,
}

impl Node {
    pub fn connect(router: &Router) -> Self {
        let id = NodeId::new();
        router.register_node(id);
        info!("Node {id} connected");
        Self {
            id,
            router: router.clone(),
            connected: AtomicBool::new(true),
        }
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub fn router(&self) -> &Router {
        &self.router
    }

    fn ensure_connected(&self) -> Result<()> {
        if self.is_connected() {
            Ok(())
        } else {
            Err(Error::NodeDisconnected(self.id))
        }
    }

    /// Subscribe a new endpoint to `subjects` on `topic`.
    pub fn create_endpoint<S>(
        &self,
        topic: &str,
        subjects: impl IntoIterator<Item = S>,
    ) -> Result<Endpoint>
    where
        S: Into<String>,
    {
        self.ensure_connected()?;
        let subjects: Vec<String> = subjects.into_iter().map(Into::into).collect();
        let (id, queue) = self.router.subscribe(self.id, topic, &subjects)?;
        Ok(Endpoint::new(
            id,
            self.id,
            topic.to_string(),
            subjects,
            queue,
            self.router.clone(),
        ))
    }

    /// Send an envelope on behalf of this node. On blocking topics this
    /// waits for free slots, bounded by the router's send timeout.
    pub async fn send_message(&self, mut envelope: Envelope) -> Result<PublishOutcome> {
        self.ensure_connected()?;
        envelope.sender = Some(self.id);
        self.router.publish_wait(envelope).await
    }

    /// Send and, for `All` envelopes, wait until every copy was acknowledged.
    /// `Available` envelopes report their fan-out as acknowledged right away.
    pub async fn send_and_confirm(&self, envelope: Envelope) -> Result<DeliveryReport> {
        let outcome = self.send_message(envelope).await?;
        match outcome.completion {
            Some(completion) => completion.wait().await,
            None => Ok(DeliveryReport {
                message: outcome.message,
                expected: outcome.fanout,
                acknowledged: outcome.fanout,
                failed: 0,
            }),
        }
    }

    /// Detach from the router, closing every endpoint of this node.
    /// Returns the number of endpoints closed; later calls return 0.
    pub fn disconnect(&self) -> usize {
        if !self.connected.swap(false, Ordering::SeqCst) {
            return 0;
        }
        let closed = self.router.disconnect_node(&self.id);
        info!("Node {} disconnected", self.id);
        closed
    }
}

impl Drop for Node {
    fn drop(&mut self) {
        self.disconnect();
    }
}
