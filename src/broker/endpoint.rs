//! Endpoints and deliveries
//!
//! An `Endpoint` is the consumer side of one subscription. The router pushes
//! copies into its queue; the owner pulls them with [`Endpoint::next_copy`] or
//! the [`Endpoint::messages`] stream. A pull suspends until a copy arrives or
//! the endpoint ends, and `None` is the only end-of-stream signal: closing the
//! endpoint, draining it empty, and tearing down its node all look the same.
//!
//! Queue locks are only ever taken after the router lock, never before it.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures::Stream;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;

use crate::broker::ack::AckState;
use crate::broker::engine::Router;
use crate::broker::id::{CopyId, EndpointId, MessageId, NodeId};
use crate::broker::message::{Envelope, Payload};
use crate::utils::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndpointState {
    Active,
    /// No new copies; the consumer finishes what is queued.
    Draining,
    Closed,
}

#[derive(Debug, Clone)]
pub(crate) struct QueuedCopy {
    pub copy: CopyId,
    pub envelope: Arc<Envelope>,
}

#[derive(Debug)]
struct QueueInner {
    state: EndpointState,
    items: VecDeque<QueuedCopy>,
}

pub(crate) enum Next {
    Item(QueuedCopy),
    Empty,
    /// `drained` is set by the pop that moved a draining queue to `Closed`.
    Ended { drained: bool },
}

#[derive(Debug)]
pub(crate) struct EndpointQueue {
    inner: Mutex<QueueInner>,
    notify: Notify,
}

impl EndpointQueue {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(QueueInner {
                state: EndpointState::Active,
                items: VecDeque::new(),
            }),
            notify: Notify::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append a copy. Returns `false` (and drops it) unless the queue is active.
    pub fn push(&self, item: QueuedCopy) -> bool {
        {
            let mut inner = self.lock();
            if inner.state != EndpointState::Active {
                return false;
            }
            inner.items.push_back(item);
        }
        self.notify.notify_waiters();
        true
    }

    pub fn pop(&self) -> Next {
        let mut inner = self.lock();
        if inner.state == EndpointState::Closed {
            return Next::Ended { drained: false };
        }
        if let Some(item) = inner.items.pop_front() {
            return Next::Item(item);
        }
        if inner.state == EndpointState::Draining {
            inner.state = EndpointState::Closed;
            return Next::Ended { drained: true };
        }
        Next::Empty
    }

    /// Returns `true` if this call closed the queue.
    pub fn close(&self) -> bool {
        let closed = {
            let mut inner = self.lock();
            inner.items.clear();
            std::mem::replace(&mut inner.state, EndpointState::Closed) != EndpointState::Closed
        };
        self.notify.notify_waiters();
        closed
    }

    /// Stop accepting copies. Returns `true` if the queue was already empty
    /// and is therefore closed right away.
    pub fn drain(&self) -> bool {
        let closed = {
            let mut inner = self.lock();
            if inner.state == EndpointState::Active {
                inner.state = EndpointState::Draining;
            }
            if inner.state == EndpointState::Draining && inner.items.is_empty() {
                inner.state = EndpointState::Closed;
            }
            inner.state == EndpointState::Closed
        };
        self.notify.notify_waiters();
        closed
    }

    pub fn remove(&self, copy: CopyId) -> bool {
        let mut inner = self.lock();
        let before = inner.items.len();
        inner.items.retain(|item| item.copy != copy);
        inner.items.len() != before
    }

    pub fn contains(&self, copy: CopyId) -> bool {
        self.lock().items.iter().any(|item| item.copy == copy)
    }

    pub fn state(&self) -> EndpointState {
        self.lock().state
    }

    pub fn len(&self) -> usize {
        self.lock().items.len()
    }
}

/// One copy of an envelope, as handed to the endpoint's consumer.
#[derive(Debug, Clone)]
pub struct Delivery {
    copy: CopyId,
    endpoint: EndpointId,
    envelope: Arc<Envelope>,
    router: Router,
}

impl Delivery {
    /// Acknowledge receipt. Repeating it is harmless.
    pub fn received(&self) {
        self.router.mark_received(self.copy);
    }

    /// Acknowledge that handling finished; frees the endpoint slot.
    pub fn processed(&self) {
        self.router.mark_processed(self.copy);
    }

    pub fn json<T: DeserializeOwned>(&self) -> Result<T> {
        self.envelope.payload.decode_json()
    }

    pub fn copy_id(&self) -> CopyId {
        self.copy
    }

    pub fn endpoint_id(&self) -> EndpointId {
        self.endpoint
    }

    pub fn message_id(&self) -> MessageId {
        self.envelope.id
    }

    pub fn envelope(&self) -> &Envelope {
        &self.envelope
    }

    pub fn payload(&self) -> &Payload {
        &self.envelope.payload
    }

    /// Current acknowledgment state, `None` once the copy was retired.
    pub fn ack_state(&self) -> Option<AckState> {
        self.router.copy_state(self.copy)
    }
}

/// Subscription handle bound to one topic and a set of subjects.
///
/// Dropping the endpoint closes it.
#[derive(Debug)]
pub struct Endpoint {
    id: EndpointId,
    node: NodeId,
    topic: String,
    subjects: Vec<String>,
    queue: Arc<EndpointQueue>,
    router: Router,
}

impl Endpoint {
    pub(crate) fn new(
        id: EndpointId,
        node: NodeId,
        topic: String,
        subjects: Vec<String>,
        queue: Arc<EndpointQueue>,
        router: Router,
    ) -> Self {
        Self {
            id,
            node,
            topic,
            subjects,
            queue,
            router,
        }
    }

    /// Wait for the next copy. `None` means the endpoint is finished for good.
    pub async fn next_copy(&self) -> Option<Delivery> {
        loop {
            let notified = self.queue.notify.notified();
            match self.queue.pop() {
                Next::Item(QueuedCopy { copy, envelope }) => {
                    return Some(Delivery {
                        copy,
                        endpoint: self.id,
                        envelope,
                        router: self.router.clone(),
                    });
                }
                Next::Ended { drained } => {
                    if drained {
                        self.router.close_endpoint(self.id);
                    }
                    return None;
                }
                Next::Empty => notified.await,
            }
        }
    }

    /// The endpoint's copies as a stream that ends with the endpoint.
    pub fn messages(&self) -> impl Stream<Item = Delivery> + '_ {
        futures::stream::unfold(self, |endpoint| async move {
            endpoint.next_copy().await.map(|delivery| (delivery, endpoint))
        })
    }

    /// Close the endpoint. Waiting consumers get end-of-stream and every copy
    /// still outstanding is retired.
    pub fn close(&self) {
        self.router.close_endpoint(self.id);
    }

    /// Stop receiving new copies but let the consumer finish the queued ones.
    pub fn drain(&self) {
        self.router.drain_endpoint(self.id);
    }

    pub fn state(&self) -> EndpointState {
        self.queue.state()
    }

    /// Copies waiting in the queue, not counting ones already handed out.
    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    pub fn id(&self) -> EndpointId {
        self.id
    }

    pub fn node_id(&self) -> NodeId {
        self.node
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn subjects(&self) -> &[String] {
        &self.subjects
    }
}

impl Drop for Endpoint {
    fn drop(&mut self) {
        self.router.close_endpoint(self.id);
    }
}
