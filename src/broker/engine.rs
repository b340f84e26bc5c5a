//! Router engine
//!
//! This module contains the in-memory router responsible for:
//! - keeping the per-topic subject index and the endpoint registry
//! - resolving an envelope to its target endpoints through the envelope's
//!   target-kind policy
//! - fanning out one tracked copy per target
//! - applying acknowledgments and expiring copies nobody acknowledged
//!
//! Concurrency and usage notes:
//! - `Router` is a cheap clone around shared state. All broker-wide mutable
//!   state sits behind one lock, and `publish` resolves and enqueues inside a
//!   single critical section, so no reader ever sees a half fanned-out
//!   envelope and no target is lost or duplicated under concurrent sends.
//! - The lock is never held across an `.await`.
//! - The ack sweeper is designed to run as a background task; it holds only a
//!   weak reference and stops once the last `Router` handle is gone.

use std::collections::{HashMap, HashSet};
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::{Duration, Instant};

use tokio::sync::{Notify, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::broker::ack::{AckOutcome, AckState, AckThreshold, AckTracker, DeliveryReport};
use crate::broker::endpoint::{EndpointQueue, EndpointState, QueuedCopy};
use crate::broker::id::{CopyId, EndpointId, MessageId, NodeId};
use crate::broker::message::{Envelope, TargetKind, validate_subjects, validate_topic};
use crate::broker::policy::{Candidate, DropUnacknowledged, ExpiryAction, ExpiryPolicy};
use crate::broker::topic::{OverflowConfig, OverflowPolicy, Topic, TopicConfig};
use crate::utils::error::{Error, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouterConfig {
    /// Slots per endpoint for topics without their own overflow config.
    /// `None` leaves those endpoints unbounded.
    pub queue_capacity: Option<NonZeroUsize>,
    pub overflow_policy: OverflowPolicy,
    pub ack_timeout: Duration,
    pub ack_threshold: AckThreshold,
    /// How long a send to a blocking topic waits for free slots.
    pub send_timeout: Duration,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            queue_capacity: None,
            overflow_policy: OverflowPolicy::RejectNew,
            ack_timeout: Duration::from_secs(30),
            ack_threshold: AckThreshold::Received,
            send_timeout: Duration::from_secs(5),
        }
    }
}

/// What a successful publish did.
#[derive(Debug)]
pub struct PublishOutcome {
    pub message: MessageId,
    /// Number of copies enqueued.
    pub fanout: usize,
    /// Present for `All` sends.
    pub completion: Option<DeliveryCompletion>,
}

/// Resolves once every copy of an `All` send was acknowledged or retired.
#[derive(Debug)]
pub struct DeliveryCompletion {
    message: MessageId,
    expected: usize,
    rx: oneshot::Receiver<DeliveryReport>,
}

impl DeliveryCompletion {
    /// Wait for the report. Fails if any copy was retired unacknowledged.
    pub async fn wait(self) -> Result<DeliveryReport> {
        let report = self.rx.await.unwrap_or(DeliveryReport {
            message: self.message,
            expected: self.expected,
            acknowledged: 0,
            failed: self.expected,
        });
        if report.is_complete() {
            Ok(report)
        } else {
            Err(Error::Undelivered {
                message: report.message,
                expected: report.expected,
                failed: report.expected - report.acknowledged,
            })
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub dropped: usize,
    pub redelivered: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RouterStats {
    pub topics: usize,
    pub endpoints: usize,
    pub nodes: usize,
    pub outstanding: usize,
    pub published: u64,
    pub copies: u64,
    pub processed: u64,
    pub dropped: u64,
}

#[derive(Debug)]
struct EndpointEntry {
    node: NodeId,
    topic: String,
    queue: Arc<EndpointQueue>,
}

#[derive(Debug)]
struct RouterState {
    topics: HashMap<String, Topic>,
    endpoints: HashMap<EndpointId, EndpointEntry>,
    nodes: HashMap<NodeId, HashSet<EndpointId>>,
    tracker: AckTracker,
    next_copy: u64,
    stats: RouterStats,
}

#[derive(Debug)]
struct Shared {
    config: RouterConfig,
    expiry: Box<dyn ExpiryPolicy>,
    state: Mutex<RouterState>,
    slots_released: Notify,
}

#[derive(Debug, Clone)]
pub struct Router {
    shared: Arc<Shared>,
}

impl Default for Router {
    fn default() -> Self {
        Self::new(RouterConfig::default())
    }
}

impl Router {
    pub fn new(config: RouterConfig) -> Self {
        Self::with_expiry_policy(config, DropUnacknowledged)
    }

    pub fn with_expiry_policy(config: RouterConfig, expiry: impl ExpiryPolicy + 'static) -> Self {
        let tracker = AckTracker::new(config.ack_threshold);
        Self {
            shared: Arc::new(Shared {
                config,
                expiry: Box::new(expiry),
                state: Mutex::new(RouterState {
                    topics: HashMap::new(),
                    endpoints: HashMap::new(),
                    nodes: HashMap::new(),
                    tracker,
                    next_copy: 0,
                    stats: RouterStats::default(),
                }),
                slots_released: Notify::new(),
            }),
        }
    }

    pub fn config(&self) -> &RouterConfig {
        &self.shared.config
    }

    fn lock(&self) -> MutexGuard<'_, RouterState> {
        self.shared
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Declare a topic with its own settings. An implicit topic of the same
    /// name (created by a subscription) adopts the new settings.
    pub fn create_topic(&self, config: TopicConfig) -> Result<()> {
        validate_topic(&config.name)?;
        let mut state = self.lock();
        match state.topics.get_mut(&config.name) {
            Some(topic) if topic.explicit => return Err(Error::TopicExists(config.name)),
            Some(topic) => {
                topic.config = config;
                topic.explicit = true;
            }
            None => {
                info!("Created topic {}", config.name);
                state
                    .topics
                    .insert(config.name.clone(), Topic::new(config, true));
            }
        }
        Ok(())
    }

    /// Remove a topic, closing every endpoint subscribed to it. Returns the
    /// number of endpoints closed.
    pub fn delete_topic(&self, name: &str) -> Result<usize> {
        let mut state = self.lock();
        let topic = state
            .topics
            .remove(name)
            .ok_or_else(|| Error::UnknownTopic(name.to_string()))?;
        let endpoints: Vec<_> = topic.endpoints().copied().collect();
        for id in &endpoints {
            state.close_endpoint(id);
        }
        drop(state);
        self.shared.slots_released.notify_waiters();
        info!("Deleted topic {name}, closed {} endpoints", endpoints.len());
        Ok(endpoints.len())
    }

    pub fn topic_config(&self, name: &str) -> Option<TopicConfig> {
        self.lock().topics.get(name).map(|t| t.config.clone())
    }

    pub(crate) fn register_node(&self, node: NodeId) {
        self.lock().nodes.entry(node).or_default();
        debug!("Registered node {node}");
    }

    pub fn is_node_registered(&self, node: &NodeId) -> bool {
        self.lock().nodes.contains_key(node)
    }

    /// Drop a node and close every endpoint it owns. Returns how many
    /// endpoints were closed.
    pub fn disconnect_node(&self, node: &NodeId) -> usize {
        let mut state = self.lock();
        let Some(owned) = state.nodes.remove(node) else {
            return 0;
        };
        for id in &owned {
            state.close_endpoint(id);
        }
        drop(state);
        self.shared.slots_released.notify_waiters();
        info!("Disconnected node {node}, closed {} endpoints", owned.len());
        owned.len()
    }

    /// Register a new endpoint of `node` on `topic`, creating the topic on
    /// first use.
    pub(crate) fn subscribe(
        &self,
        node: NodeId,
        topic: &str,
        subjects: &[String],
    ) -> Result<(EndpointId, Arc<EndpointQueue>)> {
        validate_topic(topic)?;
        validate_subjects(subjects)?;
        let mut state = self.lock();
        let owned = state
            .nodes
            .get_mut(&node)
            .ok_or(Error::NodeDisconnected(node))?;
        let id = EndpointId::new();
        owned.insert(id);

        let queue = Arc::new(EndpointQueue::new());
        state
            .topics
            .entry(topic.to_string())
            .or_insert_with(|| {
                info!("Created topic {topic}");
                Topic::new(TopicConfig::new(topic), false)
            })
            .subscribe(id, subjects);
        state.endpoints.insert(
            id,
            EndpointEntry {
                node,
                topic: topic.to_string(),
                queue: queue.clone(),
            },
        );
        debug!("Endpoint {id} of node {node} subscribed to {topic} {subjects:?}");
        Ok((id, queue))
    }

    /// Close an endpoint and retire its outstanding copies. Idempotent;
    /// returns `false` if the endpoint was already gone.
    pub fn close_endpoint(&self, id: EndpointId) -> bool {
        let closed = self.lock().close_endpoint(&id);
        if closed {
            self.shared.slots_released.notify_waiters();
        }
        closed
    }

    /// Take an endpoint out of the subject index while its consumer finishes
    /// the copies already queued.
    pub fn drain_endpoint(&self, id: EndpointId) {
        let mut state = self.lock();
        let Some(entry) = state.endpoints.get(&id) else {
            return;
        };
        let (topic, queue) = (entry.topic.clone(), entry.queue.clone());
        state.unsubscribe(&topic, &id);
        if queue.drain() {
            state.close_endpoint(&id);
            drop(state);
            self.shared.slots_released.notify_waiters();
        } else {
            debug!("Endpoint {id} draining");
        }
    }

    pub fn endpoint_state(&self, id: &EndpointId) -> Option<EndpointState> {
        self.lock().endpoints.get(id).map(|e| e.queue.state())
    }

    /// Endpoints that would receive a copy of an envelope with this address,
    /// without sending anything.
    pub fn resolve_targets(
        &self,
        topic: &str,
        subjects: &[String],
        target_kind: TargetKind,
    ) -> Result<Vec<EndpointId>> {
        validate_topic(topic)?;
        validate_subjects(subjects)?;
        self.lock().resolve(&self.shared.config, topic, subjects, target_kind)
    }

    /// Fan an envelope out to its targets. Full endpoints on blocking topics
    /// fail the send with [`Error::Backpressure`]; see [`Router::publish_wait`].
    pub fn publish(&self, envelope: Envelope) -> Result<PublishOutcome> {
        self.publish_shared(Arc::new(envelope))
    }

    /// Like [`Router::publish`], but waits up to the configured send timeout
    /// for slots to be released when a blocking topic is full.
    pub async fn publish_wait(&self, envelope: Envelope) -> Result<PublishOutcome> {
        let envelope = Arc::new(envelope);
        let deadline = tokio::time::Instant::now() + self.shared.config.send_timeout;
        loop {
            let released = self.shared.slots_released.notified();
            match self.publish_shared(envelope.clone()) {
                Err(Error::Backpressure { topic, endpoint }) => {
                    debug!("Send to {topic} waiting for a slot on {endpoint}");
                    if tokio::time::timeout_at(deadline, released).await.is_err() {
                        warn!("Send to {topic} timed out waiting for slots");
                        return Err(Error::SendTimeout(topic));
                    }
                }
                other => return other,
            }
        }
    }

    fn publish_shared(&self, envelope: Arc<Envelope>) -> Result<PublishOutcome> {
        envelope.validate()?;
        let config = &self.shared.config;
        let mut state = self.lock();
        if let Some(sender) = &envelope.sender {
            if !state.nodes.contains_key(sender) {
                return Err(Error::NodeDisconnected(*sender));
            }
        }
        let targets = state.resolve(
            config,
            &envelope.topic,
            &envelope.subjects,
            envelope.target_kind,
        )?;
        let overflow = state.overflow_for(config, &envelope.topic);

        let now = tokio::time::Instant::now().into_std();
        let mut fanout = 0;
        for id in targets {
            let Some(queue) = state.endpoints.get(&id).map(|e| e.queue.clone()) else {
                continue;
            };
            if let Some(OverflowConfig {
                policy: OverflowPolicy::DropOld,
                size,
            }) = overflow
            {
                while state.tracker.outstanding(&id) >= size.get() {
                    let Some(oldest) = state.tracker.oldest_for(&id) else {
                        break;
                    };
                    state.tracker.retire(oldest);
                    queue.remove(oldest);
                    state.stats.dropped += 1;
                    debug!("Endpoint {id} overflowed, evicted {oldest}");
                }
            }
            let copy = CopyId(state.next_copy);
            state.next_copy += 1;
            state.tracker.track(copy, id, envelope.clone(), now);
            if queue.push(QueuedCopy {
                copy,
                envelope: envelope.clone(),
            }) {
                fanout += 1;
            } else {
                state.tracker.retire(copy);
            }
        }

        let completion = (envelope.target_kind == TargetKind::All).then(|| DeliveryCompletion {
            message: envelope.id,
            expected: fanout,
            rx: state.tracker.expect_completion(envelope.id, fanout),
        });
        state.stats.published += 1;
        state.stats.copies += fanout as u64;
        debug!(
            "Published {} to {} {:?}: {fanout} copies",
            envelope.id, envelope.topic, envelope.subjects
        );
        Ok(PublishOutcome {
            message: envelope.id,
            fanout,
            completion,
        })
    }

    pub fn mark_received(&self, copy: CopyId) -> AckOutcome {
        let outcome = self.lock().tracker.mark_received(copy);
        if outcome == AckOutcome::Unknown {
            debug!("Received ack for unknown {copy}");
        }
        outcome
    }

    pub fn mark_processed(&self, copy: CopyId) -> AckOutcome {
        let outcome = {
            let mut state = self.lock();
            let outcome = state.tracker.mark_processed(copy);
            if outcome == AckOutcome::Retired {
                state.stats.processed += 1;
            }
            outcome
        };
        match outcome {
            AckOutcome::Retired => self.shared.slots_released.notify_waiters(),
            AckOutcome::Unknown => debug!("Processed ack for unknown {copy}"),
            _ => {}
        }
        outcome
    }

    pub fn copy_state(&self, copy: CopyId) -> Option<AckState> {
        self.lock().tracker.get(&copy).map(|r| r.state)
    }

    /// Copies of `endpoint` not yet retired.
    pub fn outstanding(&self, endpoint: &EndpointId) -> usize {
        self.lock().tracker.outstanding(endpoint)
    }

    /// Apply the expiry policy to every copy whose delivery attempt is older
    /// than the ack timeout at `now`.
    pub fn sweep_expired(&self, now: Instant) -> SweepReport {
        let mut report = SweepReport::default();
        {
            let mut state = self.lock();
            let expired = state.tracker.expired(now, self.shared.config.ack_timeout);
            for record in expired {
                let queue = state.endpoints.get(&record.endpoint).map(|e| e.queue.clone());
                let action = self.shared.expiry.on_expired(&record);
                if let (ExpiryAction::Redeliver, Some(queue)) = (action, &queue) {
                    // Still waiting for the consumer to pull it.
                    if queue.contains(record.copy) {
                        state.tracker.restart(record.copy, now);
                        continue;
                    }
                    let requeued = queue.push(QueuedCopy {
                        copy: record.copy,
                        envelope: record.envelope.clone(),
                    });
                    if requeued {
                        state.tracker.redelivered(record.copy, now);
                        report.redelivered += 1;
                        debug!("Redelivering {} to {}", record.copy, record.endpoint);
                        continue;
                    }
                }
                if let Some(queue) = queue {
                    queue.remove(record.copy);
                }
                state.tracker.retire(record.copy);
                state.stats.dropped += 1;
                report.dropped += 1;
            }
        }
        if report.dropped > 0 {
            warn!("Dropped {} unacknowledged copies", report.dropped);
            self.shared.slots_released.notify_waiters();
        }
        report
    }

    /// Run [`Router::sweep_expired`] every `interval` until the router is dropped.
    /// Copy timestamps come from tokio's clock, so a paused test runtime drives
    /// expiry too.
    pub fn start_ack_sweeper(&self, interval: Duration) -> JoinHandle<()> {
        let weak: Weak<Shared> = Arc::downgrade(&self.shared);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(shared) = weak.upgrade() else {
                    break;
                };
                Router { shared }.sweep_expired(tokio::time::Instant::now().into_std());
            }
        })
    }

    pub fn stats(&self) -> RouterStats {
        let state = self.lock();
        RouterStats {
            topics: state.topics.len(),
            endpoints: state.endpoints.len(),
            nodes: state.nodes.len(),
            outstanding: state.tracker.len(),
            ..state.stats
        }
    }
}

impl RouterState {
    fn overflow_for(&self, config: &RouterConfig, topic: &str) -> Option<OverflowConfig> {
        self.topics
            .get(topic)
            .and_then(|t| t.config.overflow)
            .or_else(|| {
                config.queue_capacity.map(|size| OverflowConfig {
                    policy: config.overflow_policy,
                    size,
                })
            })
    }

    fn resolve(
        &self,
        config: &RouterConfig,
        topic_name: &str,
        subjects: &[String],
        target_kind: TargetKind,
    ) -> Result<Vec<EndpointId>> {
        let topic = self
            .topics
            .get(topic_name)
            .ok_or_else(|| Error::UnknownTopic(topic_name.to_string()))?;
        let overflow = self.overflow_for(config, topic_name);

        let mut candidates = Vec::new();
        for id in topic.matching(subjects) {
            let Some(entry) = self.endpoints.get(&id) else {
                continue;
            };
            let active = entry.queue.state() == EndpointState::Active;
            let has_room = match overflow {
                None => true,
                Some(OverflowConfig {
                    policy: OverflowPolicy::DropOld,
                    ..
                }) => true,
                Some(OverflowConfig { size, .. }) => self.tracker.outstanding(&id) < size.get(),
            };
            if topic.config.blocking && active && !has_room {
                return Err(Error::Backpressure {
                    topic: topic_name.to_string(),
                    endpoint: id,
                });
            }
            candidates.push(Candidate {
                endpoint: id,
                active,
                accepting: has_room,
            });
        }
        target_kind.policy().admit(&candidates)
    }

    fn unsubscribe(&mut self, topic_name: &str, id: &EndpointId) {
        let Some(topic) = self.topics.get_mut(topic_name) else {
            return;
        };
        topic.unsubscribe(id);
        if topic.is_empty() && !topic.explicit {
            self.topics.remove(topic_name);
            info!("Removed topic {topic_name}: no endpoints left");
        }
    }

    fn close_endpoint(&mut self, id: &EndpointId) -> bool {
        let Some(entry) = self.endpoints.remove(id) else {
            return false;
        };
        entry.queue.close();
        self.unsubscribe(&entry.topic, id);
        if let Some(owned) = self.nodes.get_mut(&entry.node) {
            owned.remove(id);
        }
        let retired = self.tracker.retire_endpoint(id);
        self.stats.dropped += retired.len() as u64;
        debug!("Closed endpoint {id}, retired {} copies", retired.len());
        true
    }
}
