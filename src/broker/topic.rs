//! Topic management
//!
//! A `Topic` holds the subject index for one subscription namespace: for
//! every subject, the set of endpoints subscribed to it. An endpoint may list
//! several subjects; matching an envelope is the union over its subjects,
//! deduplicated by endpoint id and ordered by subscription time.
//!
//! Concurrency note: callers must synchronize access to `Topic` (the router
//! keeps every topic behind its state lock).

use std::collections::hash_map::Entry;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::num::NonZeroUsize;

use serde::{Deserialize, Serialize};

use crate::broker::id::EndpointId;

/// What happens when a copy is routed to an endpoint whose slots are all
/// taken by outstanding copies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// The endpoint refuses new copies until slots are released.
    #[default]
    RejectNew,
    /// The endpoint's oldest outstanding copy is evicted to make room.
    DropOld,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OverflowConfig {
    pub policy: OverflowPolicy,
    pub size: NonZeroUsize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopicConfig {
    pub name: String,
    /// Senders wait for free slots instead of skipping full endpoints.
    #[serde(default)]
    pub blocking: bool,
    /// `None` falls back to the router-wide queue settings.
    #[serde(default)]
    pub overflow: Option<OverflowConfig>,
}

impl TopicConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            blocking: false,
            overflow: None,
        }
    }

    pub fn blocking(mut self, blocking: bool) -> Self {
        self.blocking = blocking;
        self
    }

    pub fn overflow(mut self, policy: OverflowPolicy, size: NonZeroUsize) -> Self {
        self.overflow = Some(OverflowConfig { policy, size });
        self
    }
}

#[derive(Debug)]
pub struct Topic {
    pub name: String,
    pub config: TopicConfig,
    /// Created through `Router::create_topic`; survives losing its last endpoint.
    pub explicit: bool,
    subjects: HashMap<String, HashSet<EndpointId>>,
    endpoints: HashMap<EndpointId, u64>,
    next_seq: u64,
}

impl Topic {
    pub fn new(config: TopicConfig, explicit: bool) -> Self {
        Self {
            name: config.name.clone(),
            config,
            explicit,
            subjects: HashMap::new(),
            endpoints: HashMap::new(),
            next_seq: 0,
        }
    }

    /// Add an endpoint under each of `subjects`. Re-subscribing keeps the
    /// original position in the resolution order.
    pub fn subscribe<S: AsRef<str>>(&mut self, endpoint: EndpointId, subjects: &[S]) {
        let seq = self.next_seq;
        if let Entry::Vacant(e) = self.endpoints.entry(endpoint) {
            e.insert(seq);
            self.next_seq += 1;
        }
        for subject in subjects {
            self.subjects
                .entry(subject.as_ref().to_string())
                .or_default()
                .insert(endpoint);
        }
    }

    /// Remove an endpoint from every subject. Subjects left without
    /// subscribers are dropped from the index.
    pub fn unsubscribe(&mut self, endpoint: &EndpointId) {
        if self.endpoints.remove(endpoint).is_none() {
            return;
        }
        self.subjects.retain(|_, subscribers| {
            subscribers.remove(endpoint);
            !subscribers.is_empty()
        });
    }

    /// Endpoints subscribed to at least one of `subjects`, each once, in
    /// subscription order.
    pub fn matching<S: AsRef<str>>(&self, subjects: &[S]) -> Vec<EndpointId> {
        let mut ordered = BTreeMap::new();
        for subject in subjects {
            let Some(subscribers) = self.subjects.get(subject.as_ref()) else {
                continue;
            };
            for id in subscribers {
                if let Some(seq) = self.endpoints.get(id) {
                    ordered.insert(*seq, *id);
                }
            }
        }
        ordered.into_values().collect()
    }

    pub fn subject_count(&self) -> usize {
        self.subjects.len()
    }

    pub fn endpoints(&self) -> impl Iterator<Item = &EndpointId> {
        self.endpoints.keys()
    }

    pub fn is_empty(&self) -> bool {
        self.endpoints.is_empty()
    }
}
