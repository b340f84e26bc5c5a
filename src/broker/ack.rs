//! Acknowledgment tracking
//!
//! Every copy the router enqueues gets a `CopyRecord` here and walks
//! `Pending -> Received -> Processed`. Reaching `Processed` retires the record
//! and frees the slot it held on its endpoint. Records can also be retired
//! early: when their endpoint closes, when they expire, or when an overflowing
//! endpoint evicts them.
//!
//! Acknowledgments may be retried by an unreliable transport, so repeating
//! one, or acknowledging a copy that is already gone, is a no-op.
//!
//! The tracker also keeps completion state for `All` sends: the sender gets a
//! `DeliveryReport` once each copy either reached the configured
//! [`AckThreshold`] or was retired without reaching it.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;

use crate::broker::id::{CopyId, EndpointId, MessageId};
use crate::broker::message::{Envelope, TargetKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AckState {
    Pending,
    Received,
    Processed,
}

/// Acknowledgment stage a copy of an `All` send must reach to count as delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AckThreshold {
    #[default]
    Received,
    Processed,
}

#[derive(Debug, Clone)]
pub struct CopyRecord {
    pub copy: CopyId,
    pub message: MessageId,
    pub endpoint: EndpointId,
    pub target_kind: TargetKind,
    pub envelope: Arc<Envelope>,
    pub state: AckState,
    pub enqueued_at: Instant,
    pub received_at: Option<DateTime<Utc>>,
    /// Times the copy has been put on its endpoint's queue.
    pub attempts: u32,
    counted: bool,
}

/// Result of applying one acknowledgment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckOutcome {
    /// The copy moved to a new state and is still outstanding.
    Advanced,
    /// The copy reached `Processed` and was retired.
    Retired,
    /// The copy was already at or past this state.
    Duplicate,
    /// No such copy, usually because it was already retired.
    Unknown,
}

/// Final tally for one `All` send.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeliveryReport {
    pub message: MessageId,
    pub expected: usize,
    pub acknowledged: usize,
    pub failed: usize,
}

impl DeliveryReport {
    pub fn is_complete(&self) -> bool {
        self.failed == 0 && self.acknowledged == self.expected
    }
}

#[derive(Debug)]
struct Completion {
    expected: usize,
    acknowledged: usize,
    failed: usize,
    tx: oneshot::Sender<DeliveryReport>,
}

#[derive(Debug, Default)]
pub struct AckTracker {
    threshold: AckThreshold,
    copies: HashMap<CopyId, CopyRecord>,
    by_endpoint: HashMap<EndpointId, BTreeSet<CopyId>>,
    completions: HashMap<MessageId, Completion>,
}

impl AckTracker {
    pub fn new(threshold: AckThreshold) -> Self {
        Self {
            threshold,
            ..Self::default()
        }
    }

    /// Start tracking a freshly enqueued copy.
    pub fn track(
        &mut self,
        copy: CopyId,
        endpoint: EndpointId,
        envelope: Arc<Envelope>,
        now: Instant,
    ) {
        self.copies.insert(
            copy,
            CopyRecord {
                copy,
                message: envelope.id,
                endpoint,
                target_kind: envelope.target_kind,
                envelope,
                state: AckState::Pending,
                enqueued_at: now,
                received_at: None,
                attempts: 1,
                counted: false,
            },
        );
        self.by_endpoint.entry(endpoint).or_default().insert(copy);
    }

    /// Register interest in the outcome of `message`, which was fanned out to
    /// `expected` copies. Must be called before any of them can be acknowledged.
    pub fn expect_completion(
        &mut self,
        message: MessageId,
        expected: usize,
    ) -> oneshot::Receiver<DeliveryReport> {
        let (tx, rx) = oneshot::channel();
        if expected == 0 {
            let _ = tx.send(DeliveryReport {
                message,
                expected: 0,
                acknowledged: 0,
                failed: 0,
            });
        } else {
            self.completions.insert(
                message,
                Completion {
                    expected,
                    acknowledged: 0,
                    failed: 0,
                    tx,
                },
            );
        }
        rx
    }

    pub fn mark_received(&mut self, copy: CopyId) -> AckOutcome {
        let Some(record) = self.copies.get_mut(&copy) else {
            return AckOutcome::Unknown;
        };
        if record.state != AckState::Pending {
            return AckOutcome::Duplicate;
        }
        record.state = AckState::Received;
        record.received_at = Some(Utc::now());
        if self.threshold == AckThreshold::Received {
            let (message, kind) = (record.message, record.target_kind);
            if Self::count(record) && kind == TargetKind::All {
                self.settle(message, true);
            }
        }
        AckOutcome::Advanced
    }

    /// Finish a copy. A `Pending` copy is treated as received first.
    pub fn mark_processed(&mut self, copy: CopyId) -> AckOutcome {
        let Some(record) = self.copies.get_mut(&copy) else {
            return AckOutcome::Unknown;
        };
        if record.state == AckState::Pending {
            record.state = AckState::Received;
            record.received_at = Some(Utc::now());
        }
        record.state = AckState::Processed;
        let counted_now = Self::count(record);
        let (message, kind) = (record.message, record.target_kind);
        if counted_now && kind == TargetKind::All {
            self.settle(message, true);
        }
        self.remove(copy);
        AckOutcome::Retired
    }

    /// Drop a copy before it was processed. Returns the record if it existed.
    pub fn retire(&mut self, copy: CopyId) -> Option<CopyRecord> {
        let record = self.remove(copy)?;
        if !record.counted && record.target_kind == TargetKind::All {
            self.settle(record.message, false);
        }
        Some(record)
    }

    /// Forcibly retire every outstanding copy of `endpoint`, whatever its state.
    pub fn retire_endpoint(&mut self, endpoint: &EndpointId) -> Vec<CopyRecord> {
        let Some(copies) = self.by_endpoint.remove(endpoint) else {
            return Vec::new();
        };
        copies
            .into_iter()
            .filter_map(|copy| self.retire(copy))
            .collect()
    }

    /// Copies whose current delivery attempt started more than `timeout` ago.
    pub fn expired(&self, now: Instant, timeout: Duration) -> Vec<CopyRecord> {
        let mut expired: Vec<_> = self
            .copies
            .values()
            .filter(|r| now.saturating_duration_since(r.enqueued_at) > timeout)
            .cloned()
            .collect();
        expired.sort_by_key(|r| r.copy);
        expired
    }

    /// Restart the expiry timer of a copy that is still waiting in its queue.
    pub fn restart(&mut self, copy: CopyId, now: Instant) {
        if let Some(record) = self.copies.get_mut(&copy) {
            record.enqueued_at = now;
        }
    }

    /// Record another delivery attempt for `copy`, restarting its timer.
    pub fn redelivered(&mut self, copy: CopyId, now: Instant) {
        if let Some(record) = self.copies.get_mut(&copy) {
            record.enqueued_at = now;
            record.attempts += 1;
        }
    }

    pub fn oldest_for(&self, endpoint: &EndpointId) -> Option<CopyId> {
        self.by_endpoint
            .get(endpoint)
            .and_then(|copies| copies.first().copied())
    }

    /// Copies of `endpoint` that have not been retired yet.
    pub fn outstanding(&self, endpoint: &EndpointId) -> usize {
        self.by_endpoint.get(endpoint).map_or(0, BTreeSet::len)
    }

    pub fn get(&self, copy: &CopyId) -> Option<&CopyRecord> {
        self.copies.get(copy)
    }

    pub fn len(&self) -> usize {
        self.copies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.copies.is_empty()
    }

    fn count(record: &mut CopyRecord) -> bool {
        !std::mem::replace(&mut record.counted, true)
    }

    fn remove(&mut self, copy: CopyId) -> Option<CopyRecord> {
        let record = self.copies.remove(&copy)?;
        if let Some(copies) = self.by_endpoint.get_mut(&record.endpoint) {
            copies.remove(&copy);
            if copies.is_empty() {
                self.by_endpoint.remove(&record.endpoint);
            }
        }
        Some(record)
    }

    fn settle(&mut self, message: MessageId, acknowledged: bool) {
        let Some(completion) = self.completions.get_mut(&message) else {
            return;
        };
        if acknowledged {
            completion.acknowledged += 1;
        } else {
            completion.failed += 1;
        }
        if completion.acknowledged + completion.failed < completion.expected {
            return;
        }
        if let Some(done) = self.completions.remove(&message) {
            let _ = done.tx.send(DeliveryReport {
                message,
                expected: done.expected,
                acknowledged: done.acknowledged,
                failed: done.failed,
            });
        }
    }
}
