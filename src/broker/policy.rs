//! Pluggable routing and expiry policies.
//!
//! `TargetPolicy` decides which of the endpoints matching an envelope get a
//! copy. `ExpiryPolicy` decides what happens to a copy nobody acknowledged in
//! time. The router only ever talks to the traits.

use std::fmt::Debug;

use crate::broker::ack::{AckState, CopyRecord};
use crate::broker::id::EndpointId;
use crate::broker::message::TargetKind;
use crate::utils::error::{Error, Result};

/// A matched endpoint as seen at resolution time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Candidate {
    pub endpoint: EndpointId,
    /// The endpoint is open and still subscribed.
    pub active: bool,
    /// The endpoint has a free slot, or its overflow policy makes room.
    pub accepting: bool,
}

pub trait TargetPolicy: Debug + Send + Sync {
    /// Pick the endpoints that receive a copy. An error aborts the whole
    /// send; nothing is enqueued.
    fn admit(&self, candidates: &[Candidate]) -> Result<Vec<EndpointId>>;
}

/// Best effort: skip whoever cannot take the copy right now.
#[derive(Debug, Clone, Copy, Default)]
pub struct AvailablePolicy;

impl TargetPolicy for AvailablePolicy {
    fn admit(&self, candidates: &[Candidate]) -> Result<Vec<EndpointId>> {
        Ok(candidates
            .iter()
            .filter(|c| c.active && c.accepting)
            .map(|c| c.endpoint)
            .collect())
    }
}

/// Strict: every matched endpoint must accept.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllPolicy;

impl TargetPolicy for AllPolicy {
    fn admit(&self, candidates: &[Candidate]) -> Result<Vec<EndpointId>> {
        if let Some(refused) = candidates.iter().find(|c| !(c.active && c.accepting)) {
            return Err(Error::TargetRejected(refused.endpoint));
        }
        Ok(candidates.iter().map(|c| c.endpoint).collect())
    }
}

impl TargetKind {
    pub fn policy(&self) -> &'static dyn TargetPolicy {
        match self {
            TargetKind::Available => &AvailablePolicy,
            TargetKind::All => &AllPolicy,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpiryAction {
    /// Retire the copy without telling anyone.
    Drop,
    /// Put the copy back on its endpoint's queue.
    Redeliver,
}

pub trait ExpiryPolicy: Debug + Send + Sync {
    fn on_expired(&self, record: &CopyRecord) -> ExpiryAction;
}

/// Fire-and-forget: expired copies are retired.
#[derive(Debug, Clone, Copy, Default)]
pub struct DropUnacknowledged;

impl ExpiryPolicy for DropUnacknowledged {
    fn on_expired(&self, _record: &CopyRecord) -> ExpiryAction {
        ExpiryAction::Drop
    }
}

/// Re-queue copies that were never marked received, up to `max_attempts`
/// deliveries in total. Copies already received are dropped on expiry.
#[derive(Debug, Clone, Copy)]
pub struct RedeliverPending {
    pub max_attempts: u32,
}

impl Default for RedeliverPending {
    fn default() -> Self {
        Self { max_attempts: 5 }
    }
}

impl ExpiryPolicy for RedeliverPending {
    fn on_expired(&self, record: &CopyRecord) -> ExpiryAction {
        if record.state == AckState::Pending && record.attempts < self.max_attempts {
            ExpiryAction::Redeliver
        } else {
            ExpiryAction::Drop
        }
    }
}
