//! The `client` module is the participant side of the broker.
//!
//! It provides the `Node`, which owns endpoints and sends envelopes, and the
//! `consume` loop that drives an endpoint with the `quit` convention.

pub mod broadcast;
pub mod consumer;
pub mod node;

pub use broadcast::{BroadcastPlan, BroadcastTally, run_broadcast};
pub use consumer::{Broadcast, ConsumeSummary, Control, Flow, consume};
pub use node::Node;
