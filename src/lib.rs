//! # fanmq
//!
//! `fanmq` is an in-memory message broker core with topic/subject-addressed
//! fan-out and a two-phase acknowledgment lifecycle for every delivered copy.
//!
//! ## Core Modules
//!
//! - `broker`: the router, its subject index, endpoint queues and the
//!   acknowledgment tracker.
//! - `client`: nodes, which own endpoints and send envelopes, and the
//!   `consume` loop with the `quit` convention.
//! - `config`: loading server, router and logging settings.
//! - `transport`: a WebSocket gateway that turns each connection into a node.
//! - `utils`: the crate error type and logging setup.

pub mod broker;
pub mod client;
pub mod config;
pub mod transport;
pub mod utils;

pub use broker::{
    Delivery, Endpoint, Envelope, Payload, PayloadKind, Router, RouterConfig, TargetKind,
    TopicConfig,
};
pub use client::{Flow, Node, consume};
pub use utils::error::{Error, Result};
