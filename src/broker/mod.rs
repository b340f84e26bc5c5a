pub mod ack;
pub mod endpoint;
pub mod engine;
pub mod id;
pub mod message;
pub mod policy;
pub mod topic;

pub use ack::{AckState, AckThreshold, DeliveryReport};
pub use endpoint::{Delivery, Endpoint, EndpointState};
pub use engine::{PublishOutcome, Router, RouterConfig};
pub use message::{Envelope, Payload, PayloadKind, TargetKind};
pub use topic::{OverflowPolicy, TopicConfig};
