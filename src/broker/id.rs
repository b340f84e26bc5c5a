//! Identifiers used across the broker.
//!
//! Node, endpoint and message ids are random UUIDs. Copy ids are handed out
//! by the router from a single counter, so their order is the global enqueue
//! order and, restricted to one endpoint, that endpoint's delivery order.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

macro_rules! uuid_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(Uuid);

        impl $name {
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                self.0.fmt(f)
            }
        }
    };
}

uuid_id!(
    /// Identity of a connected participant.
    NodeId
);
uuid_id!(
    /// Identity of a single subscription handle.
    EndpointId
);
uuid_id!(
    /// Identity of one logical send; shared by all of its copies.
    MessageId
);

/// Identity of one delivered copy of an envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CopyId(pub(crate) u64);

impl CopyId {
    pub fn get(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for CopyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "copy#{}", self.0)
    }
}
