//! The `transport` module lets remote clients reach the router over
//! WebSockets.
//!
//! It defines the JSON protocol spoken between clients and the gateway and
//! implements the gateway itself. Each connection becomes one `Node`.

pub mod message;
pub mod websocket;

pub use message::{AckStage, ClientMessage, ServerMessage};
pub use websocket::{serve, start_websocket_server};

#[cfg(test)]
mod tests;
