//! Consumer loop with the `quit` convention.
//!
//! A broadcast ends with an ordinary envelope whose payload is the JSON string
//! `"quit"`. The broker does not know about it; consumers do. On every copy
//! the loop acknowledges `received` first, then asks the handler. `Continue`
//! is followed by `processed`; `Quit` stops the loop without it, so the
//! terminal control message skips the processing phase.

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::broker::endpoint::{Delivery, Endpoint};
use crate::broker::message::Payload;
use crate::utils::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Control {
    Quit,
}

/// A broadcast payload: either application data or a control word.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Broadcast<T> {
    Control(Control),
    Data(T),
}

impl<T> Broadcast<T> {
    pub fn is_quit(&self) -> bool {
        matches!(self, Broadcast::Control(Control::Quit))
    }
}

pub fn quit_payload() -> Result<Payload> {
    Payload::json(&Control::Quit)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Quit,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConsumeSummary {
    /// Copies the handler accepted and that were acknowledged as processed.
    pub processed: usize,
    /// `true` if the loop ended on a `Flow::Quit`, `false` on end-of-stream.
    pub quit: bool,
}

/// Drain `endpoint` through `handler` until it quits, fails, or the endpoint
/// ends. A handler error stops only this loop and is handed back to the
/// caller; the endpoint is closed when the loop returns.
pub async fn consume<F, E>(
    endpoint: Endpoint,
    mut handler: F,
) -> std::result::Result<ConsumeSummary, E>
where
    F: FnMut(&Delivery) -> std::result::Result<Flow, E>,
{
    let mut summary = ConsumeSummary::default();
    while let Some(delivery) = endpoint.next_copy().await {
        delivery.received();
        match handler(&delivery)? {
            Flow::Continue => {
                delivery.processed();
                summary.processed += 1;
            }
            Flow::Quit => {
                debug!(
                    "Endpoint {} quit after {} copies",
                    endpoint.id(),
                    summary.processed
                );
                summary.quit = true;
                break;
            }
        }
    }
    Ok(summary)
}
