//! One-sender, many-receiver broadcast run in-process.
//!
//! Every receiver is its own node with one endpoint and drains it with
//! [`consume`] until the `quit` copy arrives. The topic is declared blocking,
//! so a receiver that falls behind holds the sender up instead of silently
//! missing copies (including the `quit` that ends its loop).

use futures::future::try_join_all;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::broker::endpoint::Delivery;
use crate::broker::engine::Router;
use crate::broker::message::{Envelope, Payload, TargetKind};
use crate::broker::topic::TopicConfig;
use crate::client::consumer::{Broadcast, Flow, consume, quit_payload};
use crate::client::node::Node;
use crate::utils::error::{Error, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BroadcastPlan {
    pub receivers: usize,
    pub messages: usize,
    pub topic: String,
    pub subject: String,
}

impl Default for BroadcastPlan {
    fn default() -> Self {
        Self {
            receivers: 100,
            messages: 100,
            topic: "non-blocking".to_string(),
            subject: "event/test_broadcast".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BroadcastTally {
    /// Data copies the receivers processed.
    pub processed: usize,
    /// Receivers whose loop ended on `quit`.
    pub quit: usize,
}

#[derive(Debug, Serialize, Deserialize)]
struct BroadcastData {
    data: String,
}

/// Run `plan` on `router` and wait for every receiver to finish.
pub async fn run_broadcast(router: &Router, plan: &BroadcastPlan) -> Result<BroadcastTally> {
    router.create_topic(TopicConfig::new(plan.topic.as_str()).blocking(true))?;
    let host = Node::connect(router);

    let mut tasks = Vec::with_capacity(plan.receivers);
    for _ in 0..plan.receivers {
        let node = Node::connect(router);
        let endpoint = node.create_endpoint(&plan.topic, [plan.subject.as_str()])?;
        tasks.push(tokio::spawn(async move {
            let _node = node;
            consume(endpoint, |delivery: &Delivery| {
                let payload: Broadcast<BroadcastData> = delivery.json()?;
                Ok::<_, Error>(if payload.is_quit() {
                    Flow::Quit
                } else {
                    Flow::Continue
                })
            })
            .await
        }));
    }

    for i in 0..plan.messages {
        let payload = Payload::json(&BroadcastData {
            data: format!("message-{i}"),
        })?;
        host.send_message(envelope(plan, payload)).await?;
    }
    info!("Sent {} messages to {} receivers", plan.messages, plan.receivers);
    host.send_message(envelope(plan, quit_payload()?)).await?;

    let joined = try_join_all(tasks).await.map_err(std::io::Error::other)?;
    let mut tally = BroadcastTally::default();
    for summary in joined {
        let summary = summary?;
        tally.processed += summary.processed;
        tally.quit += usize::from(summary.quit);
    }
    Ok(tally)
}

fn envelope(plan: &BroadcastPlan, payload: Payload) -> Envelope {
    Envelope::new(
        plan.topic.as_str(),
        [plan.subject.as_str()],
        TargetKind::Available,
        payload,
    )
}
