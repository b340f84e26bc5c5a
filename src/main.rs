//! CLI for fanmq
//!
//! Subcommands:
//! - `server`: run the WebSocket gateway
//! - `broadcast`: run a one-sender, many-receiver broadcast in-process and
//!   report what every receiver saw (useful for smoke tests)

use std::time::Instant;

use clap::Parser;
use fanmq::Router;
use fanmq::client::BroadcastPlan;
use fanmq::config::{Settings, load_config};
use fanmq::transport::start_websocket_server;
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "fanmq")]
enum Command {
    /// Start the WebSocket gateway
    Server,
    /// Broadcast messages from one node to many endpoints and count deliveries
    Broadcast {
        #[arg(long, default_value_t = 100)]
        receivers: usize,
        #[arg(long, default_value_t = 100)]
        messages: usize,
        #[arg(long, default_value = "non-blocking")]
        topic: String,
        #[arg(long, default_value = "event/test_broadcast")]
        subject: String,
    },
}

#[tokio::main]
async fn main() {
    let settings = match load_config() {
        Ok(settings) => settings,
        Err(e) => {
            eprintln!("Failed to load configuration: {e}");
            std::process::exit(1);
        }
    };
    fanmq::utils::logging::init(&settings.logging.level);

    let result = match Command::parse() {
        Command::Server => run_server(settings).await,
        Command::Broadcast {
            receivers,
            messages,
            topic,
            subject,
        } => {
            let plan = BroadcastPlan {
                receivers,
                messages,
                topic,
                subject,
            };
            run_broadcast(settings, plan).await
        }
    };
    if let Err(e) = result {
        error!("fanmq failed: {e}");
        std::process::exit(1);
    }
}

async fn run_server(settings: Settings) -> fanmq::Result<()> {
    let addr = format!("{}:{}", settings.server.host, settings.server.port);
    let router = Router::new(settings.broker.router_config());
    let sweeper = router.start_ack_sweeper(settings.broker.sweep_interval());

    let result = tokio::select! {
        res = start_websocket_server(addr, router) => {
            error!("WebSocket gateway exited unexpectedly.");
            res
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown signal received. Exiting gracefully.");
            Ok(())
        }
    };
    sweeper.abort();
    result
}

async fn run_broadcast(settings: Settings, plan: BroadcastPlan) -> fanmq::Result<()> {
    let router = Router::new(settings.broker.router_config());
    let started = Instant::now();
    let tally = fanmq::client::run_broadcast(&router, &plan).await?;
    info!(
        "{} receivers processed {} copies in {:?}",
        plan.receivers,
        tally.processed,
        started.elapsed()
    );
    println!(
        "receivers={} messages={} processed={} quit={}",
        plan.receivers, plan.messages, tally.processed, tally.quit
    );
    Ok(())
}
