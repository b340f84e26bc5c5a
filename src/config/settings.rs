use std::num::NonZeroUsize;
use std::time::Duration;

use serde::Deserialize;

use crate::broker::ack::AckThreshold;
use crate::broker::engine::RouterConfig;
use crate::broker::topic::OverflowPolicy;

/// Top-level configuration settings for the application.
///
/// Includes settings for the gateway server, the router and logging.
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct Settings {
    pub server: ServerSettings,
    pub broker: BrokerSettings,
    pub logging: LoggingSettings,
}

/// Configuration settings for the WebSocket gateway.
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
}

/// Configuration settings for the router.
///
/// `queue_capacity = 0` leaves endpoint queues unbounded.
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct BrokerSettings {
    pub queue_capacity: usize,
    pub overflow_policy: OverflowPolicy,
    pub ack_timeout_ms: u64,
    pub sweep_interval_ms: u64,
    pub send_timeout_ms: u64,
    pub ack_threshold: AckThreshold,
}

impl BrokerSettings {
    pub fn router_config(&self) -> RouterConfig {
        RouterConfig {
            queue_capacity: NonZeroUsize::new(self.queue_capacity),
            overflow_policy: self.overflow_policy,
            ack_timeout: Duration::from_millis(self.ack_timeout_ms),
            ack_threshold: self.ack_threshold,
            send_timeout: Duration::from_millis(self.send_timeout_ms),
        }
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct LoggingSettings {
    pub level: String,
}

/// Partial configuration settings loaded from files or environment.
///
/// Allows partial specification of settings. Missing values can be filled using defaults.
#[derive(Debug, Deserialize, Default)]
pub struct PartialSettings {
    pub server: Option<PartialServerSettings>,
    pub broker: Option<PartialBrokerSettings>,
    pub logging: Option<PartialLoggingSettings>,
}

#[derive(Debug, Deserialize, Default)]
pub struct PartialServerSettings {
    pub host: Option<String>,
    pub port: Option<u16>,
}

#[derive(Debug, Deserialize, Default)]
pub struct PartialBrokerSettings {
    pub queue_capacity: Option<usize>,
    pub overflow_policy: Option<OverflowPolicy>,
    pub ack_timeout_ms: Option<u64>,
    pub sweep_interval_ms: Option<u64>,
    pub send_timeout_ms: Option<u64>,
    pub ack_threshold: Option<AckThreshold>,
}

#[derive(Debug, Deserialize, Default)]
pub struct PartialLoggingSettings {
    pub level: Option<String>,
}

impl PartialSettings {
    /// Fill every missing value from `defaults`.
    pub fn merge(self, defaults: Settings) -> Settings {
        let server = self.server.unwrap_or_default();
        let broker = self.broker.unwrap_or_default();
        let logging = self.logging.unwrap_or_default();
        Settings {
            server: ServerSettings {
                host: server.host.unwrap_or(defaults.server.host),
                port: server.port.unwrap_or(defaults.server.port),
            },
            broker: BrokerSettings {
                queue_capacity: broker
                    .queue_capacity
                    .unwrap_or(defaults.broker.queue_capacity),
                overflow_policy: broker
                    .overflow_policy
                    .unwrap_or(defaults.broker.overflow_policy),
                ack_timeout_ms: broker
                    .ack_timeout_ms
                    .unwrap_or(defaults.broker.ack_timeout_ms),
                sweep_interval_ms: broker
                    .sweep_interval_ms
                    .unwrap_or(defaults.broker.sweep_interval_ms),
                send_timeout_ms: broker
                    .send_timeout_ms
                    .unwrap_or(defaults.broker.send_timeout_ms),
                ack_threshold: broker
                    .ack_threshold
                    .unwrap_or(defaults.broker.ack_threshold),
            },
            logging: LoggingSettings {
                level: logging.level.unwrap_or(defaults.logging.level),
            },
        }
    }
}

/// Provides default values for `Settings`.
impl Default for Settings {
    fn default() -> Self {
        Self {
            server: ServerSettings {
                host: "127.0.0.1".to_string(),
                port: 8080,
            },
            broker: BrokerSettings {
                queue_capacity: 1024,
                overflow_policy: OverflowPolicy::RejectNew,
                ack_timeout_ms: 30_000,
                sweep_interval_ms: 1_000,
                send_timeout_ms: 5_000,
                ack_threshold: AckThreshold::Received,
            },
            logging: LoggingSettings {
                level: "info".to_string(),
            },
        }
    }
}
