mod settings;

use config::{Config, Environment, File};

use crate::utils::error::Result;
use settings::PartialSettings;

pub use settings::{BrokerSettings, LoggingSettings, ServerSettings, Settings};

/// Loads the configuration from `config/default.*`, a `.env` file and
/// `FANMQ__*` environment variables (`FANMQ__BROKER__QUEUE_CAPACITY=64`),
/// then fills whatever is missing from `Settings::default()`.
pub fn load_config() -> Result<Settings> {
    dotenvy::dotenv().ok();

    let config = Config::builder()
        .add_source(File::with_name("config/default").required(false))
        .add_source(
            Environment::with_prefix("FANMQ")
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        )
        .build()?;

    let partial: PartialSettings = config.try_deserialize()?;
    Ok(partial.merge(Settings::default()))
}
