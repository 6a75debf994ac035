//! The `config` module loads and validates the client configuration.
//!
//! Sources are merged in order: built-in defaults, then the optional
//! `config/default` file, then `RELAYQ_*` environment variables. Invalid
//! or missing required fields fail fast, before any connection attempt.

mod settings;

pub use settings::{ConsumerSettings, ProducerSettings, QueueSettings, Settings};

#[cfg(test)]
mod tests;

use config::{Config, Environment, File};

use crate::config::settings::PartialSettings;
use crate::utils::error::{Error, Result};

/// Loads the configuration from the default file and environment
/// variables, merges it with the defaults, and validates the result.
pub fn load_config() -> Result<Settings> {
    let builder = Config::builder()
        .add_source(File::with_name("config/default").required(false))
        .add_source(Environment::with_prefix("RELAYQ").separator("__"));

    let config = builder.build().map_err(|e| Error::Config(e.to_string()))?;

    // Take what is available; defaults fill the rest
    let partial: PartialSettings = config
        .try_deserialize()
        .map_err(|e| Error::Config(e.to_string()))?;

    let settings = partial.merge(Settings::default());
    settings.validate()?;
    Ok(settings)
}
