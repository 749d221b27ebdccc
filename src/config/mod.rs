mod settings;

use config::{Config, ConfigError, Environment, File};

use settings::PartialSettings;

pub use settings::{
    BrokerSettings, DeliveryFailurePolicy, DeliverySettings, LoggingSettings, Settings,
    StoreSettings,
};

/// Loads the configuration from the default file and environment variables.
///
/// `config/default` is optional; environment variables such as
/// `STORE__RING_BUFFER_SIZE=8192` override it. Anything left unset falls back
/// to `Settings::default()`.
pub fn load_config() -> Result<Settings, ConfigError> {
    load_config_from("config/default")
}

/// Same as [`load_config`] with an explicit file (extension optional).
pub fn load_config_from(path: &str) -> Result<Settings, ConfigError> {
    let builder = Config::builder()
        .add_source(File::with_name(path).required(false))
        .add_source(Environment::default().separator("__"));

    let config = builder.build()?;

    // Try to deserialize what is available
    let partial: PartialSettings = config.try_deserialize()?;

    Ok(partial.merge(Settings::default()))
}

#[cfg(test)]
mod tests;
