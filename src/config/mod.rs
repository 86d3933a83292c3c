mod settings;

use config::{Config, ConfigError, Environment, File};

pub use settings::{
    AttachmentSettings, BrokerSettings, CacheSettings, LogSettings, PartialSettings, Settings,
    VisitorSettings,
};

/// Prefix of environment variables, e.g. `NOTIFYCAST_CACHE__FILE`.
pub const ENV_PREFIX: &str = "NOTIFYCAST";

/// Loads the configuration from the default file and environment variables
/// Merges the configuration with default values
/// Returns a `Settings` struct with every section filled in
pub fn load_config() -> Result<Settings, ConfigError> {
    let builder = Config::builder()
        .add_source(File::with_name("config/default").required(false))
        .add_source(
            Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("_")
                .separator("__"),
        );

    let config = builder.build()?;

    // Try to deserialize what is available
    let partial: PartialSettings = config.try_deserialize()?;

    // Merge with defaults
    Ok(partial.merge(Settings::default()))
}
