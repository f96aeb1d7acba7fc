mod settings;

use std::path::Path;

use config::{Config, ConfigError, Environment, File};

use crate::config::settings::PartialSettings;

pub use settings::{
    BrokerSettings, DispatcherSettings, LoggingSettings, ServerSettings, Settings, StoreKind,
    WebSocketSettings,
};

/// Loads the configuration from `config/default` (if present) and the
/// environment, merged over the default values.
pub fn load_config() -> Result<Settings, ConfigError> {
    load(File::with_name("config/default").required(false))
}

/// Same as [`load_config`] but reads the given file, which must exist.
pub fn load_config_from(path: impl AsRef<Path>) -> Result<Settings, ConfigError> {
    load(File::from(path.as_ref()).required(true))
}

fn load<S>(file: S) -> Result<Settings, ConfigError>
where
    S: config::Source + Send + Sync + 'static,
{
    // RELAYHUB_SERVER__WS_PORT=9001, RELAYHUB_BROKER__TOPICS=a,b
    let environment = Environment::with_prefix("RELAYHUB")
        .prefix_separator("_")
        .separator("__")
        .list_separator(",")
        .with_list_parse_key("broker.topics")
        .try_parsing(true);

    let config = Config::builder()
        .add_source(file)
        .add_source(environment)
        .build()?;

    // Try to deserialize what is available
    let partial: PartialSettings = config.try_deserialize()?;

    Ok(partial.merge(Settings::default()))
}

#[cfg(test)]
mod tests;
