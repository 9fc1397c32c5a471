mod settings;

use crate::config::settings::PartialSettings;
use config::{Config, ConfigError, Environment, File};

pub use settings::{DispatchSettings, LoggingSettings, Settings, StoreSettings};

/// Loads `config/default.*` (optional) and `RELAYBUS_*` environment
/// variables, then merges what was found over `Settings::default()`.
///
/// Environment keys use `__` between section and field, for example
/// `RELAYBUS_STORE__PATH` or `RELAYBUS_DISPATCH__LIMIT`.
pub fn load_config() -> Result<Settings, ConfigError> {
    let builder = Config::builder()
        .add_source(File::with_name("config/default").required(false))
        .add_source(
            Environment::with_prefix("RELAYBUS")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

    let config = builder.build()?;

    // Try to deserialize what is available
    let partial: PartialSettings = config.try_deserialize()?;

    // Merge with defaults
    let default = Settings::default();
    let store = partial.store;
    let dispatch = partial.dispatch;
    let logging = partial.logging;

    Ok(Settings {
        store: StoreSettings {
            path: store
                .as_ref()
                .and_then(|s| s.path.clone())
                .unwrap_or(default.store.path),
            flush_every_ms: store
                .as_ref()
                .and_then(|s| s.flush_every_ms)
                .or(default.store.flush_every_ms),
            message_ttl_secs: store
                .as_ref()
                .and_then(|s| s.message_ttl_secs)
                .or(default.store.message_ttl_secs),
            max_messages_per_channel: store
                .as_ref()
                .and_then(|s| s.max_messages_per_channel)
                .or(default.store.max_messages_per_channel),
        },
        dispatch: DispatchSettings {
            runner: dispatch
                .as_ref()
                .and_then(|d| d.runner.clone())
                .unwrap_or(default.dispatch.runner),
            limit: dispatch
                .as_ref()
                .and_then(|d| d.limit)
                .or(default.dispatch.limit),
        },
        logging: LoggingSettings {
            level: logging
                .as_ref()
                .and_then(|l| l.level.clone())
                .unwrap_or(default.logging.level),
        },
    })
}
