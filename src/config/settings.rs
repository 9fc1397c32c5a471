use serde::Deserialize;

/// Top-level configuration settings for the application.
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct Settings {
    pub store: StoreSettings,
    pub dispatch: DispatchSettings,
    pub logging: LoggingSettings,
}

/// Where and how the persistent store keeps its data.
///
/// The retention fields are only applied by an explicit prune; publishing
/// and dispatching never delete anything.
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct StoreSettings {
    pub path: String,
    pub flush_every_ms: Option<u64>,
    pub message_ttl_secs: Option<u64>,
    pub max_messages_per_channel: Option<usize>,
}

/// Defaults for `dispatch` when the caller does not name a runner or limit.
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct DispatchSettings {
    pub runner: String,
    pub limit: Option<usize>,
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct LoggingSettings {
    pub level: String,
}

/// Partial configuration settings loaded from files or environment.
///
/// Missing values are filled in from `Settings::default()`.
#[derive(Debug, Deserialize)]
pub struct PartialSettings {
    pub store: Option<PartialStoreSettings>,
    pub dispatch: Option<PartialDispatchSettings>,
    pub logging: Option<PartialLoggingSettings>,
}

#[derive(Debug, Deserialize)]
pub struct PartialStoreSettings {
    pub path: Option<String>,
    pub flush_every_ms: Option<u64>,
    pub message_ttl_secs: Option<u64>,
    pub max_messages_per_channel: Option<usize>,
}

#[derive(Debug, Deserialize)]
pub struct PartialDispatchSettings {
    pub runner: Option<String>,
    pub limit: Option<usize>,
}

#[derive(Debug, Deserialize)]
pub struct PartialLoggingSettings {
    pub level: Option<String>,
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            path: "relaybus_db".to_string(),
            flush_every_ms: Some(500),
            message_ttl_secs: None,
            max_messages_per_channel: None,
        }
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            store: StoreSettings::default(),
            dispatch: DispatchSettings {
                runner: "default".to_string(),
                limit: None,
            },
            logging: LoggingSettings {
                level: "info".to_string(),
            },
        }
    }
}
