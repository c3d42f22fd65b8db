use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use figment::{
    Figment,
    providers::{Env, Format, Json, Serialized},
};
use helpdesk_storage::{DEFAULT_FEED_CAPACITY, SYSTEM_SENDER_NAME};
use serde::{Deserialize, Serialize};
use snafu::{ResultExt, Snafu};

use crate::timeline::InsertionOrder;

pub const SETTINGS_DIRECTORY_NAME: &str = "helpdesk";
pub const SETTINGS_FILE_NAME: &str = "settings.json";
pub const DATABASE_FILE_NAME: &str = "helpdesk.db";
/// Environment overrides, e.g. `HELPDESK_RECONNECT__MAX_ATTEMPTS=3`.
pub const ENV_PREFIX: &str = "HELPDESK_";
pub const DEFAULT_GREETING_TEMPLATE: &str =
    "Hi {name}! Thanks for reaching out. How can we help you today?";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GreetingSettings {
    #[serde(default = "default_sender_name")]
    pub sender_name: String,
    /// `{name}` is replaced with the viewer's display name.
    #[serde(default = "default_greeting_template")]
    pub template: String,
}

impl Default for GreetingSettings {
    fn default() -> Self {
        Self {
            sender_name: default_sender_name(),
            template: default_greeting_template(),
        }
    }
}

impl GreetingSettings {
    pub fn render(&self, display_name: &str) -> String {
        let display_name = display_name.trim();
        let display_name = if display_name.is_empty() {
            "there"
        } else {
            display_name
        };
        self.template.replace("{name}", display_name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconnectSettings {
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
}

impl Default for ReconnectSettings {
    fn default() -> Self {
        Self {
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            max_attempts: default_max_attempts(),
        }
    }
}

impl ReconnectSettings {
    /// Exponential backoff for a 1-based attempt number, capped at `max_backoff_ms`.
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(32);
        let millis = self
            .initial_backoff_ms
            .saturating_mul(1_u64 << exponent)
            .min(self.max_backoff_ms);
        Duration::from_millis(millis)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatSettings {
    #[serde(default = "default_database_location")]
    pub database_location: String,
    #[serde(default)]
    pub greeting: GreetingSettings,
    #[serde(default)]
    pub insertion_order: InsertionOrder,
    #[serde(default = "default_feed_capacity")]
    pub feed_capacity: usize,
    #[serde(default = "default_mark_read_on_live_message")]
    pub mark_read_on_live_message: bool,
    #[serde(default)]
    pub reconnect: ReconnectSettings,
}

impl Default for ChatSettings {
    fn default() -> Self {
        Self {
            database_location: default_database_location(),
            greeting: GreetingSettings::default(),
            insertion_order: InsertionOrder::default(),
            feed_capacity: default_feed_capacity(),
            mark_read_on_live_message: default_mark_read_on_live_message(),
            reconnect: ReconnectSettings::default(),
        }
    }
}

impl ChatSettings {
    pub fn normalized(mut self) -> Self {
        self.database_location = if self.database_location.trim().is_empty() {
            default_database_location()
        } else {
            self.database_location.trim().to_string()
        };

        self.greeting.sender_name = self.greeting.sender_name.trim().to_string();
        if self.greeting.sender_name.is_empty() {
            self.greeting.sender_name = default_sender_name();
        }
        if self.greeting.template.trim().is_empty() {
            self.greeting.template = default_greeting_template();
        }

        self.feed_capacity = self.feed_capacity.max(1);

        // A zero initial backoff would spin; max must never undercut initial.
        self.reconnect.initial_backoff_ms = self.reconnect.initial_backoff_ms.max(1);
        self.reconnect.max_backoff_ms = self
            .reconnect
            .max_backoff_ms
            .max(self.reconnect.initial_backoff_ms);

        self
    }
}

pub struct SettingsStore {
    settings: Arc<ArcSwap<ChatSettings>>,
    config_path: PathBuf,
}

impl SettingsStore {
    pub fn default_config_dir() -> PathBuf {
        dirs::config_dir()
            .map(|path| path.join(SETTINGS_DIRECTORY_NAME))
            .unwrap_or_else(|| PathBuf::from(".helpdesk"))
    }

    pub fn default_config_path() -> PathBuf {
        Self::default_config_dir().join(SETTINGS_FILE_NAME)
    }

    pub fn new(config_path: PathBuf) -> Self {
        let settings = Self::load_from_disk(&config_path);
        Self {
            settings: Arc::new(ArcSwap::from_pointee(settings)),
            config_path,
        }
    }

    pub fn load() -> Self {
        Self::new(Self::default_config_path())
    }

    pub fn config_path(&self) -> &PathBuf {
        &self.config_path
    }

    pub fn settings(&self) -> Arc<ChatSettings> {
        self.settings.load_full()
    }

    pub fn update(&self, settings: ChatSettings) -> Result<(), SettingsError> {
        let normalized_settings = settings.normalized();
        self.persist(&normalized_settings)?;
        self.settings.store(Arc::new(normalized_settings));
        Ok(())
    }

    /// Defaults, then the JSON file, then `HELPDESK_*` environment overrides.
    pub fn figment(path: &PathBuf) -> Figment {
        Figment::from(Serialized::defaults(ChatSettings::default()))
            .merge(Json::file(path))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
    }

    pub fn extract(figment: &Figment) -> ChatSettings {
        match figment.extract::<ChatSettings>() {
            Ok(settings) => settings.normalized(),
            Err(error) => {
                tracing::warn!("failed to parse chat settings: {}. using defaults", error);
                ChatSettings::default()
            }
        }
    }

    fn load_from_disk(path: &PathBuf) -> ChatSettings {
        if !path.exists() {
            tracing::info!("settings file not found at {:?}, using defaults", path);
        }

        Self::extract(&Self::figment(path))
    }

    fn persist(&self, settings: &ChatSettings) -> Result<(), SettingsError> {
        if let Some(parent) = self.config_path.parent() {
            std::fs::create_dir_all(parent).context(CreateDirSnafu {
                stage: "create-settings-directory",
                path: parent.to_path_buf(),
            })?;
        }

        let content = serde_json::to_string_pretty(settings).context(SerializeConfigSnafu {
            stage: "serialize-settings-json",
        })?;

        let temp_path = self.config_path.with_extension("json.tmp");
        std::fs::write(&temp_path, content).context(WriteFileSnafu {
            stage: "write-temporary-settings-file",
            path: temp_path.clone(),
        })?;

        std::fs::rename(&temp_path, &self.config_path).context(RenameTempFileSnafu {
            stage: "rename-temporary-settings-file",
            from: temp_path,
            to: self.config_path.clone(),
        })?;

        tracing::info!("saved settings to {:?}", self.config_path);
        Ok(())
    }
}

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum SettingsError {
    #[snafu(display("failed to create settings directory at {path:?} on `{stage}`: {source}"))]
    CreateDir {
        stage: &'static str,
        path: PathBuf,
        source: std::io::Error,
    },
    #[snafu(display("failed to serialize settings on `{stage}`: {source}"))]
    SerializeConfig {
        stage: &'static str,
        source: serde_json::Error,
    },
    #[snafu(display("failed to write settings file at {path:?} on `{stage}`: {source}"))]
    WriteFile {
        stage: &'static str,
        path: PathBuf,
        source: std::io::Error,
    },
    #[snafu(display(
        "failed to replace settings file from {from:?} to {to:?} on `{stage}`: {source}"
    ))]
    RenameTempFile {
        stage: &'static str,
        from: PathBuf,
        to: PathBuf,
        source: std::io::Error,
    },
}

fn default_database_location() -> String {
    dirs::data_dir()
        .map(|path| path.join(SETTINGS_DIRECTORY_NAME))
        .unwrap_or_else(|| PathBuf::from(".helpdesk"))
        .join(DATABASE_FILE_NAME)
        .display()
        .to_string()
}

fn default_sender_name() -> String {
    SYSTEM_SENDER_NAME.to_string()
}

fn default_greeting_template() -> String {
    DEFAULT_GREETING_TEMPLATE.to_string()
}

fn default_feed_capacity() -> usize {
    DEFAULT_FEED_CAPACITY
}

fn default_mark_read_on_live_message() -> bool {
    true
}

fn default_initial_backoff_ms() -> u64 {
    250
}

fn default_max_backoff_ms() -> u64 {
    8_000
}

fn default_max_attempts() -> u32 {
    5
}
