use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;

use crate::schedule::{OverlapPolicy, Weekday, SCHOOL_WEEK};

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub server: ServerSettings,
    #[serde(default)]
    pub database: DatabaseSettings,
    #[serde(default)]
    pub matching: MatchingSettings,
    #[serde(default)]
    pub auth: AuthSettings,
    #[serde(default)]
    pub logging: LoggingSettings,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerSettings {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseSettings {
    #[serde(default = "default_database_path")]
    pub path: String,
}

impl Default for DatabaseSettings {
    fn default() -> Self {
        Self {
            path: default_database_path(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct MatchingSettings {
    /// Weekdays on which availabilities are compared.
    #[serde(default = "default_weekdays")]
    pub weekdays: Vec<Weekday>,
}

impl Default for MatchingSettings {
    fn default() -> Self {
        Self {
            weekdays: default_weekdays(),
        }
    }
}

impl MatchingSettings {
    pub fn policy(&self) -> OverlapPolicy {
        OverlapPolicy::new(self.weekdays.iter().copied())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct AuthSettings {
    #[serde(default = "default_session_hours")]
    pub session_hours: i64,
    #[serde(default = "default_cookie_name")]
    pub cookie_name: String,
    /// Created on startup when the user table is empty.
    pub admin_username: Option<String>,
    pub admin_password: Option<String>,
}

impl Default for AuthSettings {
    fn default() -> Self {
        Self {
            session_hours: default_session_hours(),
            cookie_name: default_cookie_name(),
            admin_username: None,
            admin_password: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingSettings {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

fn default_host() -> String {
    "127.0.0.1".to_owned()
}
fn default_port() -> u16 {
    3000
}
fn default_database_path() -> String {
    "matcher.sqlite".to_owned()
}
fn default_weekdays() -> Vec<Weekday> {
    SCHOOL_WEEK.to_vec()
}
fn default_session_hours() -> i64 {
    2
}
fn default_cookie_name() -> String {
    "session".to_owned()
}
fn default_log_level() -> String {
    "info".to_owned()
}
fn default_log_format() -> String {
    "compact".to_owned()
}

fn environment() -> Environment {
    // TUTOR__SERVER__PORT -> server.port, TUTOR__MATCHING__WEEKDAYS=mon,tue
    Environment::with_prefix("TUTOR")
        .prefix_separator("__")
        .separator("__")
        .try_parsing(true)
        .list_separator(",")
        .with_list_parse_key("matching.weekdays")
}

impl Settings {
    /// Loads `config/default`, then `config/local`, then `TUTOR__*` variables.
    pub fn load() -> Result<Self, ConfigError> {
        Config::builder()
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name("config/local").required(false))
            .add_source(environment())
            .build()?
            .try_deserialize()
    }
}
