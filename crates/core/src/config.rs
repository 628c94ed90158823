use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use chrono::NaiveTime;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use thiserror::Error;

use crate::schedule::SlotGrid;

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    pub server: ServerConfig,
    pub mirror: MirrorConfig,
    pub calendar: CalendarConfig,
    pub logging: LoggingConfig,
}

#[derive(Clone, Debug)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub timeout_secs: u64,
}

#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub bind_address: String,
    pub port: u16,
    pub graceful_shutdown_secs: u64,
}

/// The external spreadsheet bridge. Disabled means every mirror call is a
/// no-op and the local store runs alone.
#[derive(Clone, Debug)]
pub struct MirrorConfig {
    pub enabled: bool,
    pub base_url: Option<String>,
    pub api_key: Option<SecretString>,
    pub timeout_secs: u64,
}

#[derive(Clone, Debug)]
pub struct CalendarConfig {
    pub slot_minutes: u32,
    pub day_start: String,
    pub day_end: String,
    pub specialists: Vec<String>,
    pub reconcile_interval_secs: u64,
    pub reconcile_horizon_days: u32,
}

#[derive(Clone, Debug)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    Compact,
    Pretty,
    Json,
}

impl std::str::FromStr for LogFormat {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "compact" => Ok(Self::Compact),
            "pretty" => Ok(Self::Pretty),
            "json" => Ok(Self::Json),
            other => Err(ConfigError::Validation(format!(
                "unsupported log format `{other}` (expected compact|pretty|json)"
            ))),
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct ConfigOverrides {
    pub database_url: Option<String>,
    pub log_level: Option<String>,
    pub mirror_enabled: Option<bool>,
    pub mirror_base_url: Option<String>,
    pub mirror_api_key: Option<String>,
}

#[derive(Clone, Debug, Default)]
pub struct LoadOptions {
    pub config_path: Option<PathBuf>,
    pub require_file: bool,
    pub overrides: ConfigOverrides,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not read config file `{path}`: {source}")]
    ReadFile { path: PathBuf, source: std::io::Error },
    #[error("could not parse config file `{path}`: {source}")]
    ParseFile { path: PathBuf, source: toml::de::Error },
    #[error("required config file was not found: `{0}`")]
    MissingConfigFile(PathBuf),
    #[error("environment variable interpolation failed for `{var}`")]
    MissingEnvInterpolation { var: String },
    #[error("unterminated environment interpolation expression")]
    UnterminatedInterpolation,
    #[error("invalid environment override for `{key}`: `{value}`")]
    InvalidEnvOverride { key: String, value: String },
    #[error("configuration validation failed: {0}")]
    Validation(String),
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database: DatabaseConfig {
                url: "sqlite://bookline.db".to_string(),
                max_connections: 5,
                timeout_secs: 30,
            },
            server: ServerConfig {
                bind_address: "127.0.0.1".to_string(),
                port: 8080,
                graceful_shutdown_secs: 15,
            },
            mirror: MirrorConfig { enabled: false, base_url: None, api_key: None, timeout_secs: 10 },
            calendar: CalendarConfig {
                slot_minutes: 30,
                day_start: "09:00".to_string(),
                day_end: "18:00".to_string(),
                specialists: Vec::new(),
                reconcile_interval_secs: 300,
                reconcile_horizon_days: 14,
            },
            logging: LoggingConfig { level: "info".to_string(), format: LogFormat::Compact },
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct ConfigPatch {
    database: Option<DatabasePatch>,
    server: Option<ServerPatch>,
    mirror: Option<MirrorPatch>,
    calendar: Option<CalendarPatch>,
    logging: Option<LoggingPatch>,
}

#[derive(Debug, Default, Deserialize)]
struct DatabasePatch {
    url: Option<String>,
    max_connections: Option<u32>,
    timeout_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct ServerPatch {
    bind_address: Option<String>,
    port: Option<u16>,
    graceful_shutdown_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct MirrorPatch {
    enabled: Option<bool>,
    base_url: Option<String>,
    api_key: Option<String>,
    timeout_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct CalendarPatch {
    slot_minutes: Option<u32>,
    day_start: Option<String>,
    day_end: Option<String>,
    specialists: Option<Vec<String>>,
    reconcile_interval_secs: Option<u64>,
    reconcile_horizon_days: Option<u32>,
}

#[derive(Debug, Default, Deserialize)]
struct LoggingPatch {
    level: Option<String>,
    format: Option<LogFormat>,
}

impl AppConfig {
    pub fn load(options: LoadOptions) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        let maybe_path = resolve_config_path(options.config_path.as_deref());

        if let Some(path) = maybe_path {
            let patch = read_patch(&path)?;
            config.apply_patch(patch);
        } else if options.require_file {
            let expected = options.config_path.unwrap_or_else(|| PathBuf::from("bookline.toml"));
            return Err(ConfigError::MissingConfigFile(expected));
        }

        config.apply_env_overrides()?;
        config.apply_overrides(options.overrides);
        config.validate()?;

        Ok(config)
    }

    /// The slot grid described by the calendar section. Validation has already
    /// checked the formats, so this only fails on an unvalidated config.
    pub fn slot_grid(&self) -> Result<SlotGrid, ConfigError> {
        let day_start = parse_day_time("calendar.day_start", &self.calendar.day_start)?;
        let day_end = parse_day_time("calendar.day_end", &self.calendar.day_end)?;
        SlotGrid::new(day_start, day_end, self.calendar.slot_minutes)
            .map_err(|error| ConfigError::Validation(error.to_string()))
    }

    fn apply_patch(&mut self, patch: ConfigPatch) {
        if let Some(database) = patch.database {
            if let Some(url) = database.url {
                self.database.url = url;
            }
            if let Some(max_connections) = database.max_connections {
                self.database.max_connections = max_connections;
            }
            if let Some(timeout_secs) = database.timeout_secs {
                self.database.timeout_secs = timeout_secs;
            }
        }

        if let Some(server) = patch.server {
            if let Some(bind_address) = server.bind_address {
                self.server.bind_address = bind_address;
            }
            if let Some(port) = server.port {
                self.server.port = port;
            }
            if let Some(graceful_shutdown_secs) = server.graceful_shutdown_secs {
                self.server.graceful_shutdown_secs = graceful_shutdown_secs;
            }
        }

        if let Some(mirror) = patch.mirror {
            if let Some(enabled) = mirror.enabled {
                self.mirror.enabled = enabled;
            }
            if let Some(base_url) = mirror.base_url {
                self.mirror.base_url = Some(base_url);
            }
            if let Some(api_key) = mirror.api_key {
                self.mirror.api_key = Some(api_key.into());
            }
            if let Some(timeout_secs) = mirror.timeout_secs {
                self.mirror.timeout_secs = timeout_secs;
            }
        }

        if let Some(calendar) = patch.calendar {
            if let Some(slot_minutes) = calendar.slot_minutes {
                self.calendar.slot_minutes = slot_minutes;
            }
            if let Some(day_start) = calendar.day_start {
                self.calendar.day_start = day_start;
            }
            if let Some(day_end) = calendar.day_end {
                self.calendar.day_end = day_end;
            }
            if let Some(specialists) = calendar.specialists {
                self.calendar.specialists = specialists;
            }
            if let Some(reconcile_interval_secs) = calendar.reconcile_interval_secs {
                self.calendar.reconcile_interval_secs = reconcile_interval_secs;
            }
            if let Some(reconcile_horizon_days) = calendar.reconcile_horizon_days {
                self.calendar.reconcile_horizon_days = reconcile_horizon_days;
            }
        }

        if let Some(logging) = patch.logging {
            if let Some(level) = logging.level {
                self.logging.level = level;
            }
            if let Some(format) = logging.format {
                self.logging.format = format;
            }
        }
    }

    fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        if let Some(value) = read_env("BOOKLINE_DATABASE_URL") {
            self.database.url = value;
        }
        if let Some(value) = read_env("BOOKLINE_DATABASE_MAX_CONNECTIONS") {
            self.database.max_connections = parse_u32("BOOKLINE_DATABASE_MAX_CONNECTIONS", &value)?;
        }
        if let Some(value) = read_env("BOOKLINE_DATABASE_TIMEOUT_SECS") {
            self.database.timeout_secs = parse_u64("BOOKLINE_DATABASE_TIMEOUT_SECS", &value)?;
        }

        if let Some(value) = read_env("BOOKLINE_SERVER_BIND_ADDRESS") {
            self.server.bind_address = value;
        }
        if let Some(value) = read_env("BOOKLINE_SERVER_PORT") {
            self.server.port = parse_u16("BOOKLINE_SERVER_PORT", &value)?;
        }

        if let Some(value) = read_env("BOOKLINE_MIRROR_ENABLED") {
            self.mirror.enabled = parse_bool("BOOKLINE_MIRROR_ENABLED", &value)?;
        }
        if let Some(value) = read_env("BOOKLINE_MIRROR_BASE_URL") {
            self.mirror.base_url = Some(value);
        }
        if let Some(value) = read_env("BOOKLINE_MIRROR_API_KEY") {
            self.mirror.api_key = Some(value.into());
        }

        if let Some(value) = read_env("BOOKLINE_CALENDAR_SLOT_MINUTES") {
            self.calendar.slot_minutes = parse_u32("BOOKLINE_CALENDAR_SLOT_MINUTES", &value)?;
        }
        if let Some(value) = read_env("BOOKLINE_CALENDAR_DAY_START") {
            self.calendar.day_start = value;
        }
        if let Some(value) = read_env("BOOKLINE_CALENDAR_DAY_END") {
            self.calendar.day_end = value;
        }

        let log_level = read_env("BOOKLINE_LOGGING_LEVEL").or_else(|| read_env("BOOKLINE_LOG_LEVEL"));
        if let Some(value) = log_level {
            self.logging.level = value;
        }
        let log_format =
            read_env("BOOKLINE_LOGGING_FORMAT").or_else(|| read_env("BOOKLINE_LOG_FORMAT"));
        if let Some(value) = log_format {
            self.logging.format = value.parse()?;
        }

        Ok(())
    }

    fn apply_overrides(&mut self, overrides: ConfigOverrides) {
        if let Some(database_url) = overrides.database_url {
            self.database.url = database_url;
        }
        if let Some(log_level) = overrides.log_level {
            self.logging.level = log_level;
        }
        if let Some(enabled) = overrides.mirror_enabled {
            self.mirror.enabled = enabled;
        }
        if let Some(base_url) = overrides.mirror_base_url {
            self.mirror.base_url = Some(base_url);
        }
        if let Some(api_key) = overrides.mirror_api_key {
            self.mirror.api_key = Some(api_key.into());
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_database(&self.database)?;
        validate_mirror(&self.mirror)?;
        validate_calendar(&self.calendar)?;
        Ok(())
    }
}

fn resolve_config_path(explicit_path: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = explicit_path {
        return path.exists().then_some(path.to_path_buf());
    }

    [PathBuf::from("bookline.toml"), PathBuf::from("config/bookline.toml")]
        .into_iter()
        .find(|path| path.exists())
}

fn read_patch(path: &Path) -> Result<ConfigPatch, ConfigError> {
    let raw = fs::read_to_string(path)
        .map_err(|source| ConfigError::ReadFile { path: path.to_path_buf(), source })?;

    let interpolated = interpolate_env_vars(&raw)?;
    toml::from_str::<ConfigPatch>(&interpolated)
        .map_err(|source| ConfigError::ParseFile { path: path.to_path_buf(), source })
}

fn interpolate_env_vars(input: &str) -> Result<String, ConfigError> {
    let mut output = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch == '$' && matches!(chars.peek(), Some('{')) {
            chars.next();
            let mut key = String::new();

            loop {
                match chars.next() {
                    Some('}') => break,
                    Some(next) => key.push(next),
                    None => return Err(ConfigError::UnterminatedInterpolation),
                }
            }

            let value = env::var(&key)
                .map_err(|_| ConfigError::MissingEnvInterpolation { var: key.clone() })?;
            output.push_str(&value);
            continue;
        }

        output.push(ch);
    }

    Ok(output)
}

fn validate_database(database: &DatabaseConfig) -> Result<(), ConfigError> {
    let url = database.url.trim();
    let sqlite_url =
        url.starts_with("sqlite://") || url.starts_with("sqlite::") || url == ":memory:";
    if !sqlite_url {
        return Err(ConfigError::Validation(
            "database.url must be a sqlite URL (`sqlite://...`, `sqlite::...`, or `:memory:`)"
                .to_string(),
        ));
    }

    if database.max_connections == 0 {
        return Err(ConfigError::Validation(
            "database.max_connections must be greater than zero".to_string(),
        ));
    }

    if database.timeout_secs == 0 || database.timeout_secs > 300 {
        return Err(ConfigError::Validation(
            "database.timeout_secs must be in range 1..=300".to_string(),
        ));
    }

    Ok(())
}

fn validate_mirror(mirror: &MirrorConfig) -> Result<(), ConfigError> {
    if !mirror.enabled {
        return Ok(());
    }

    let base_url = mirror.base_url.as_deref().unwrap_or("").trim().to_string();
    if base_url.is_empty() {
        return Err(ConfigError::Validation(
            "mirror.base_url is required when mirror.enabled is true".to_string(),
        ));
    }
    if !base_url.starts_with("http://") && !base_url.starts_with("https://") {
        return Err(ConfigError::Validation(format!(
            "mirror.base_url must be an http(s) URL, got `{base_url}`"
        )));
    }
    if let Some(api_key) = &mirror.api_key {
        if api_key.expose_secret().trim().is_empty() {
            return Err(ConfigError::Validation(
                "mirror.api_key must not be blank when set".to_string(),
            ));
        }
    }
    if mirror.timeout_secs == 0 || mirror.timeout_secs > 300 {
        return Err(ConfigError::Validation(
            "mirror.timeout_secs must be in range 1..=300".to_string(),
        ));
    }

    Ok(())
}

fn validate_calendar(calendar: &CalendarConfig) -> Result<(), ConfigError> {
    if calendar.slot_minutes == 0 || calendar.slot_minutes > 24 * 60 {
        return Err(ConfigError::Validation(
            "calendar.slot_minutes must be in range 1..=1440".to_string(),
        ));
    }

    let day_start = parse_day_time("calendar.day_start", &calendar.day_start)?;
    let day_end = parse_day_time("calendar.day_end", &calendar.day_end)?;
    if day_start >= day_end {
        return Err(ConfigError::Validation(
            "calendar.day_start must be earlier than calendar.day_end".to_string(),
        ));
    }

    if calendar.reconcile_interval_secs == 0 {
        return Err(ConfigError::Validation(
            "calendar.reconcile_interval_secs must be greater than zero".to_string(),
        ));
    }

    Ok(())
}

fn parse_day_time(key: &str, value: &str) -> Result<NaiveTime, ConfigError> {
    NaiveTime::parse_from_str(value.trim(), "%H:%M").map_err(|_| {
        ConfigError::Validation(format!("{key} must be a HH:MM time, got `{value}`"))
    })
}

fn read_env(key: &str) -> Option<String> {
    env::var(key).ok().map(|value| value.trim().to_string()).filter(|value| !value.is_empty())
}

fn parse_u16(key: &str, value: &str) -> Result<u16, ConfigError> {
    value
        .parse()
        .map_err(|_| ConfigError::InvalidEnvOverride { key: key.to_string(), value: value.to_string() })
}

fn parse_u32(key: &str, value: &str) -> Result<u32, ConfigError> {
    value
        .parse()
        .map_err(|_| ConfigError::InvalidEnvOverride { key: key.to_string(), value: value.to_string() })
}

fn parse_u64(key: &str, value: &str) -> Result<u64, ConfigError> {
    value
        .parse()
        .map_err(|_| ConfigError::InvalidEnvOverride { key: key.to_string(), value: value.to_string() })
}

fn parse_bool(key: &str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidEnvOverride {
            key: key.to_string(),
            value: value.to_string(),
        }),
    }
}
