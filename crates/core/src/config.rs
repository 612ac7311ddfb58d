use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::campaign::Channel;

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    pub server: ServerConfig,
    pub scheduler: SchedulerConfig,
    pub mailbox: MailboxConfig,
    pub playbook: PlaybookConfig,
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
    pub health_check_port: u16,
    pub graceful_shutdown_secs: u64,
}

#[derive(Clone, Debug)]
pub struct SchedulerConfig {
    pub tick_interval_secs: u64,
    /// Upper bound on touches dispatched in one tick; the rest wait for the next.
    pub max_touches_per_tick: usize,
    pub default_channel: Channel,
}

#[derive(Clone, Debug)]
pub struct MailboxConfig {
    pub enabled: bool,
    pub host: Option<String>,
    pub username: Option<String>,
    pub password: Option<SecretString>,
    pub poll_interval_secs: u64,
}

#[derive(Clone, Debug)]
pub struct PlaybookConfig {
    pub path: PathBuf,
}

#[derive(Clone, Debug)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    Compact,
    Pretty,
    Json,
}

#[derive(Clone, Debug, Default)]
pub struct ConfigOverrides {
    pub database_url: Option<String>,
    pub log_level: Option<String>,
    pub playbook_path: Option<PathBuf>,
    pub tick_interval_secs: Option<u64>,
    pub mailbox_enabled: Option<bool>,
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
                url: "sqlite://cadence.db".to_string(),
                max_connections: 5,
                timeout_secs: 30,
            },
            server: ServerConfig {
                bind_address: "127.0.0.1".to_string(),
                health_check_port: 8080,
                graceful_shutdown_secs: 15,
            },
            scheduler: SchedulerConfig {
                tick_interval_secs: 60,
                max_touches_per_tick: 100,
                default_channel: Channel::Email,
            },
            mailbox: MailboxConfig {
                enabled: false,
                host: None,
                username: None,
                password: None,
                poll_interval_secs: 300,
            },
            playbook: PlaybookConfig { path: PathBuf::from("config/playbook.toml") },
            logging: LoggingConfig { level: "info".to_string(), format: LogFormat::Compact },
        }
    }
}

fn secret_value(value: String) -> SecretString {
    value.into()
}

impl FromStr for LogFormat {
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

impl AppConfig {
    pub fn load(options: LoadOptions) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        let maybe_path = resolve_config_path(options.config_path.as_deref());

        if let Some(path) = maybe_path {
            let patch = read_patch(&path)?;
            config.apply_patch(patch);
        } else if options.require_file {
            let expected = options.config_path.unwrap_or_else(|| PathBuf::from("cadence.toml"));
            return Err(ConfigError::MissingConfigFile(expected));
        }

        config.apply_env_overrides()?;
        config.apply_overrides(options.overrides);
        config.validate()?;

        Ok(config)
    }

    fn apply_patch(&mut self, patch: ConfigPatch) {
        if let Some(database) = patch.database {
            overwrite(&mut self.database.url, database.url);
            overwrite(&mut self.database.max_connections, database.max_connections);
            overwrite(&mut self.database.timeout_secs, database.timeout_secs);
        }
        if let Some(server) = patch.server {
            overwrite(&mut self.server.bind_address, server.bind_address);
            overwrite(&mut self.server.health_check_port, server.health_check_port);
            overwrite(&mut self.server.graceful_shutdown_secs, server.graceful_shutdown_secs);
        }
        if let Some(scheduler) = patch.scheduler {
            overwrite(&mut self.scheduler.tick_interval_secs, scheduler.tick_interval_secs);
            overwrite(&mut self.scheduler.max_touches_per_tick, scheduler.max_touches_per_tick);
            overwrite(&mut self.scheduler.default_channel, scheduler.default_channel);
        }
        if let Some(mailbox) = patch.mailbox {
            overwrite(&mut self.mailbox.enabled, mailbox.enabled);
            overwrite(&mut self.mailbox.poll_interval_secs, mailbox.poll_interval_secs);
            self.mailbox.host = mailbox.host.or(self.mailbox.host.take());
            self.mailbox.username = mailbox.username.or(self.mailbox.username.take());
            if let Some(password) = mailbox.password {
                self.mailbox.password = Some(secret_value(password));
            }
        }
        if let Some(playbook) = patch.playbook {
            overwrite(&mut self.playbook.path, playbook.path);
        }
        if let Some(logging) = patch.logging {
            overwrite(&mut self.logging.level, logging.level);
            overwrite(&mut self.logging.format, logging.format);
        }
    }

    fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        overwrite(&mut self.database.url, env_value("CADENCE_DATABASE_URL")?);
        overwrite(&mut self.database.max_connections, env_value("CADENCE_DATABASE_MAX_CONNECTIONS")?);
        overwrite(&mut self.database.timeout_secs, env_value("CADENCE_DATABASE_TIMEOUT_SECS")?);

        overwrite(&mut self.server.bind_address, env_value("CADENCE_SERVER_BIND_ADDRESS")?);
        overwrite(&mut self.server.health_check_port, env_value("CADENCE_SERVER_HEALTH_CHECK_PORT")?);
        overwrite(
            &mut self.server.graceful_shutdown_secs,
            env_value("CADENCE_SERVER_GRACEFUL_SHUTDOWN_SECS")?,
        );

        overwrite(
            &mut self.scheduler.tick_interval_secs,
            env_value("CADENCE_SCHEDULER_TICK_INTERVAL_SECS")?,
        );
        overwrite(
            &mut self.scheduler.max_touches_per_tick,
            env_value("CADENCE_SCHEDULER_MAX_TOUCHES_PER_TICK")?,
        );
        const CHANNEL_KEY: &str = "CADENCE_SCHEDULER_DEFAULT_CHANNEL";
        if let Some(raw) = read_env(CHANNEL_KEY) {
            self.scheduler.default_channel =
                Channel::parse(&raw).ok_or_else(|| invalid_env(CHANNEL_KEY, &raw))?;
        }

        overwrite(&mut self.mailbox.enabled, env_value("CADENCE_MAILBOX_ENABLED")?);
        overwrite(&mut self.mailbox.poll_interval_secs, env_value("CADENCE_MAILBOX_POLL_INTERVAL_SECS")?);
        if let Some(host) = read_env("CADENCE_MAILBOX_HOST") {
            self.mailbox.host = Some(host);
        }
        if let Some(username) = read_env("CADENCE_MAILBOX_USERNAME") {
            self.mailbox.username = Some(username);
        }
        if let Some(password) = read_env("CADENCE_MAILBOX_PASSWORD") {
            self.mailbox.password = Some(secret_value(password));
        }

        overwrite(&mut self.playbook.path, env_value("CADENCE_PLAYBOOK_PATH")?);

        // The short LOG_* spellings are accepted as aliases.
        if let Some(level) =
            read_env("CADENCE_LOGGING_LEVEL").or_else(|| read_env("CADENCE_LOG_LEVEL"))
        {
            self.logging.level = level;
        }
        if let Some(format) =
            read_env("CADENCE_LOGGING_FORMAT").or_else(|| read_env("CADENCE_LOG_FORMAT"))
        {
            self.logging.format = format.parse()?;
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
        if let Some(playbook_path) = overrides.playbook_path {
            self.playbook.path = playbook_path;
        }
        if let Some(tick_interval_secs) = overrides.tick_interval_secs {
            self.scheduler.tick_interval_secs = tick_interval_secs;
        }
        if let Some(enabled) = overrides.mailbox_enabled {
            self.mailbox.enabled = enabled;
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_database(&self.database)?;
        validate_server(&self.server)?;
        validate_scheduler(&self.scheduler)?;
        validate_mailbox(&self.mailbox)?;
        validate_playbook(&self.playbook)?;
        validate_logging(&self.logging)?;
        Ok(())
    }
}

fn resolve_config_path(explicit_path: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = explicit_path {
        return path.exists().then_some(path.to_path_buf());
    }

    [PathBuf::from("cadence.toml"), PathBuf::from("config/cadence.toml")]
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

fn validate_server(server: &ServerConfig) -> Result<(), ConfigError> {
    if server.health_check_port == 0 {
        return Err(ConfigError::Validation(
            "server.health_check_port must be greater than zero".to_string(),
        ));
    }

    if server.graceful_shutdown_secs == 0 {
        return Err(ConfigError::Validation(
            "server.graceful_shutdown_secs must be greater than zero".to_string(),
        ));
    }

    Ok(())
}

fn validate_scheduler(scheduler: &SchedulerConfig) -> Result<(), ConfigError> {
    if scheduler.tick_interval_secs == 0 || scheduler.tick_interval_secs > 86_400 {
        return Err(ConfigError::Validation(
            "scheduler.tick_interval_secs must be in range 1..=86400".to_string(),
        ));
    }
    if scheduler.max_touches_per_tick == 0 {
        return Err(ConfigError::Validation(
            "scheduler.max_touches_per_tick must be greater than zero".to_string(),
        ));
    }
    Ok(())
}

fn validate_mailbox(mailbox: &MailboxConfig) -> Result<(), ConfigError> {
    if mailbox.poll_interval_secs == 0 {
        return Err(ConfigError::Validation(
            "mailbox.poll_interval_secs must be greater than zero".to_string(),
        ));
    }
    if !mailbox.enabled {
        return Ok(());
    }

    let host_missing = mailbox.host.as_ref().map(|host| host.trim().is_empty()).unwrap_or(true);
    if host_missing {
        return Err(ConfigError::Validation(
            "mailbox.host is required when mailbox.enabled is true".to_string(),
        ));
    }
    let password_missing = mailbox
        .password
        .as_ref()
        .map(|value| value.expose_secret().trim().is_empty())
        .unwrap_or(true);
    if password_missing {
        return Err(ConfigError::Validation(
            "mailbox.password is required when mailbox.enabled is true (set CADENCE_MAILBOX_PASSWORD)"
                .to_string(),
        ));
    }
    Ok(())
}

fn validate_playbook(playbook: &PlaybookConfig) -> Result<(), ConfigError> {
    if playbook.path.as_os_str().is_empty() {
        return Err(ConfigError::Validation("playbook.path must not be empty".to_string()));
    }
    Ok(())
}

fn validate_logging(logging: &LoggingConfig) -> Result<(), ConfigError> {
    let level = logging.level.trim().to_ascii_lowercase();
    match level.as_str() {
        "trace" | "debug" | "info" | "warn" | "error" => Ok(()),
        _ => Err(ConfigError::Validation(
            "logging.level must be one of trace|debug|info|warn|error".to_string(),
        )),
    }
}

fn read_env(key: &str) -> Option<String> {
    env::var(key).ok().filter(|value| !value.trim().is_empty())
}

fn invalid_env(key: &str, value: &str) -> ConfigError {
    ConfigError::InvalidEnvOverride { key: key.to_string(), value: value.to_string() }
}

/// Reads `key` and parses it, reporting the variable name when the value is malformed.
fn env_value<T: FromStr>(key: &str) -> Result<Option<T>, ConfigError> {
    read_env(key).map(|raw| raw.parse::<T>().map_err(|_| invalid_env(key, &raw))).transpose()
}

fn overwrite<T>(slot: &mut T, value: Option<T>) {
    if let Some(value) = value {
        *slot = value;
    }
}

#[derive(Debug, Default, Deserialize)]
struct ConfigPatch {
    database: Option<DatabasePatch>,
    server: Option<ServerPatch>,
    scheduler: Option<SchedulerPatch>,
    mailbox: Option<MailboxPatch>,
    playbook: Option<PlaybookPatch>,
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
    health_check_port: Option<u16>,
    graceful_shutdown_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct SchedulerPatch {
    tick_interval_secs: Option<u64>,
    max_touches_per_tick: Option<usize>,
    default_channel: Option<Channel>,
}

#[derive(Debug, Default, Deserialize)]
struct MailboxPatch {
    enabled: Option<bool>,
    host: Option<String>,
    username: Option<String>,
    password: Option<String>,
    poll_interval_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct PlaybookPatch {
    path: Option<PathBuf>,
}

#[derive(Debug, Default, Deserialize)]
struct LoggingPatch {
    level: Option<String>,
    format: Option<LogFormat>,
}

#[cfg(test)]
mod tests {
    use std::env;
    use std::fs;
    use std::io;
    use std::path::PathBuf;
    use std::sync::{Mutex, OnceLock};

    use secrecy::ExposeSecret;
    use tempfile::TempDir;

    use super::{AppConfig, ConfigError, ConfigOverrides, LoadOptions, LogFormat};
    use crate::domain::campaign::Channel;

    static ENV_LOCK: OnceLock<Mutex<()>> = OnceLock::new();

    fn env_lock() -> &'static Mutex<()> {
        ENV_LOCK.get_or_init(|| Mutex::new(()))
    }

    fn clear_vars(vars: &[&str]) {
        for var in vars {
            env::remove_var(var);
        }
    }

    fn ensure(condition: bool, message: &'static str) -> Result<(), String> {
        if condition {
            Ok(())
        } else {
            Err(message.to_string())
        }
    }

    #[test]
    fn defaults_are_valid() -> Result<(), String> {
        let config = AppConfig::default();
        config.validate().map_err(|err| err.to_string())?;
        ensure(config.scheduler.default_channel == Channel::Email, "email is the default channel")?;
        ensure(!config.mailbox.enabled, "mailbox polling is opt-in")
    }

    #[test]
    fn file_load_supports_env_interpolation() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        env::set_var("TEST_CADENCE_MAILBOX_SECRET", "hunter2-from-env");

        let result = (|| -> Result<(), String> {
            let dir = TempDir::new().map_err(|err: io::Error| err.to_string())?;
            let path = dir.path().join("cadence.toml");
            fs::write(
                &path,
                r#"
[mailbox]
enabled = true
host = "imap.example.com"
password = "${TEST_CADENCE_MAILBOX_SECRET}"

[scheduler]
tick_interval_secs = 15
default_channel = "sms"
"#,
            )
            .map_err(|err| err.to_string())?;

            let config =
                AppConfig::load(LoadOptions { config_path: Some(path), ..LoadOptions::default() })
                    .map_err(|err| format!("config load failed: {err}"))?;

            ensure(
                config.mailbox.password.as_ref().map(|secret| secret.expose_secret())
                    == Some("hunter2-from-env"),
                "mailbox password should be interpolated from environment",
            )?;
            ensure(config.scheduler.tick_interval_secs == 15, "tick interval should come from file")?;
            ensure(config.scheduler.default_channel == Channel::Sms, "channel should come from file")?;
            Ok(())
        })();

        clear_vars(&["TEST_CADENCE_MAILBOX_SECRET"]);
        result
    }

    #[test]
    fn logging_env_aliases_are_supported() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        env::set_var("CADENCE_LOG_LEVEL", "warn");
        env::set_var("CADENCE_LOG_FORMAT", "pretty");

        let result = (|| -> Result<(), String> {
            let config = AppConfig::load(LoadOptions::default())
                .map_err(|err| format!("config load failed: {err}"))?;

            ensure(config.logging.level == "warn", "warning log level should be set from env var")?;
            ensure(
                matches!(config.logging.format, LogFormat::Pretty),
                "pretty logging format should be set from env var",
            )?;
            Ok(())
        })();

        clear_vars(&["CADENCE_LOG_LEVEL", "CADENCE_LOG_FORMAT"]);
        result
    }

    #[test]
    fn precedence_defaults_file_env_overrides() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        env::set_var("CADENCE_DATABASE_URL", "sqlite://from-env.db");
        env::set_var("CADENCE_PLAYBOOK_PATH", "/etc/cadence/env-playbook.toml");

        let result = (|| -> Result<(), String> {
            let dir = TempDir::new().map_err(|err: io::Error| err.to_string())?;
            let path = dir.path().join("cadence.toml");
            fs::write(
                &path,
                r#"
[database]
url = "sqlite://from-file.db"

[playbook]
path = "from-file.toml"

[logging]
level = "warn"
"#,
            )
            .map_err(|err| err.to_string())?;

            let config = AppConfig::load(LoadOptions {
                config_path: Some(path),
                overrides: ConfigOverrides {
                    database_url: Some("sqlite://from-override.db".to_string()),
                    log_level: Some("debug".to_string()),
                    ..ConfigOverrides::default()
                },
                ..LoadOptions::default()
            })
            .map_err(|err| format!("config load failed: {err}"))?;

            ensure(
                config.database.url == "sqlite://from-override.db",
                "override database url should win",
            )?;
            ensure(config.logging.level == "debug", "overridden log level should be debug")?;
            ensure(
                config.playbook.path == PathBuf::from("/etc/cadence/env-playbook.toml"),
                "env playbook path should win over file and defaults",
            )?;
            Ok(())
        })();

        clear_vars(&["CADENCE_DATABASE_URL", "CADENCE_PLAYBOOK_PATH"]);
        result
    }

    #[test]
    fn validation_fails_fast_with_actionable_error() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        env::set_var("CADENCE_MAILBOX_ENABLED", "true");
        env::set_var("CADENCE_MAILBOX_HOST", "imap.example.com");

        let result = (|| -> Result<(), String> {
            let error = match AppConfig::load(LoadOptions::default()) {
                Ok(_) => {
                    return Err("expected validation failure but config load succeeded".to_string())
                }
                Err(error) => error,
            };
            let has_message = matches!(
                error,
                ConfigError::Validation(ref message) if message.contains("mailbox.password")
            );
            ensure(has_message, "validation failure should mention mailbox.password")
        })();

        clear_vars(&["CADENCE_MAILBOX_ENABLED", "CADENCE_MAILBOX_HOST"]);
        result
    }

    #[test]
    fn invalid_env_values_are_reported_with_their_key() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        env::set_var("CADENCE_SCHEDULER_DEFAULT_CHANNEL", "pigeon");

        let result = (|| -> Result<(), String> {
            let error = match AppConfig::load(LoadOptions::default()) {
                Ok(_) => return Err("unknown channel should be rejected".to_string()),
                Err(error) => error,
            };
            ensure(
                matches!(
                    error,
                    ConfigError::InvalidEnvOverride { ref key, .. }
                        if key == "CADENCE_SCHEDULER_DEFAULT_CHANNEL"
                ),
                "error should name the offending variable",
            )
        })();

        clear_vars(&["CADENCE_SCHEDULER_DEFAULT_CHANNEL"]);
        result
    }

    #[test]
    fn secret_values_are_not_leaked_by_debug() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        env::set_var("CADENCE_MAILBOX_PASSWORD", "mailbox-secret-value");

        let result = (|| -> Result<(), String> {
            let config = AppConfig::load(LoadOptions::default())
                .map_err(|err| format!("config load failed: {err}"))?;
            let debug = format!("{config:?}");

            ensure(
                !debug.contains("mailbox-secret-value"),
                "debug output should not contain the mailbox password",
            )?;
            ensure(
                matches!(config.logging.format, LogFormat::Compact),
                "default logging format should be compact",
            )?;
            Ok(())
        })();

        clear_vars(&["CADENCE_MAILBOX_PASSWORD"]);
        result
    }
}
