use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use cadence_core::config::{AppConfig, LoadOptions};
use secrecy::ExposeSecret;
use toml::Value;

use crate::commands::{load_config, CommandResult};

struct ConfigSource<'a> {
    doc: Option<Value>,
    path: Option<&'a Path>,
}

pub fn run(options: &LoadOptions) -> CommandResult {
    let config = match load_config("config", options) {
        Ok(config) => config,
        Err(failure) => return failure,
    };

    let config_file_path = detect_config_path(options.config_path.as_deref());
    let source =
        ConfigSource { doc: load_config_file_doc(config_file_path.as_deref()), path: config_file_path.as_deref() };

    let mut lines = vec!["effective config (source precedence: flag > env > file > default):".to_string()];
    for (key, value, env_key) in entries(&config) {
        lines.push(render_line(key, &value, field_source(key, env_key, &source)));
    }

    CommandResult::success("config", lines.join("\n"))
}

fn entries(config: &AppConfig) -> Vec<(&'static str, String, &'static str)> {
    let password = match &config.mailbox.password {
        Some(secret) => redact(secret.expose_secret()),
        None => "<unset>".to_string(),
    };

    vec![
        ("database.url", config.database.url.clone(), "CADENCE_DATABASE_URL"),
        (
            "database.max_connections",
            config.database.max_connections.to_string(),
            "CADENCE_DATABASE_MAX_CONNECTIONS",
        ),
        ("database.timeout_secs", config.database.timeout_secs.to_string(), "CADENCE_DATABASE_TIMEOUT_SECS"),
        ("server.bind_address", config.server.bind_address.clone(), "CADENCE_SERVER_BIND_ADDRESS"),
        (
            "server.health_check_port",
            config.server.health_check_port.to_string(),
            "CADENCE_SERVER_HEALTH_CHECK_PORT",
        ),
        (
            "scheduler.tick_interval_secs",
            config.scheduler.tick_interval_secs.to_string(),
            "CADENCE_SCHEDULER_TICK_INTERVAL_SECS",
        ),
        (
            "scheduler.max_touches_per_tick",
            config.scheduler.max_touches_per_tick.to_string(),
            "CADENCE_SCHEDULER_MAX_TOUCHES_PER_TICK",
        ),
        (
            "scheduler.default_channel",
            config.scheduler.default_channel.as_str().to_string(),
            "CADENCE_SCHEDULER_DEFAULT_CHANNEL",
        ),
        ("mailbox.enabled", config.mailbox.enabled.to_string(), "CADENCE_MAILBOX_ENABLED"),
        (
            "mailbox.host",
            config.mailbox.host.clone().unwrap_or_else(|| "<unset>".to_string()),
            "CADENCE_MAILBOX_HOST",
        ),
        ("mailbox.password", password, "CADENCE_MAILBOX_PASSWORD"),
        ("playbook.path", config.playbook.path.display().to_string(), "CADENCE_PLAYBOOK_PATH"),
        ("logging.level", config.logging.level.clone(), "CADENCE_LOGGING_LEVEL"),
        ("logging.format", format!("{:?}", config.logging.format).to_lowercase(), "CADENCE_LOGGING_FORMAT"),
    ]
}

fn detect_config_path(explicit: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = explicit {
        return path.exists().then(|| path.to_path_buf());
    }
    ["cadence.toml", "config/cadence.toml"].into_iter().map(PathBuf::from).find(|path| path.exists())
}

fn load_config_file_doc(path: Option<&Path>) -> Option<Value> {
    let raw = fs::read_to_string(path?).ok()?;
    raw.parse::<Value>().ok()
}

fn field_source(key_path: &str, env_key: &str, source: &ConfigSource<'_>) -> String {
    if env::var_os(env_key).is_some() {
        return format!("env ({env_key})");
    }

    if let Some(doc) = &source.doc {
        if contains_path(doc, key_path) {
            let file_path = source
                .path
                .map(|path| path.display().to_string())
                .unwrap_or_else(|| "config file".to_string());
            return format!("file ({file_path})");
        }
    }

    "default".to_string()
}

fn contains_path(root: &Value, key_path: &str) -> bool {
    let mut current = root;
    for key in key_path.split('.') {
        let Some(next) = current.get(key) else {
            return false;
        };
        current = next;
    }
    true
}

fn render_line(key: &str, value: &str, source: String) -> String {
    format!("- {key} = {value} (source: {source})")
}

fn redact(secret: &str) -> String {
    if secret.trim().is_empty() {
        "<empty>".to_string()
    } else {
        "<redacted>".to_string()
    }
}
