//! Server configuration.
//!
//! Loading flow:
//! 1. Start with compiled [`ServerConfig::default()`]
//! 2. If a config file is given, deep-merge its JSON over the defaults
//! 3. Apply `CHORUS_*` environment overrides (highest priority)
//!
//! Invalid environment values are ignored with a warning.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::client::KeepAlive;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config JSON: {0}")]
    Json(#[from] serde_json::Error),
}

/// Configuration for the chat server.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Host to bind (default `"127.0.0.1"`).
    pub host: String,
    /// Port to bind (default `8080`; `0` picks a free port).
    pub port: u16,
    /// Directory served for every non-upgrade request.
    pub public_dir: String,
    /// Capacity of each connection's outbound queue.
    pub send_buffer: usize,
    /// Bound on a single socket write, in milliseconds.
    pub write_wait_ms: u64,
    /// Time allowed between pongs, in milliseconds. Pings go out at 90% of it.
    pub pong_wait_ms: u64,
    /// Largest inbound message accepted, in bytes.
    pub max_message_size: usize,
    pub log_level: String,
    pub log_json: bool,
    /// SQLite file for room and user records. `:memory:` keeps them in memory.
    pub db_path: String,
    /// Shared broker for cross-process delivery, e.g. `redis://host:6379`.
    /// Unset keeps fan-out inside this process.
    pub backplane_url: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 8080,
            public_dir: "./public".into(),
            send_buffer: 256,
            write_wait_ms: 10_000,
            pong_wait_ms: 60_000,
            max_message_size: 10_000,
            log_level: "info".into(),
            log_json: false,
            db_path: "chorus.db".into(),
            backplane_url: None,
        }
    }
}

impl ServerConfig {
    pub fn keepalive(&self) -> KeepAlive {
        KeepAlive::new(
            Duration::from_millis(self.write_wait_ms),
            Duration::from_millis(self.pong_wait_ms),
        )
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Load configuration from an optional JSON file plus the process environment.
///
/// A missing file yields defaults; an unreadable or malformed file is an error.
pub fn load_config(path: Option<&Path>) -> Result<ServerConfig, ConfigError> {
    let defaults = serde_json::to_value(ServerConfig::default())?;

    let merged = match path {
        Some(path) if path.exists() => {
            debug!(?path, "loading config from file");
            let content = std::fs::read_to_string(path)?;
            let user: Value = serde_json::from_str(&content)?;
            deep_merge(defaults, user)
        }
        Some(path) => {
            debug!(?path, "config file not found, using defaults");
            defaults
        }
        None => defaults,
    };

    let mut config: ServerConfig = serde_json::from_value(merged)?;
    apply_env_overrides(&mut config, |key| std::env::var(key).ok());
    Ok(config)
}

/// Objects merge per key; anything else in `source` replaces `target`.
/// Nulls in `source` are skipped.
pub fn deep_merge(target: Value, source: Value) -> Value {
    match (target, source) {
        (Value::Object(mut target_map), Value::Object(source_map)) => {
            for (key, source_val) in source_map {
                if source_val.is_null() {
                    continue;
                }
                let merged = match target_map.remove(&key) {
                    Some(target_val) => deep_merge(target_val, source_val),
                    None => source_val,
                };
                target_map.insert(key, merged);
            }
            Value::Object(target_map)
        }
        (_, source) => source,
    }
}

/// Apply `CHORUS_*` overrides read through `lookup`.
pub fn apply_env_overrides<F>(config: &mut ServerConfig, lookup: F)
where
    F: Fn(&str) -> Option<String>,
{
    let env = Env { lookup };

    if let Some(v) = env.string("CHORUS_HOST") {
        config.host = v;
    }
    if let Some(v) = env.parsed("CHORUS_PORT", |s| parse_range::<u16>(s, 0, u16::MAX)) {
        config.port = v;
    }
    if let Some(v) = env.string("CHORUS_PUBLIC_DIR") {
        config.public_dir = v;
    }
    if let Some(v) = env.parsed("CHORUS_SEND_BUFFER", |s| parse_range::<usize>(s, 1, 65_536)) {
        config.send_buffer = v;
    }
    if let Some(v) = env.parsed("CHORUS_WRITE_WAIT_MS", |s| parse_range::<u64>(s, 1, 600_000)) {
        config.write_wait_ms = v;
    }
    if let Some(v) = env.parsed("CHORUS_PONG_WAIT_MS", |s| parse_range::<u64>(s, 10, 3_600_000)) {
        config.pong_wait_ms = v;
    }
    if let Some(v) = env.parsed("CHORUS_MAX_MESSAGE_SIZE", |s| {
        parse_range::<usize>(s, 64, 64 * 1024 * 1024)
    }) {
        config.max_message_size = v;
    }
    if let Some(v) = env.string("CHORUS_LOG_LEVEL") {
        config.log_level = v;
    }
    if let Some(v) = env.parsed("CHORUS_LOG_JSON", parse_bool) {
        config.log_json = v;
    }
    if let Some(v) = env.string("CHORUS_DB_PATH") {
        config.db_path = v;
    }
    if let Some(v) = env.string("CHORUS_BACKPLANE_URL") {
        config.backplane_url = Some(v);
    }
}

struct Env<F> {
    lookup: F,
}

impl<F: Fn(&str) -> Option<String>> Env<F> {
    fn string(&self, key: &str) -> Option<String> {
        (self.lookup)(key).filter(|v| !v.is_empty())
    }

    fn parsed<T>(&self, key: &str, parse: impl Fn(&str) -> Option<T>) -> Option<T> {
        let val = self.string(key)?;
        let result = parse(&val);
        if result.is_none() {
            warn!(key, value = %val, "invalid env override, ignoring");
        }
        result
    }
}

/// Accepts (case-insensitive) `true`/`1`/`yes`/`on` or `false`/`0`/`no`/`off`.
pub fn parse_bool(val: &str) -> Option<bool> {
    match val.to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

pub fn parse_range<T>(val: &str, min: T, max: T) -> Option<T>
where
    T: std::str::FromStr + PartialOrd,
{
    let n: T = val.trim().parse().ok()?;
    (n >= min && n <= max).then_some(n)
}
