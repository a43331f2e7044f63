//! Layered settings: compiled defaults, then the JSON file, then `FANOUT_*`
//! environment variables, then validation.
//!
//! File values merge key by key into the defaults. Nested objects merge
//! recursively, anything else (arrays included) replaces, and `null` keeps
//! the default. A missing file is not an error.

use std::fmt::Display;
use std::io::ErrorKind;
use std::ops::RangeInclusive;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde_json::Value;
use tracing::{debug, warn};

use crate::errors::{Result, SettingsError};
use crate::types::{FanoutSettings, Strategy};

/// Directory under `$HOME` holding the settings file.
pub const SETTINGS_DIR: &str = ".fanout";

/// Settings file name.
pub const SETTINGS_FILE: &str = "settings.json";

/// `~/.fanout/settings.json`, or under `/tmp` when `HOME` is unset.
pub fn settings_path() -> PathBuf {
    std::env::var_os("HOME")
        .map_or_else(|| PathBuf::from("/tmp"), PathBuf::from)
        .join(SETTINGS_DIR)
        .join(SETTINGS_FILE)
}

/// Load from [`settings_path`] and the process environment.
pub fn load_settings() -> Result<FanoutSettings> {
    load_settings_from_path(&settings_path())
}

/// Load from `path` and the process environment.
pub fn load_settings_from_path(path: &Path) -> Result<FanoutSettings> {
    load_with_env(path, |key| std::env::var(key).ok())
}

/// Load from `path`, reading overrides through `env` instead of the
/// process environment.
pub fn load_with_env(path: &Path, env: impl Fn(&str) -> Option<String>) -> Result<FanoutSettings> {
    let mut layered = serde_json::to_value(FanoutSettings::default())?;
    if let Some(file) = read_file_layer(path)? {
        layered = deep_merge(layered, file);
    }

    let mut settings: FanoutSettings = serde_json::from_value(layered)?;
    apply_env_overrides(&mut settings, &env);
    settings.validate()?;
    Ok(settings)
}

fn read_file_layer(path: &Path) -> Result<Option<Value>> {
    match std::fs::read_to_string(path) {
        Ok(text) => {
            debug!(path = %path.display(), "merging settings file");
            Ok(Some(serde_json::from_str(&text)?))
        }
        Err(error) if error.kind() == ErrorKind::NotFound => {
            debug!(path = %path.display(), "no settings file, using defaults");
            Ok(None)
        }
        Err(source) => Err(SettingsError::Io {
            path: path.to_path_buf(),
            source,
        }),
    }
}

/// Merge `overlay` into `base` (see the module docs for the rules).
pub fn deep_merge(base: Value, overlay: Value) -> Value {
    match (base, overlay) {
        (Value::Object(mut base), Value::Object(overlay)) => {
            for (key, value) in overlay {
                if value.is_null() {
                    continue;
                }
                let merged = match base.remove(&key) {
                    Some(existing) => deep_merge(existing, value),
                    None => value,
                };
                let _ = base.insert(key, merged);
            }
            Value::Object(base)
        }
        (base, Value::Null) => base,
        (_, overlay) => overlay,
    }
}

// ─── Environment overrides ───────────────────────────────────────────────────

/// Apply `FANOUT_*` overrides read through `env`.
///
/// Unparseable or out-of-range values are logged and skipped, leaving the
/// file or default value in place.
pub fn apply_env_overrides(settings: &mut FanoutSettings, env: &dyn Fn(&str) -> Option<String>) {
    let env = Env(env);

    let server = &mut settings.server;
    set(&mut server.host, env.text("FANOUT_HOST"));
    set(&mut server.port, env.bounded("FANOUT_PORT", 0..=u16::MAX));
    set(&mut server.heartbeat_interval_ms, env.bounded("FANOUT_HEARTBEAT_INTERVAL_MS", 1_000..=600_000));
    set(&mut server.heartbeat_timeout_ms, env.bounded("FANOUT_HEARTBEAT_TIMEOUT_MS", 1_000..=3_600_000));
    set(&mut server.send_buffer, env.bounded("FANOUT_SEND_BUFFER", 1..=65_536));
    set(&mut server.stream_idle_timeout_ms, env.bounded("FANOUT_STREAM_IDLE_TIMEOUT_MS", 1_000..=86_400_000));

    let balancer = &mut settings.balancer;
    set(&mut balancer.strategy, env.parsed::<Strategy>("FANOUT_STRATEGY"));
    set(&mut balancer.sticky_sessions, env.flag("FANOUT_STICKY_SESSIONS"));
    set(&mut balancer.max_connections_per_node, env.bounded("FANOUT_MAX_CONNECTIONS_PER_NODE", 1..=1_000_000));
    set(&mut balancer.max_load, env.bounded("FANOUT_MAX_LOAD", 0.01..=1.0));
    set(&mut balancer.health_check_interval_ms, env.bounded("FANOUT_HEALTH_CHECK_INTERVAL_MS", 100..=3_600_000));
    set(&mut balancer.sticky_ttl_ms, env.bounded("FANOUT_STICKY_TTL_MS", 1_000..=86_400_000));
    set(&mut balancer.sticky_max_entries, env.bounded("FANOUT_STICKY_MAX_ENTRIES", 1..=10_000_000));

    let pool = &mut settings.pool;
    set(&mut pool.enabled, env.flag("FANOUT_POOL_ENABLED"));
    set(&mut pool.initial_instances, env.bounded("FANOUT_POOL_SIZE", 1..=1_000));
    set(&mut pool.max_instances, env.bounded("FANOUT_POOL_MAX_INSTANCES", 1..=1_000));
    set(&mut pool.health_check_interval_ms, env.bounded("FANOUT_POOL_HEALTH_CHECK_INTERVAL_MS", 100..=3_600_000));
    set(&mut pool.max_connections_per_instance, env.bounded("FANOUT_MAX_CONNECTIONS_PER_INSTANCE", 1..=1_000_000));

    let logging = &mut settings.logging;
    set(&mut logging.level, env.text("FANOUT_LOG_LEVEL"));
    set(&mut logging.format, env.text("FANOUT_LOG_FORMAT"));
}

fn set<T>(slot: &mut T, value: Option<T>) {
    if let Some(value) = value {
        *slot = value;
    }
}

struct Env<'a>(&'a dyn Fn(&str) -> Option<String>);

impl Env<'_> {
    fn text(&self, key: &str) -> Option<String> {
        (self.0)(key)
            .map(|v| v.trim().to_owned())
            .filter(|v| !v.is_empty())
    }

    fn parsed<T>(&self, key: &str) -> Option<T>
    where
        T: FromStr,
        T::Err: Display,
    {
        let raw = self.text(key)?;
        raw.parse()
            .map_err(|error: T::Err| warn!(key, value = %raw, %error, "unparseable override, ignoring"))
            .ok()
    }

    fn bounded<T>(&self, key: &str, range: RangeInclusive<T>) -> Option<T>
    where
        T: FromStr + PartialOrd,
        T::Err: Display,
    {
        let value = self.parsed::<T>(key)?;
        if range.contains(&value) {
            Some(value)
        } else {
            warn!(key, "override out of range, ignoring");
            None
        }
    }

    fn flag(&self, key: &str) -> Option<bool> {
        let raw = self.text(key)?;
        let value = parse_bool(&raw);
        if value.is_none() {
            warn!(key, value = %raw, "not a boolean, ignoring");
        }
        value
    }
}

/// `true`/`1`/`yes`/`on` or `false`/`0`/`no`/`off`, case-insensitive.
pub fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Parse `raw` and accept it only inside `range`.
pub fn parse_bounded<T>(raw: &str, range: RangeInclusive<T>) -> Option<T>
where
    T: FromStr + PartialOrd,
{
    raw.trim().parse().ok().filter(|v| range.contains(v))
}
