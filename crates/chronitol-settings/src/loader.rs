//! Settings loading with deep merge and environment variable overrides.
//!
//! Deep merge rules:
//! - Objects are merged recursively (source overrides target per-key)
//! - Arrays and primitives are replaced entirely by source
//! - Null values in source are skipped (preserving target)

use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::debug;

use crate::errors::Result;
use crate::types::{home_dir, ChronitolSettings};

/// `~/.chronitol/settings.json`
pub fn settings_path() -> PathBuf {
    home_dir().join(".chronitol").join("settings.json")
}

pub fn load_settings() -> Result<ChronitolSettings> {
    load_settings_from_path(&settings_path())
}

/// Load settings from a specific path with env var overrides.
///
/// A missing file yields defaults; invalid JSON or out-of-range values are errors.
pub fn load_settings_from_path(path: &Path) -> Result<ChronitolSettings> {
    let defaults = serde_json::to_value(ChronitolSettings::default())?;

    let merged = if path.exists() {
        debug!(?path, "loading settings from file");
        let content = std::fs::read_to_string(path)?;
        let user: Value = serde_json::from_str(&content)?;
        deep_merge(defaults, user)
    } else {
        debug!(?path, "settings file not found, using defaults");
        defaults
    };

    let mut settings: ChronitolSettings = serde_json::from_value(merged)?;
    apply_env_overrides(&mut settings);
    settings.validate()?;
    Ok(settings)
}

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
                let _ = target_map.insert(key, merged);
            }
            Value::Object(target_map)
        }
        (_, source) => source,
    }
}

/// Apply `CHRONITOL_*` overrides. Invalid values are logged and ignored.
pub fn apply_env_overrides(settings: &mut ChronitolSettings) {
    // ── Reminder policy ─────────────────────────────────────────────
    if let Some(v) = read_env_u32("CHRONITOL_DUE_WINDOW_MINUTES", 1, 24 * 60) {
        settings.reminders.due_window_minutes = v;
    }
    if let Some(v) = read_env_minutes_list("CHRONITOL_SNOOZE_MINUTES") {
        settings.reminders.snooze_choices_minutes = v;
    }
    if let Some(v) = read_env_u32("CHRONITOL_SKIP_GRACE_SECS", 0, 3600) {
        settings.reminders.skip_grace_seconds = v;
    }

    // ── Runner ──────────────────────────────────────────────────────
    if let Some(v) = read_env_u64("CHRONITOL_TICK_SECS", 1, 3600) {
        settings.runner.tick_interval_secs = v;
    }
    if let Some(v) = read_env_u64("CHRONITOL_SWEEP_SECS", 1, 86_400) {
        settings.runner.sweep_frequency_secs = v;
    }

    // ── Storage / logging / calendar ────────────────────────────────
    if let Some(v) = read_env_string("CHRONITOL_DATA_DIR") {
        settings.storage.data_dir = v;
    }
    if let Some(v) = read_env_string("CHRONITOL_LOG_LEVEL") {
        settings.logging.level = v;
    }
    if let Some(v) = read_env_bool("CHRONITOL_LOG_JSON") {
        settings.logging.json = v;
    }
    if let Some(v) = read_env_bool("CHRONITOL_LOG_TO_SQLITE") {
        settings.logging.log_to_sqlite = v;
    }
    if let Some(v) = read_env_string("CHRONITOL_TIME_ZONE") {
        settings.calendar.time_zone = Some(v);
    }
}

// ── Pure parsing functions (testable without env vars) ──────────────────────

/// Accepts (case-insensitive): `true`/`1`/`yes`/`on` or `false`/`0`/`no`/`off`.
pub fn parse_bool(val: &str) -> Option<bool> {
    match val.trim().to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

pub fn parse_u32_range(val: &str, min: u32, max: u32) -> Option<u32> {
    let n: u32 = val.trim().parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

pub fn parse_u64_range(val: &str, min: u64, max: u64) -> Option<u64> {
    let n: u64 = val.trim().parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

/// Comma-separated minutes, e.g. `5,15,30`. All entries must be 1..=1440.
pub fn parse_minutes_list(val: &str) -> Option<Vec<u32>> {
    let parsed: Option<Vec<u32>> = val
        .split(',')
        .map(|part| parse_u32_range(part, 1, 24 * 60))
        .collect();
    parsed.filter(|v| !v.is_empty())
}

// ── Env var readers (thin wrappers) ─────────────────────────────────────────

fn read_env_string(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

fn read_env_bool(name: &str) -> Option<bool> {
    let val = std::env::var(name).ok()?;
    let result = parse_bool(&val);
    if result.is_none() {
        tracing::warn!(key = name, value = %val, "invalid boolean env var, ignoring");
    }
    result
}

fn read_env_u32(name: &str, min: u32, max: u32) -> Option<u32> {
    let val = std::env::var(name).ok()?;
    let result = parse_u32_range(&val, min, max);
    if result.is_none() {
        tracing::warn!(key = name, value = %val, "invalid u32 env var, ignoring");
    }
    result
}

fn read_env_u64(name: &str, min: u64, max: u64) -> Option<u64> {
    let val = std::env::var(name).ok()?;
    let result = parse_u64_range(&val, min, max);
    if result.is_none() {
        tracing::warn!(key = name, value = %val, "invalid u64 env var, ignoring");
    }
    result
}

fn read_env_minutes_list(name: &str) -> Option<Vec<u32>> {
    let val = std::env::var(name).ok()?;
    let result = parse_minutes_list(&val);
    if result.is_none() {
        tracing::warn!(key = name, value = %val, "invalid minutes list env var, ignoring");
    }
    result
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
