//! Settings type definitions.
//!
//! Field names are camelCase on disk. Every section is `#[serde(default)]`,
//! so a settings file only needs the keys it changes.

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::errors::{Result, SettingsError};

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ChronitolSettings {
    /// Settings schema version.
    pub version: String,
    pub reminders: ReminderSettings,
    pub runner: RunnerSettings,
    pub storage: StorageSettings,
    pub logging: LoggingSettings,
    pub calendar: CalendarSettings,
}

impl Default for ChronitolSettings {
    fn default() -> Self {
        Self {
            version: "0.1.0".to_string(),
            reminders: ReminderSettings::default(),
            runner: RunnerSettings::default(),
            storage: StorageSettings::default(),
            logging: LoggingSettings::default(),
            calendar: CalendarSettings::default(),
        }
    }
}

impl ChronitolSettings {
    /// Reject values that deserialize fine but cannot drive the scheduler.
    pub fn validate(&self) -> Result<()> {
        let r = &self.reminders;
        if r.snooze_choices_minutes.is_empty() {
            return Err(SettingsError::InvalidValue(
                "reminders.snoozeChoicesMinutes is empty".into(),
            ));
        }
        if let Some(bad) = r
            .snooze_choices_minutes
            .iter()
            .find(|m| **m == 0 || **m > 24 * 60)
        {
            return Err(SettingsError::InvalidValue(format!(
                "reminders.snoozeChoicesMinutes contains {bad}"
            )));
        }
        if r.due_window_minutes == 0 {
            return Err(SettingsError::InvalidValue(
                "reminders.dueWindowMinutes must be positive".into(),
            ));
        }
        if self.runner.tick_interval_secs == 0 {
            return Err(SettingsError::InvalidValue(
                "runner.tickIntervalSecs must be positive".into(),
            ));
        }
        Ok(())
    }
}

/// Reminder policy knobs.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ReminderSettings {
    /// How long an unacknowledged scheduled reminder may sit in the past
    /// before it is shown as due.
    pub due_window_minutes: u32,
    /// Snooze choices offered on a delivered notification.
    pub snooze_choices_minutes: Vec<u32>,
    /// Offset past a skipped occurrence before the daily alarm is restored.
    pub skip_grace_seconds: u32,
}

impl Default for ReminderSettings {
    fn default() -> Self {
        Self {
            due_window_minutes: 60,
            snooze_choices_minutes: vec![5, 15, 30],
            skip_grace_seconds: 30,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RunnerSettings {
    pub tick_interval_secs: u64,
    /// How often the delayed-reminder sweep runs.
    pub sweep_frequency_secs: u64,
}

impl Default for RunnerSettings {
    fn default() -> Self {
        Self {
            tick_interval_secs: 60,
            sweep_frequency_secs: 60,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StorageSettings {
    pub data_dir: String,
    pub database_file: String,
    pub delayed_reminders_file: String,
    pub log_database_file: String,
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            data_dir: home_dir().join(".chronitol").to_string_lossy().into_owned(),
            database_file: "chronitol.db".to_string(),
            delayed_reminders_file: "delayed-reminders.json".to_string(),
            log_database_file: "logs.db".to_string(),
        }
    }
}

impl StorageSettings {
    pub fn database_path(&self) -> PathBuf {
        PathBuf::from(&self.data_dir).join(&self.database_file)
    }

    pub fn delayed_reminders_path(&self) -> PathBuf {
        PathBuf::from(&self.data_dir).join(&self.delayed_reminders_file)
    }

    pub fn log_database_path(&self) -> PathBuf {
        PathBuf::from(&self.data_dir).join(&self.log_database_file)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingSettings {
    /// Default level; `RUST_LOG` still wins when set.
    pub level: String,
    /// JSON lines on stdout instead of human-readable output.
    pub json: bool,
    /// Persist warn+ events to the log database.
    pub log_to_sqlite: bool,
    /// Per-module overrides, e.g. `{"chronitol_engine::runner": "debug"}`.
    pub module_levels: BTreeMap<String, String>,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
            log_to_sqlite: true,
            module_levels: BTreeMap::new(),
        }
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CalendarSettings {
    /// IANA zone name; unset follows the host zone.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub time_zone: Option<String>,
}

pub(crate) fn home_dir() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
}
