use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::calendar::Calendar;
use crate::ids::{AlarmId, DoseId, DrugId};

/// Display label used when a reminder's drug can no longer be resolved.
pub const UNKNOWN_DRUG_NAME: &str = "A drug";

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Drug {
    pub id: DrugId,
    pub name: String,
    pub is_active: bool,
}

impl Drug {
    pub fn new(name: impl Into<String>, is_active: bool) -> Self {
        Self {
            id: DrugId::new(),
            name: name.into(),
            is_active,
        }
    }

    /// Name for notification text and list rows.
    pub fn display_name(&self) -> &str {
        if self.name.trim().is_empty() {
            UNKNOWN_DRUG_NAME
        } else {
            &self.name
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Alarm
// ─────────────────────────────────────────────────────────────────────────────

/// A wall-clock time of day. Construction clamps into 00:00..=23:59.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AlarmTime {
    hour: u8,
    minute: u8,
}

impl AlarmTime {
    pub fn new(hour: i64, minute: i64) -> Self {
        Self {
            hour: hour.clamp(0, 23) as u8,
            minute: minute.clamp(0, 59) as u8,
        }
    }

    pub fn hour(&self) -> u8 {
        self.hour
    }

    pub fn minute(&self) -> u8 {
        self.minute
    }

    pub fn minutes_from_midnight(&self) -> u32 {
        u32::from(self.hour) * 60 + u32::from(self.minute)
    }

    /// Parse `H:MM` / `HH:MM`. Out-of-range components are clamped.
    pub fn parse(s: &str) -> Option<Self> {
        let (h, m) = s.trim().split_once(':')?;
        Some(Self::new(h.trim().parse().ok()?, m.trim().parse().ok()?))
    }
}

impl fmt::Display for AlarmTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02}:{:02}", self.hour, self.minute)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Alarm {
    pub id: AlarmId,
    pub drug_id: DrugId,
    time: AlarmTime,
}

impl Alarm {
    pub fn new(drug_id: DrugId, time: AlarmTime) -> Self {
        Self {
            id: AlarmId::new(),
            drug_id,
            time,
        }
    }

    pub fn with_id(id: AlarmId, drug_id: DrugId, time: AlarmTime) -> Self {
        Self { id, drug_id, time }
    }

    pub fn time(&self) -> AlarmTime {
        self.time
    }

    pub fn hour(&self) -> u8 {
        self.time.hour
    }

    pub fn minute(&self) -> u8 {
        self.time.minute
    }

    pub fn set_time(&mut self, hour: i64, minute: i64) {
        self.time = AlarmTime::new(hour, minute);
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// DoseEntry
// ─────────────────────────────────────────────────────────────────────────────

/// A logged dose. `date` is always the start of the local day of `timestamp`;
/// the only way to move the timestamp is [`DoseEntry::update_timestamp`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DoseEntry {
    pub id: DoseId,
    pub drug_id: DrugId,
    timestamp: DateTime<Utc>,
    date: DateTime<Utc>,
}

impl DoseEntry {
    pub fn new(drug_id: DrugId, timestamp: DateTime<Utc>, calendar: &Calendar) -> Self {
        Self {
            id: DoseId::new(),
            drug_id,
            timestamp,
            date: calendar.start_of_day(timestamp),
        }
    }

    /// Rebuild from persisted columns without recomputing `date`.
    pub fn from_parts(id: DoseId, drug_id: DrugId, timestamp: DateTime<Utc>, date: DateTime<Utc>) -> Self {
        Self {
            id,
            drug_id,
            timestamp,
            date,
        }
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn date(&self) -> DateTime<Utc> {
        self.date
    }

    pub fn update_timestamp(&mut self, timestamp: DateTime<Utc>, calendar: &Calendar) {
        self.timestamp = timestamp;
        self.date = calendar.start_of_day(timestamp);
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Derived reminder state
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "state", content = "at", rename_all = "snake_case")]
pub enum DueTimestamp {
    Due(DateTime<Utc>),
    Upcoming(DateTime<Utc>),
}

impl DueTimestamp {
    pub fn at(&self) -> DateTime<Utc> {
        match self {
            Self::Due(at) | Self::Upcoming(at) => *at,
        }
    }

    pub fn is_due(&self) -> bool {
        matches!(self, Self::Due(_))
    }
}

/// One not-yet-acknowledged reminder, derived from live notification state.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PendingDosageInfo {
    pub reminder_id: String,
    pub drug_reference_id: Option<DrugId>,
    pub drug_name: String,
    pub due_timestamp: DueTimestamp,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum DelayKind {
    /// Re-arm as a one-shot delayed reminder.
    #[default]
    OneShot,
    /// Restore the alarm's daily recurring request.
    Recurring,
}

/// A delayed reminder kept outside the notification service so it survives restarts.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DelayedReminderRecord {
    pub fire_after: DateTime<Utc>,
    #[serde(rename = "alarmReferenceID")]
    pub alarm_reference_id: AlarmId,
    #[serde(default)]
    pub kind: DelayKind,
}

impl DelayedReminderRecord {
    pub fn one_shot(alarm_reference_id: AlarmId, fire_after: DateTime<Utc>) -> Self {
        Self {
            fire_after,
            alarm_reference_id,
            kind: DelayKind::OneShot,
        }
    }

    pub fn recurring(alarm_reference_id: AlarmId, fire_after: DateTime<Utc>) -> Self {
        Self {
            fire_after,
            alarm_reference_id,
            kind: DelayKind::Recurring,
        }
    }
}
