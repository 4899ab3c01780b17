//! Notification requests, user actions, and the OS notification service seam.

pub mod adapter;
pub mod memory;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use chronitol_core::{AlarmId, Calendar, DrugId, NotificationError};

/// Suffix marking a snoozed reminder's identifier.
pub const DELAYED_SUFFIX: &str = "delayed";

/// Category shared by all dose reminders; carries the snooze/taken/ignore actions.
pub const REMINDER_CATEGORY: &str = "drugNotification";

/// Longest one-shot delay a trigger will carry (one year).
const MAX_INTERVAL_SECS: u64 = 366 * 24 * 60 * 60;

/// The alarm identity behind a notification identifier: everything before the first `:`.
pub fn clean_identifier(id: &str) -> &str {
    id.split_once(':').map_or(id, |(head, _)| head)
}

/// `<alarm id>:delayed`. Idempotent on already-delayed identifiers.
pub fn delayed_identifier(id: &str) -> String {
    format!("{}:{DELAYED_SUFFIX}", clean_identifier(id))
}

/// Data embedded in every reminder so actions can be routed without a lookup.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReminderPayload {
    pub alarm_id: AlarmId,
    pub drug_id: DrugId,
    pub drug_name: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationContent {
    pub title: String,
    pub body: String,
    pub category: String,
    pub payload: Option<ReminderPayload>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Trigger {
    /// Fires every day at the given wall-clock time.
    Daily { hour: u8, minute: u8 },
    /// Fires once, `seconds` after `armed_at`.
    Interval { seconds: u64, armed_at: DateTime<Utc> },
}

impl Trigger {
    pub fn is_one_shot(&self) -> bool {
        matches!(self, Self::Interval { .. })
    }

    /// When this trigger fires next, as seen at `now`. One-shot triggers
    /// report their fixed fire time even once it has passed.
    pub fn next_fire(&self, now: DateTime<Utc>, calendar: &Calendar) -> DateTime<Utc> {
        match self {
            Self::Daily { hour, minute } => calendar.next_occurrence(*hour, *minute, now),
            Self::Interval { seconds, armed_at } => {
                let seconds = (*seconds).min(MAX_INTERVAL_SECS) as i64;
                *armed_at + Duration::seconds(seconds)
            }
        }
    }
}

impl std::fmt::Display for Trigger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Daily { hour, minute } => write!(f, "daily at {hour:02}:{minute:02}"),
            Self::Interval { seconds, .. } => write!(f, "once in {seconds}s"),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationRequest {
    pub id: String,
    pub content: NotificationContent,
    pub trigger: Trigger,
}

impl NotificationRequest {
    pub fn payload(&self) -> Option<&ReminderPayload> {
        self.content.payload.as_ref()
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveredNotification {
    pub request: NotificationRequest,
    pub delivered_at: DateTime<Utc>,
}

/// What the user did with a delivered reminder.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "action", content = "minutes", rename_all = "snake_case")]
pub enum NotificationAction {
    Snooze(u32),
    TakenNow,
    Ignored,
    /// Tapped the notification body.
    DefaultTap,
    /// Swiped the notification away.
    Dismissed,
}

impl NotificationAction {
    /// Action-button identifier as registered with the notification service.
    pub fn identifier(&self) -> String {
        match self {
            Self::Snooze(minutes) => format!("remind{minutes}"),
            Self::TakenNow => "dosageTaken".to_string(),
            Self::Ignored => "dosageIgnored".to_string(),
            Self::DefaultTap => "default".to_string(),
            Self::Dismissed => "dismiss".to_string(),
        }
    }

    pub fn from_identifier(id: &str) -> Option<Self> {
        match id {
            "dosageTaken" => Some(Self::TakenNow),
            "dosageIgnored" => Some(Self::Ignored),
            "default" => Some(Self::DefaultTap),
            "dismiss" => Some(Self::Dismissed),
            other => other
                .strip_prefix("remind")
                .and_then(|m| m.parse::<u32>().ok())
                .filter(|m| *m > 0)
                .map(Self::Snooze),
        }
    }

    /// Button title shown on the notification.
    pub fn label(&self) -> String {
        match self {
            Self::Snooze(minutes) => format!("Remind me in {minutes} minutes"),
            Self::TakenNow => "I'm taking it now!".to_string(),
            Self::Ignored => "Ignore this dose".to_string(),
            Self::DefaultTap => "Open".to_string(),
            Self::Dismissed => "Dismiss".to_string(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NotificationResponse {
    pub notification: DeliveredNotification,
    pub action: NotificationAction,
}

/// The platform notification service.
///
/// Adding a request whose id matches an existing pending request replaces it.
#[async_trait]
pub trait NotificationCenter: Send + Sync {
    /// `Ok(false)` means the user declined.
    async fn request_authorization(&self) -> Result<bool, NotificationError>;
    async fn add(&self, request: NotificationRequest) -> Result<(), NotificationError>;
    async fn remove_pending(&self, ids: &[String]);
    async fn remove_delivered(&self, ids: &[String]);
    async fn remove_all_pending(&self);
    async fn remove_all_delivered(&self);
    async fn pending(&self) -> Vec<NotificationRequest>;
    async fn delivered(&self) -> Vec<DeliveredNotification>;
}
