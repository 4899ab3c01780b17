//! # chronitol-engine
//!
//! Notification scheduling and reconciliation for dose reminders: the
//! notification adapter, alarm scheduler, action router, dose log,
//! delayed-reminder durability store, periodic task runner and the merge
//! engine behind the dose list. [`ReminderSystem`] wires them together.

pub mod delayed;
pub mod dose_log;
pub mod error;
pub mod merge;
pub mod notifications;
pub mod policy;
pub mod router;
pub mod runner;
pub mod scheduler;
pub mod system;

#[cfg(test)]
mod testing;

pub use delayed::DelayedReminderStore;
pub use dose_log::DoseLog;
pub use error::EngineError;
pub use merge::{
    DoseListItem, DoseListSnapshot, HistoryDose, ItemIdentity, MergeEngine, RefreshScope, Section, SectionKey,
};
pub use notifications::adapter::NotificationAdapter;
pub use notifications::memory::InMemoryNotificationCenter;
pub use notifications::{
    DeliveredNotification, NotificationAction, NotificationCenter, NotificationContent, NotificationRequest,
    NotificationResponse, ReminderPayload, Trigger,
};
pub use policy::ReminderPolicy;
pub use router::ActionRouter;
pub use runner::{PeriodicTaskRunner, TaskAction};
pub use scheduler::{AlarmDraft, AlarmScheduler, DrugEdit};
pub use system::{sweep_delayed, ReminderSystem, DELAYED_SWEEP_TASK};
