use std::time::Duration as StdDuration;

use chrono::Duration;
use chronitol_settings::ChronitolSettings;

/// Timing rules for reminders, resolved from settings.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReminderPolicy {
    /// A scheduled reminder this far in the past (or further) counts as due.
    pub due_window: Duration,
    /// Offered snooze lengths in minutes, ascending.
    pub snooze_choices: Vec<u32>,
    /// Offset past a skipped occurrence before the daily alarm is restored.
    pub skip_grace: Duration,
    pub tick_interval: StdDuration,
    pub sweep_frequency: StdDuration,
}

impl Default for ReminderPolicy {
    fn default() -> Self {
        Self::from_settings(&ChronitolSettings::default())
    }
}

impl ReminderPolicy {
    pub fn from_settings(settings: &ChronitolSettings) -> Self {
        let mut snooze_choices = settings.reminders.snooze_choices_minutes.clone();
        snooze_choices.sort_unstable();
        snooze_choices.dedup();
        Self {
            due_window: Duration::minutes(i64::from(settings.reminders.due_window_minutes)),
            snooze_choices,
            skip_grace: Duration::seconds(i64::from(settings.reminders.skip_grace_seconds)),
            tick_interval: StdDuration::from_secs(settings.runner.tick_interval_secs.max(1)),
            sweep_frequency: StdDuration::from_secs(settings.runner.sweep_frequency_secs),
        }
    }

    /// Used for default taps and dismissals.
    pub fn shortest_snooze(&self) -> u32 {
        self.snooze_choices.first().copied().unwrap_or(5)
    }
}
