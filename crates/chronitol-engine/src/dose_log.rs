//! Writes dose entries and settles the reminders they answer.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, info, instrument, warn};

use chronitol_core::{
    AlarmId, Clock, DelayedReminderRecord, DoseEntry, DoseId, DrugId, DueTimestamp, PendingDosageInfo,
    PersistenceGateway,
};

use crate::delayed::DelayedReminderStore;
use crate::error::EngineError;
use crate::notifications::adapter::NotificationAdapter;
use crate::notifications::{clean_identifier, delayed_identifier};
use crate::policy::ReminderPolicy;

pub struct DoseLog {
    gateway: Arc<dyn PersistenceGateway>,
    notifications: Arc<NotificationAdapter>,
    delayed: Arc<DelayedReminderStore>,
    clock: Arc<dyn Clock>,
    policy: ReminderPolicy,
}

impl DoseLog {
    pub fn new(
        gateway: Arc<dyn PersistenceGateway>,
        notifications: Arc<NotificationAdapter>,
        delayed: Arc<DelayedReminderStore>,
        clock: Arc<dyn Clock>,
        policy: ReminderPolicy,
    ) -> Self {
        Self {
            gateway,
            notifications,
            delayed,
            clock,
            policy,
        }
    }

    /// "Taken" for a reminder identifier: resolve alarm, then drug, and log a
    /// dose at now. An unresolvable reminder logs nothing.
    #[instrument(skip(self))]
    pub async fn record_taken(&self, reminder_id: &str) -> Result<Option<DoseEntry>, EngineError> {
        let alarm_id = AlarmId::from_raw(clean_identifier(reminder_id));
        let Some(alarm) = self.gateway.alarm(&alarm_id).await? else {
            warn!(alarm_id = %alarm_id, "taken for unknown alarm, nothing logged");
            return Ok(None);
        };
        let dose = self.gateway.create_dose(&alarm.drug_id, self.clock.now()).await?;
        info!(alarm_id = %alarm_id, drug_id = %alarm.drug_id, dose_id = %dose.id, "dose taken");
        Ok(Some(dose))
    }

    /// Tap on a pending item. Due items log a dose and clear their
    /// notification; upcoming items are left alone.
    #[instrument(skip(self, info), fields(reminder_id = %info.reminder_id))]
    pub async fn take_pending(&self, info: &PendingDosageInfo) -> Result<Option<DoseEntry>, EngineError> {
        if !info.due_timestamp.is_due() {
            debug!("upcoming item tapped, ignoring");
            return Ok(None);
        }
        let Some(drug_id) = &info.drug_reference_id else {
            warn!("due item has no drug reference, nothing logged");
            return Ok(None);
        };

        let dose = self.gateway.create_dose(drug_id, self.clock.now()).await?;
        self.settle(&info.reminder_id).await;
        info!(drug_id = %drug_id, dose_id = %dose.id, "pending dose taken");
        Ok(Some(dose))
    }

    /// Skip a pending item. A due item is just cleared. An upcoming daily
    /// reminder is cancelled and a record restores it after the skipped
    /// occurrence.
    #[instrument(skip(self, info), fields(reminder_id = %info.reminder_id))]
    pub async fn skip_pending(&self, info: &PendingDosageInfo) -> Result<(), EngineError> {
        match info.due_timestamp {
            DueTimestamp::Due(_) => self.settle(&info.reminder_id).await,
            DueTimestamp::Upcoming(_) if is_delayed(&info.reminder_id) => self.settle(&info.reminder_id).await,
            DueTimestamp::Upcoming(at) => {
                let alarm_id = AlarmId::from_raw(clean_identifier(&info.reminder_id));
                self.notifications.cancel(alarm_id.as_str()).await;
                let resume_at = at + self.policy.skip_grace;
                self.delayed
                    .record(DelayedReminderRecord::recurring(alarm_id.clone(), resume_at))
                    .await?;
                info!(alarm_id = %alarm_id, %resume_at, "upcoming dose skipped");
            }
        }
        Ok(())
    }

    /// Clear whatever represents the reminder: the delivered daily
    /// notification, or the delayed request and its one-shot records.
    async fn settle(&self, reminder_id: &str) {
        if !is_delayed(reminder_id) {
            self.notifications.resolve_delivered(reminder_id).await;
            return;
        }

        self.notifications.cancel(reminder_id).await;
        let alarm_id = AlarmId::from_raw(clean_identifier(reminder_id));
        if let Err(error) = self.delayed.remove_one_shots(&alarm_id).await {
            warn!(alarm_id = %alarm_id, %error, "failed to remove delayed records");
        }
    }

    /// Manual entry from the history screen.
    #[instrument(skip(self), fields(drug_id = %drug_id))]
    pub async fn log_dose(&self, drug_id: &DrugId, at: DateTime<Utc>) -> Result<DoseEntry, EngineError> {
        if self.gateway.drug(drug_id).await?.is_none() {
            return Err(EngineError::not_found("drug", drug_id));
        }
        Ok(self.gateway.create_dose(drug_id, at).await?)
    }

    #[instrument(skip(self), fields(dose_id = %dose_id))]
    pub async fn update_dose_time(&self, dose_id: &DoseId, at: DateTime<Utc>) -> Result<DoseEntry, EngineError> {
        Ok(self.gateway.update_dose_timestamp(dose_id, at).await?)
    }

    #[instrument(skip(self), fields(dose_id = %dose_id))]
    pub async fn delete_dose(&self, dose_id: &DoseId) -> Result<(), EngineError> {
        Ok(self.gateway.delete_dose(dose_id).await?)
    }
}

fn is_delayed(reminder_id: &str) -> bool {
    reminder_id == delayed_identifier(reminder_id)
}
