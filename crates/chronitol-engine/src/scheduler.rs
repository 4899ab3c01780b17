//! Turns persisted alarms into notification requests.
//!
//! Every alarm has at most one daily request, keyed by the alarm id. Drug and
//! alarm lookups go to the gateway each time; a missing row is a logged no-op.
//! Disarm always completes before the matching arm starts.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::Duration;
use tracing::{debug, info, instrument, warn};

use chronitol_core::{Alarm, AlarmId, AlarmTime, Drug, DrugId, PersistenceGateway};

use crate::delayed::DelayedReminderStore;
use crate::error::EngineError;
use crate::notifications::adapter::NotificationAdapter;
use crate::notifications::{delayed_identifier, NotificationContent, ReminderPayload, Trigger, REMINDER_CATEGORY};

pub const REMINDER_BODY: &str = "Be sure to take it soon.";

pub fn reminder_title(drug_name: &str) -> String {
    format!("Time to take {drug_name}!")
}

pub fn snooze_title(drug_name: &str) -> String {
    format!("Have you taken your {drug_name} yet?")
}

fn reminder_content(alarm: &Alarm, drug: &Drug, title: String) -> NotificationContent {
    NotificationContent {
        title,
        body: REMINDER_BODY.to_string(),
        category: REMINDER_CATEGORY.to_string(),
        payload: Some(ReminderPayload {
            alarm_id: alarm.id.clone(),
            drug_id: drug.id.clone(),
            drug_name: drug.display_name().to_string(),
        }),
    }
}

/// One alarm row on the drug edit screen. `id` is `None` for new rows.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AlarmDraft {
    pub id: Option<AlarmId>,
    pub hour: i64,
    pub minute: i64,
}

impl AlarmDraft {
    pub fn new(hour: i64, minute: i64) -> Self {
        Self { id: None, hour, minute }
    }
}

/// The full state of the drug edit screen at save time.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DrugEdit {
    /// `None` creates a new drug.
    pub drug_id: Option<DrugId>,
    pub name: String,
    pub is_active: bool,
    /// Replaces the drug's alarm set.
    pub alarms: Vec<AlarmDraft>,
}

pub struct AlarmScheduler {
    gateway: Arc<dyn PersistenceGateway>,
    notifications: Arc<NotificationAdapter>,
    delayed: Arc<DelayedReminderStore>,
}

impl AlarmScheduler {
    pub fn new(
        gateway: Arc<dyn PersistenceGateway>,
        notifications: Arc<NotificationAdapter>,
        delayed: Arc<DelayedReminderStore>,
    ) -> Self {
        Self {
            gateway,
            notifications,
            delayed,
        }
    }

    /// Resolve an alarm and its drug. `None` when either row is gone.
    async fn resolve(&self, alarm_id: &AlarmId) -> Result<Option<(Alarm, Drug)>, EngineError> {
        let Some(alarm) = self.gateway.alarm(alarm_id).await? else {
            warn!(alarm_id = %alarm_id, "alarm not found");
            return Ok(None);
        };
        let Some(drug) = self.gateway.drug(&alarm.drug_id).await? else {
            warn!(alarm_id = %alarm_id, drug_id = %alarm.drug_id, "drug for alarm not found");
            return Ok(None);
        };
        Ok(Some((alarm, drug)))
    }

    /// Schedule the alarm's daily request. Returns whether a request was
    /// scheduled; inactive drugs and missing rows are not errors.
    #[instrument(skip(self), fields(alarm_id = %alarm_id))]
    pub async fn arm(&self, alarm_id: &AlarmId) -> Result<bool, EngineError> {
        let Some((alarm, drug)) = self.resolve(alarm_id).await? else {
            return Ok(false);
        };
        if !drug.is_active {
            debug!(drug_id = %drug.id, "drug inactive, not arming");
            return Ok(false);
        }

        let content = reminder_content(&alarm, &drug, reminder_title(drug.display_name()));
        self.notifications
            .schedule_recurring_daily(alarm.hour(), alarm.minute(), alarm.id.as_str(), content)
            .await?;
        debug!(drug_id = %drug.id, time = %alarm.time(), "alarm armed");
        Ok(true)
    }

    /// Same as [`arm`](Self::arm); named for the durability sweep.
    pub async fn arm_recurring(&self, alarm_id: &AlarmId) -> Result<bool, EngineError> {
        self.arm(alarm_id).await
    }

    /// Schedule a one-shot `<alarm>:delayed` request `after` from now.
    #[instrument(skip(self), fields(alarm_id = %alarm_id))]
    pub async fn arm_delayed(&self, alarm_id: &AlarmId, after: Duration) -> Result<bool, EngineError> {
        let Some((alarm, drug)) = self.resolve(alarm_id).await? else {
            return Ok(false);
        };
        if !drug.is_active {
            debug!(drug_id = %drug.id, "drug inactive, not arming delayed reminder");
            return Ok(false);
        }

        let content = reminder_content(&alarm, &drug, snooze_title(drug.display_name()));
        let _ = self
            .notifications
            .schedule_one_shot(after, alarm.id.as_str(), content)
            .await?;
        Ok(true)
    }

    /// Cancel the alarm's daily request. Safe to repeat.
    pub async fn disarm(&self, alarm_id: &AlarmId) {
        self.notifications.cancel(alarm_id.as_str()).await;
    }

    /// Cancel the daily request, the delayed variant and every durability record.
    async fn tear_down(&self, alarm_id: &AlarmId) {
        self.disarm(alarm_id).await;
        self.notifications.cancel(&delayed_identifier(alarm_id.as_str())).await;
        match self.delayed.remove_for_alarm(alarm_id).await {
            Ok(0) => {}
            Ok(removed) => debug!(alarm_id = %alarm_id, removed, "delayed records purged"),
            Err(error) => warn!(alarm_id = %alarm_id, %error, "failed to purge delayed records"),
        }
    }

    /// Disarm everything belonging to the drug, then arm its current alarms
    /// if it is active. Returns how many requests were scheduled.
    #[instrument(skip(self), fields(drug_id = %drug_id))]
    pub async fn rearm_all(&self, drug_id: &DrugId) -> Result<usize, EngineError> {
        let alarms = self.gateway.alarms_for_drug(drug_id).await?;

        let mut stale: HashSet<String> = alarms.iter().map(|a| a.id.to_string()).collect();
        for request in self.notifications.list_pending().await {
            let owned = request.payload().is_some_and(|p| &p.drug_id == drug_id);
            if owned && !request.trigger.is_one_shot() {
                let _ = stale.insert(request.id);
            }
        }
        for id in &stale {
            self.notifications.cancel(id).await;
        }

        let Some(drug) = self.gateway.drug(drug_id).await? else {
            warn!("drug not found, nothing to arm");
            return Ok(0);
        };
        if !drug.is_active {
            debug!(disarmed = stale.len(), "drug inactive, alarms left disarmed");
            return Ok(0);
        }

        let mut armed = 0;
        for alarm in &alarms {
            match self.arm(&alarm.id).await {
                Ok(true) => armed += 1,
                Ok(false) => {}
                Err(error) => warn!(alarm_id = %alarm.id, %error, "failed to arm alarm"),
            }
        }
        Ok(armed)
    }

    /// Persist the active flag, then disarm or re-arm the drug's alarms.
    #[instrument(skip(self), fields(drug_id = %drug_id))]
    pub async fn set_drug_active(&self, drug_id: &DrugId, active: bool) -> Result<Drug, EngineError> {
        let mut drug = self
            .gateway
            .drug(drug_id)
            .await?
            .ok_or_else(|| EngineError::not_found("drug", drug_id))?;
        drug.is_active = active;
        self.gateway.update_drug(&drug).await?;
        let armed = self.rearm_all(drug_id).await?;
        info!(active, armed, "drug active flag changed");
        Ok(drug)
    }

    /// Disarm, persist the clamped time, arm. Leaves exactly one live request.
    #[instrument(skip(self), fields(alarm_id = %alarm_id))]
    pub async fn update_alarm_time(&self, alarm_id: &AlarmId, hour: i64, minute: i64) -> Result<Alarm, EngineError> {
        let mut alarm = self
            .gateway
            .alarm(alarm_id)
            .await?
            .ok_or_else(|| EngineError::not_found("alarm", alarm_id))?;

        self.disarm(alarm_id).await;
        alarm.set_time(hour, minute);
        self.gateway.update_alarm(&alarm).await?;
        if let Err(error) = self.arm(alarm_id).await {
            warn!(%error, "failed to re-arm alarm after time change");
        }
        Ok(alarm)
    }

    /// Add an alarm to a drug and arm it.
    #[instrument(skip(self), fields(drug_id = %drug_id))]
    pub async fn add_alarm(&self, drug_id: &DrugId, hour: i64, minute: i64) -> Result<Alarm, EngineError> {
        let alarm = self
            .gateway
            .create_alarm(drug_id, AlarmTime::new(hour, minute))
            .await?;
        if let Err(error) = self.arm(&alarm.id).await {
            warn!(alarm_id = %alarm.id, %error, "failed to arm new alarm");
        }
        Ok(alarm)
    }

    /// Tear down every reminder for the alarm, then delete it.
    #[instrument(skip(self), fields(alarm_id = %alarm_id))]
    pub async fn remove_alarm(&self, alarm_id: &AlarmId) -> Result<(), EngineError> {
        self.tear_down(alarm_id).await;
        self.gateway.delete_alarm(alarm_id).await?;
        info!("alarm removed");
        Ok(())
    }

    /// Tear down every reminder for the drug's alarms, then delete the drug
    /// (alarms and doses cascade).
    #[instrument(skip(self), fields(drug_id = %drug_id))]
    pub async fn delete_drug(&self, drug_id: &DrugId) -> Result<(), EngineError> {
        for alarm in self.gateway.alarms_for_drug(drug_id).await? {
            self.tear_down(&alarm.id).await;
        }
        for request in self.notifications.list_pending().await {
            if request.payload().is_some_and(|p| &p.drug_id == drug_id) {
                self.notifications.cancel(&request.id).await;
            }
        }
        self.gateway.delete_drug(drug_id).await?;
        info!("drug deleted");
        Ok(())
    }

    /// Save the drug edit screen: name, active flag and the full alarm set.
    /// Alarms missing from the edit are removed; then the drug is re-armed.
    #[instrument(skip(self, edit), fields(drug_id = ?edit.drug_id, alarms = edit.alarms.len()))]
    pub async fn save_drug(&self, edit: DrugEdit) -> Result<Drug, EngineError> {
        let drug = match &edit.drug_id {
            Some(id) => {
                let mut drug = self
                    .gateway
                    .drug(id)
                    .await?
                    .ok_or_else(|| EngineError::not_found("drug", id))?;
                drug.name = edit.name.clone();
                drug.is_active = edit.is_active;
                self.gateway.update_drug(&drug).await?;
                drug
            }
            None => self.gateway.create_drug(&edit.name, edit.is_active).await?,
        };

        let existing = self.gateway.alarms_for_drug(&drug.id).await?;
        let kept: HashSet<&AlarmId> = edit.alarms.iter().filter_map(|d| d.id.as_ref()).collect();
        for alarm in existing.iter().filter(|a| !kept.contains(&a.id)) {
            self.tear_down(&alarm.id).await;
            self.gateway.delete_alarm(&alarm.id).await?;
        }

        for draft in &edit.alarms {
            let time = AlarmTime::new(draft.hour, draft.minute);
            match draft.id.as_ref().and_then(|id| existing.iter().find(|a| &a.id == id)) {
                Some(current) if current.time() == time => {}
                Some(current) => {
                    let mut alarm = current.clone();
                    alarm.set_time(draft.hour, draft.minute);
                    self.gateway.update_alarm(&alarm).await?;
                }
                None => {
                    let _ = self.gateway.create_alarm(&drug.id, time).await?;
                }
            }
        }

        let armed = self.rearm_all(&drug.id).await?;
        info!(drug_id = %drug.id, armed, "drug saved");
        Ok(drug)
    }

    /// Bring notification state in line with the store: re-arm every drug
    /// and drop daily requests whose alarm no longer exists.
    #[instrument(skip(self))]
    pub async fn resync_all(&self) -> Result<usize, EngineError> {
        let mut known = HashSet::new();
        let mut armed = 0;
        for drug in self.gateway.all_drugs().await? {
            for alarm in self.gateway.alarms_for_drug(&drug.id).await? {
                let _ = known.insert(alarm.id.to_string());
            }
            armed += self.rearm_all(&drug.id).await?;
        }

        for request in self.notifications.list_pending().await {
            if matches!(request.trigger, Trigger::Daily { .. }) && !known.contains(&request.id) {
                debug!(id = %request.id, "dropping orphaned reminder");
                self.notifications.cancel(&request.id).await;
            }
        }
        info!(armed, "alarms resynced");
        Ok(armed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::Fixture;
    use chronitol_core::DelayedReminderRecord;

    #[tokio::test]
    async fn arm_embeds_drug_name_and_time() {
        let fx = Fixture::new("2026-01-01T07:00:00Z");
        let drug = fx.gateway.create_drug("Aspirin", true).await.unwrap();
        let alarm = fx.scheduler.add_alarm(&drug.id, 8, 0).await.unwrap();

        let request = fx.center.pending_request(alarm.id.as_str()).unwrap();
        assert_eq!(request.trigger, Trigger::Daily { hour: 8, minute: 0 });
        assert_eq!(request.content.title, "Time to take Aspirin!");
        assert_eq!(request.content.body, REMINDER_BODY);
        assert_eq!(request.payload().unwrap().drug_name, "Aspirin");
        assert_eq!(request.payload().unwrap().drug_id, drug.id);
    }

    #[tokio::test]
    async fn arm_then_disarm_leaves_nothing() {
        let fx = Fixture::new("2026-01-01T07:00:00Z");
        let drug = fx.gateway.create_drug("Aspirin", true).await.unwrap();
        for (hour, minute) in [(0, 0), (8, 30), (23, 59)] {
            let alarm = fx.scheduler.add_alarm(&drug.id, hour, minute).await.unwrap();
            fx.scheduler.disarm(&alarm.id).await;
            assert!(!fx.center.pending_ids().contains(&alarm.id.to_string()));
        }
    }

    #[tokio::test]
    async fn disarm_twice_is_same_as_once() {
        let fx = Fixture::new("2026-01-01T07:00:00Z");
        let drug = fx.gateway.create_drug("Aspirin", true).await.unwrap();
        let a = fx.scheduler.add_alarm(&drug.id, 8, 0).await.unwrap();
        let _b = fx.scheduler.add_alarm(&drug.id, 20, 0).await.unwrap();

        fx.scheduler.disarm(&a.id).await;
        let once = fx.center.pending_ids();
        fx.scheduler.disarm(&a.id).await;
        assert_eq!(fx.center.pending_ids(), once);
    }

    #[tokio::test]
    async fn update_time_leaves_exactly_one_request() {
        let fx = Fixture::new("2026-01-01T07:00:00Z");
        let drug = fx.gateway.create_drug("Aspirin", true).await.unwrap();
        let alarm = fx.scheduler.add_alarm(&drug.id, 8, 0).await.unwrap();

        let updated = fx.scheduler.update_alarm_time(&alarm.id, 27, 90).await.unwrap();
        assert_eq!((updated.hour(), updated.minute()), (23, 59));

        let ids = fx.center.pending_ids();
        assert_eq!(ids.iter().filter(|id| *id == alarm.id.as_str()).count(), 1);
        let request = fx.center.pending_request(alarm.id.as_str()).unwrap();
        assert_eq!(request.trigger, Trigger::Daily { hour: 23, minute: 59 });
    }

    #[tokio::test]
    async fn inactive_drug_is_not_armed() {
        let fx = Fixture::new("2026-01-01T07:00:00Z");
        let drug = fx.gateway.create_drug("Paused", false).await.unwrap();
        let alarm = fx.scheduler.add_alarm(&drug.id, 8, 0).await.unwrap();
        assert!(!fx.scheduler.arm(&alarm.id).await.unwrap());
        assert!(fx.center.pending_ids().is_empty());
    }

    #[tokio::test]
    async fn missing_alarm_is_a_no_op() {
        let fx = Fixture::new("2026-01-01T07:00:00Z");
        assert!(!fx.scheduler.arm(&AlarmId::new()).await.unwrap());
        assert!(!fx.scheduler.arm_delayed(&AlarmId::new(), Duration::minutes(5)).await.unwrap());
    }

    #[tokio::test]
    async fn toggling_active_disarms_and_rearms() {
        let fx = Fixture::new("2026-01-01T07:00:00Z");
        let drug = fx.gateway.create_drug("Aspirin", true).await.unwrap();
        let a = fx.scheduler.add_alarm(&drug.id, 8, 0).await.unwrap();
        let b = fx.scheduler.add_alarm(&drug.id, 20, 0).await.unwrap();

        let _ = fx.scheduler.set_drug_active(&drug.id, false).await.unwrap();
        assert!(fx.center.pending_ids().is_empty());

        let _ = fx.scheduler.set_drug_active(&drug.id, true).await.unwrap();
        let mut ids = fx.center.pending_ids();
        ids.sort();
        let mut expected = vec![a.id.to_string(), b.id.to_string()];
        expected.sort();
        assert_eq!(ids, expected);
    }

    #[tokio::test]
    async fn rearm_drops_stale_requests_for_drug() {
        let fx = Fixture::new("2026-01-01T07:00:00Z");
        let drug = fx.gateway.create_drug("Aspirin", true).await.unwrap();
        let alarm = fx.scheduler.add_alarm(&drug.id, 8, 0).await.unwrap();

        // Row vanishes behind the scheduler's back.
        fx.gateway.delete_alarm(&alarm.id).await.unwrap();
        assert_eq!(fx.scheduler.rearm_all(&drug.id).await.unwrap(), 0);
        assert!(fx.center.pending_ids().is_empty());
    }

    #[tokio::test]
    async fn remove_alarm_purges_everything() {
        let fx = Fixture::new("2026-01-01T07:00:00Z");
        let drug = fx.gateway.create_drug("Aspirin", true).await.unwrap();
        let alarm = fx.scheduler.add_alarm(&drug.id, 8, 0).await.unwrap();
        assert!(fx.scheduler.arm_delayed(&alarm.id, Duration::minutes(5)).await.unwrap());
        fx.delayed
            .record(DelayedReminderRecord::one_shot(alarm.id.clone(), fx.clock_now()))
            .await
            .unwrap();

        fx.scheduler.remove_alarm(&alarm.id).await.unwrap();
        assert!(fx.center.pending_ids().is_empty());
        assert!(fx.delayed.all().await.is_empty());
        assert_eq!(fx.gateway.alarm(&alarm.id).await.unwrap(), None);
    }

    #[tokio::test]
    async fn delete_drug_purges_all_alarms() {
        let fx = Fixture::new("2026-01-01T07:00:00Z");
        let drug = fx.gateway.create_drug("Aspirin", true).await.unwrap();
        let alarm = fx.scheduler.add_alarm(&drug.id, 8, 0).await.unwrap();
        fx.delayed.record_delay(&alarm.id, fx.clock_now()).await.unwrap();

        fx.scheduler.delete_drug(&drug.id).await.unwrap();
        assert!(fx.center.pending_ids().is_empty());
        assert!(fx.delayed.all().await.is_empty());
        assert!(fx.gateway.all_drugs().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn save_drug_replaces_alarm_set() {
        let fx = Fixture::new("2026-01-01T07:00:00Z");
        let drug = fx
            .scheduler
            .save_drug(DrugEdit {
                drug_id: None,
                name: "Aspirin".into(),
                is_active: true,
                alarms: vec![AlarmDraft::new(8, 0), AlarmDraft::new(20, 0)],
            })
            .await
            .unwrap();
        let alarms = fx.gateway.alarms_for_drug(&drug.id).await.unwrap();
        assert_eq!(alarms.len(), 2);
        assert_eq!(fx.center.pending_ids().len(), 2);

        // Keep the 08:00 alarm moved to 09:00, drop 20:00, add 13:00.
        let morning = alarms.iter().find(|a| a.hour() == 8).unwrap();
        let _ = fx
            .scheduler
            .save_drug(DrugEdit {
                drug_id: Some(drug.id.clone()),
                name: "Aspirin 81mg".into(),
                is_active: true,
                alarms: vec![
                    AlarmDraft {
                        id: Some(morning.id.clone()),
                        hour: 9,
                        minute: 0,
                    },
                    AlarmDraft::new(13, 0),
                ],
            })
            .await
            .unwrap();

        let alarms = fx.gateway.alarms_for_drug(&drug.id).await.unwrap();
        let times: Vec<String> = alarms.iter().map(|a| a.time().to_string()).collect();
        assert_eq!(times, vec!["09:00", "13:00"]);
        assert!(alarms.iter().any(|a| a.id == morning.id));

        let pending = fx.center.pending_request(morning.id.as_str()).unwrap();
        assert_eq!(pending.content.title, "Time to take Aspirin 81mg!");
        assert_eq!(fx.center.pending_ids().len(), 2);
    }

    #[tokio::test]
    async fn resync_drops_orphans_and_arms_active() {
        let fx = Fixture::new("2026-01-01T07:00:00Z");
        let drug = fx.gateway.create_drug("Aspirin", true).await.unwrap();
        let alarm = fx
            .gateway
            .create_alarm(&drug.id, AlarmTime::new(8, 0))
            .await
            .unwrap();
        fx.adapter
            .schedule_recurring_daily(
                6,
                0,
                "orphan",
                NotificationContent {
                    title: "old".into(),
                    body: "old".into(),
                    category: REMINDER_CATEGORY.into(),
                    payload: None,
                },
            )
            .await
            .unwrap();

        assert_eq!(fx.scheduler.resync_all().await.unwrap(), 1);
        assert_eq!(fx.center.pending_ids(), vec![alarm.id.to_string()]);
    }
}
