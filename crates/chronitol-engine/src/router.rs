//! Dispatches user actions on delivered reminders.

use std::sync::Arc;

use chrono::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use chronitol_core::{AlarmId, Calendar, Clock};

use crate::delayed::DelayedReminderStore;
use crate::dose_log::DoseLog;
use crate::error::EngineError;
use crate::notifications::adapter::NotificationAdapter;
use crate::notifications::{clean_identifier, NotificationAction, NotificationResponse};
use crate::policy::ReminderPolicy;
use crate::scheduler::snooze_title;

pub struct ActionRouter {
    notifications: Arc<NotificationAdapter>,
    delayed: Arc<DelayedReminderStore>,
    dose_log: Arc<DoseLog>,
    clock: Arc<dyn Clock>,
    calendar: Calendar,
    policy: ReminderPolicy,
}

impl ActionRouter {
    pub fn new(
        notifications: Arc<NotificationAdapter>,
        delayed: Arc<DelayedReminderStore>,
        dose_log: Arc<DoseLog>,
        clock: Arc<dyn Clock>,
        calendar: Calendar,
        policy: ReminderPolicy,
    ) -> Self {
        Self {
            notifications,
            delayed,
            dose_log,
            clock,
            calendar,
            policy,
        }
    }

    #[instrument(skip(self, response), fields(id = %response.notification.request.id, action = %response.action.identifier()))]
    pub async fn handle(&self, response: &NotificationResponse) -> Result<(), EngineError> {
        let request = &response.notification.request;
        let one_shot = request.trigger.is_one_shot();
        let clean = clean_identifier(&request.id);
        if one_shot {
            self.notifications.cancel(&request.id).await;
            let alarm_id = AlarmId::from_raw(clean);
            if let Err(error) = self.delayed.remove_one_shots(&alarm_id).await {
                warn!(alarm_id = %alarm_id, %error, "failed to remove delayed records");
            }
        }

        match response.action {
            NotificationAction::Snooze(minutes) => {
                self.settle(&request.id, one_shot).await;
                self.snooze(response, clean, minutes).await
            }
            NotificationAction::DefaultTap | NotificationAction::Dismissed => {
                self.settle(&request.id, one_shot).await;
                self.snooze(response, clean, self.policy.shortest_snooze()).await
            }
            NotificationAction::TakenNow => {
                if let Err(error) = self.dose_log.record_taken(clean).await {
                    warn!(%error, "failed to log taken dose");
                }
                self.settle(&request.id, one_shot).await;
                Ok(())
            }
            NotificationAction::Ignored => {
                self.settle(&request.id, one_shot).await;
                debug!("reminder ignored");
                Ok(())
            }
        }
    }

    /// One-shot requests were already cancelled outright, along with their
    /// durability records.
    async fn settle(&self, id: &str, one_shot: bool) {
        if !one_shot {
            self.notifications.resolve_delivered(id).await;
        }
    }

    /// Re-deliver as `<clean>:delayed` after `minutes`. A durability record
    /// backs the request when scheduling fails or the fire time is on a
    /// later day.
    async fn snooze(&self, response: &NotificationResponse, clean: &str, minutes: u32) -> Result<(), EngineError> {
        if !self.policy.snooze_choices.contains(&minutes) {
            debug!(minutes, "snooze length outside configured choices");
        }
        let now = self.clock.now();
        let delay = Duration::minutes(i64::from(minutes.max(1)));
        let fire_at = now + delay;

        let mut content = response.notification.request.content.clone();
        if let Some(payload) = &content.payload {
            content.title = snooze_title(&payload.drug_name);
        }

        let scheduled = self.notifications.schedule_one_shot(delay, clean, content).await;
        let crosses_day = !self.calendar.same_day(now, fire_at);
        let needs_record = match &scheduled {
            Ok(_) => crosses_day,
            Err(e) => !e.is_authorization(),
        };

        if needs_record {
            let alarm_id = AlarmId::from_raw(clean);
            if let Err(error) = self.delayed.record_delay(&alarm_id, fire_at).await {
                warn!(alarm_id = %alarm_id, %error, "failed to persist delayed reminder");
            }
        }
        info!(minutes, %fire_at, persisted = needs_record, "reminder snoozed");
        Ok(())
    }

    /// Drain the action stream until it closes or `cancel` fires.
    pub fn spawn(
        self: Arc<Self>,
        mut actions: mpsc::UnboundedReceiver<NotificationResponse>,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    next = actions.recv() => match next {
                        Some(response) => {
                            if let Err(error) = self.handle(&response).await {
                                warn!(%error, "failed to handle notification action");
                            }
                        }
                        None => break,
                    },
                    () = cancel.cancelled() => break,
                }
            }
            debug!("action router stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notifications::{delayed_identifier, Trigger};
    use crate::testing::{utc, Fixture};
    use chronitol_core::{AlarmTime, DrugId, PersistenceGateway};

    async fn delivered_reminder(fx: &Fixture, name: &str) -> (DrugId, AlarmId, NotificationResponse) {
        let drug = fx.gateway.create_drug(name, true).await.unwrap();
        let alarm = fx
            .gateway
            .create_alarm(&drug.id, AlarmTime::new(8, 0))
            .await
            .unwrap();
        assert!(fx.scheduler.arm(&alarm.id).await.unwrap());
        let notification = fx.center.deliver_now(alarm.id.as_str()).unwrap();
        (
            drug.id,
            alarm.id,
            NotificationResponse {
                notification,
                action: NotificationAction::Ignored,
            },
        )
    }

    #[tokio::test]
    async fn snooze_schedules_delayed_copy() {
        let fx = Fixture::new("2026-01-01T08:00:00Z");
        let (_, alarm_id, mut response) = delivered_reminder(&fx, "Aspirin").await;
        response.action = NotificationAction::Snooze(15);

        fx.router.handle(&response).await.unwrap();

        let delayed = fx.center.pending_request(&delayed_identifier(alarm_id.as_str())).unwrap();
        assert!(matches!(delayed.trigger, Trigger::Interval { seconds: 900, .. }));
        assert_eq!(delayed.content.title, "Have you taken your Aspirin yet?");
        assert_eq!(delayed.payload().unwrap().drug_name, "Aspirin");
        assert!(fx.center.delivered_ids().is_empty());
        // Same-day snooze needs no durability record.
        assert!(fx.delayed.all().await.is_empty());
    }

    #[tokio::test]
    async fn snoozing_a_snooze_keeps_clean_identifier() {
        let fx = Fixture::new("2026-01-01T08:00:00Z");
        let (_, alarm_id, mut response) = delivered_reminder(&fx, "Aspirin").await;
        response.action = NotificationAction::Snooze(5);
        fx.router.handle(&response).await.unwrap();

        fx.clock.advance(Duration::minutes(5));
        let redelivered = fx.center.deliver_due();
        let snoozed = redelivered
            .into_iter()
            .find(|d| d.request.id == delayed_identifier(alarm_id.as_str()))
            .unwrap();
        assert_eq!(clean_identifier(&snoozed.request.id), alarm_id.as_str());

        fx.router
            .handle(&NotificationResponse {
                notification: snoozed,
                action: NotificationAction::Snooze(5),
            })
            .await
            .unwrap();
        let ids = fx.center.pending_ids();
        assert_eq!(ids.iter().filter(|id| id.ends_with(":delayed")).count(), 1);
        assert!(ids.contains(&format!("{alarm_id}:delayed")));
    }

    #[tokio::test]
    async fn snooze_past_midnight_is_persisted() {
        let fx = Fixture::new("2026-01-01T23:50:00Z");
        let (_, alarm_id, mut response) = delivered_reminder(&fx, "Aspirin").await;
        response.action = NotificationAction::Snooze(15);
        fx.router.handle(&response).await.unwrap();

        let records = fx.delayed.all().await;
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].alarm_reference_id, alarm_id);
        assert_eq!(records[0].fire_after, utc("2026-01-02T00:05:00Z"));
    }

    #[tokio::test]
    async fn answering_overnight_snooze_drops_its_record() {
        let fx = Fixture::new("2026-01-01T23:50:00Z");
        let (_, alarm_id, mut response) = delivered_reminder(&fx, "Aspirin").await;
        response.action = NotificationAction::Snooze(15);
        fx.router.handle(&response).await.unwrap();
        assert_eq!(fx.delayed.all().await.len(), 1);

        fx.clock.set(utc("2026-01-02T00:05:00Z"));
        let snoozed = fx
            .center
            .deliver_due()
            .into_iter()
            .find(|d| d.request.id == delayed_identifier(alarm_id.as_str()))
            .unwrap();
        fx.router
            .handle(&NotificationResponse {
                notification: snoozed,
                action: NotificationAction::TakenNow,
            })
            .await
            .unwrap();

        assert!(fx.delayed.all().await.is_empty());
        assert_eq!(fx.center.pending_ids(), vec![alarm_id.to_string()]);
        assert_eq!(fx.gateway.dose_history().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn resnoozing_overnight_snooze_replaces_its_record() {
        let fx = Fixture::new("2026-01-01T23:50:00Z");
        let (_, alarm_id, mut response) = delivered_reminder(&fx, "Aspirin").await;
        response.action = NotificationAction::Snooze(15);
        fx.router.handle(&response).await.unwrap();

        fx.clock.set(utc("2026-01-01T23:58:00Z"));
        let snoozed = fx.center.deliver_now(&delayed_identifier(alarm_id.as_str())).unwrap();
        fx.router
            .handle(&NotificationResponse {
                notification: snoozed,
                action: NotificationAction::Snooze(15),
            })
            .await
            .unwrap();

        let records = fx.delayed.all().await;
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].fire_after, utc("2026-01-02T00:13:00Z"));
    }

    #[tokio::test]
    async fn taken_settles_even_when_logging_fails() {
        let fx = Fixture::new("2026-01-01T08:03:00Z");
        let (_, alarm_id, mut response) = delivered_reminder(&fx, "Aspirin").await;
        fx.gateway
            .database()
            .with_conn(|conn| Ok(conn.execute_batch("DROP TABLE dose_entries")?))
            .unwrap();
        response.action = NotificationAction::TakenNow;

        fx.router.handle(&response).await.unwrap();
        assert!(fx.center.delivered_ids().is_empty());
        assert_eq!(fx.center.pending_ids(), vec![alarm_id.to_string()]);
    }

    #[tokio::test]
    async fn failed_snooze_is_persisted() {
        let fx = Fixture::new("2026-01-01T08:00:00Z");
        let (_, alarm_id, mut response) = delivered_reminder(&fx, "Aspirin").await;
        fx.center.set_fail_adds(true);
        response.action = NotificationAction::Snooze(30);
        fx.router.handle(&response).await.unwrap();

        let records = fx.delayed.all().await;
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].alarm_reference_id, alarm_id);
        assert_eq!(records[0].fire_after, utc("2026-01-01T08:30:00Z"));
    }

    #[tokio::test]
    async fn default_tap_uses_shortest_snooze() {
        let fx = Fixture::new("2026-01-01T08:00:00Z");
        let (_, alarm_id, mut response) = delivered_reminder(&fx, "Aspirin").await;
        response.action = NotificationAction::DefaultTap;
        fx.router.handle(&response).await.unwrap();

        let delayed = fx.center.pending_request(&delayed_identifier(alarm_id.as_str())).unwrap();
        assert!(matches!(delayed.trigger, Trigger::Interval { seconds: 300, .. }));
    }

    #[tokio::test]
    async fn taken_logs_dose_and_keeps_daily_request() {
        let fx = Fixture::new("2026-01-01T08:03:00Z");
        let (drug_id, alarm_id, mut response) = delivered_reminder(&fx, "Aspirin").await;
        response.action = NotificationAction::TakenNow;
        fx.router.handle(&response).await.unwrap();

        let history = fx.gateway.dose_history().await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].drug_id, drug_id);
        assert_eq!(history[0].timestamp(), utc("2026-01-01T08:03:00Z"));
        assert!(fx.center.delivered_ids().is_empty());
        assert_eq!(fx.center.pending_ids(), vec![alarm_id.to_string()]);
    }

    #[tokio::test]
    async fn ignored_only_clears_delivery() {
        let fx = Fixture::new("2026-01-01T08:00:00Z");
        let (_, alarm_id, response) = delivered_reminder(&fx, "Aspirin").await;
        fx.router.handle(&response).await.unwrap();

        assert!(fx.center.delivered_ids().is_empty());
        assert_eq!(fx.center.pending_ids(), vec![alarm_id.to_string()]);
        assert!(fx.gateway.dose_history().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn spawned_loop_handles_submitted_actions() {
        let fx = Fixture::new("2026-01-01T08:00:00Z");
        let (_, _, mut response) = delivered_reminder(&fx, "Aspirin").await;
        response.action = NotificationAction::TakenNow;

        let cancel = CancellationToken::new();
        let stream = fx.adapter.take_action_stream().unwrap();
        let handle = fx.router.clone().spawn(stream, cancel.clone());
        fx.adapter.submit_action(response);

        for _ in 0..50 {
            if !fx.gateway.dose_history().await.unwrap().is_empty() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert_eq!(fx.gateway.dose_history().await.unwrap().len(), 1);

        cancel.cancel();
        handle.await.unwrap();
    }
}
