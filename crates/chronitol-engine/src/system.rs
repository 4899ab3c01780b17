//! Composition root: builds every service once and drives the app lifecycle.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::Duration;
use futures::FutureExt;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use chronitol_core::{AlarmId, Calendar, Clock, DelayKind, PersistenceGateway};
use chronitol_settings::ChronitolSettings;
use chronitol_store::{backup, ImportSummary, SqliteGateway};

use crate::delayed::DelayedReminderStore;
use crate::dose_log::DoseLog;
use crate::error::EngineError;
use crate::merge::{DoseListSnapshot, MergeEngine, RefreshScope};
use crate::notifications::adapter::NotificationAdapter;
use crate::notifications::{delayed_identifier, NotificationCenter, NotificationResponse};
use crate::policy::ReminderPolicy;
use crate::router::ActionRouter;
use crate::runner::{PeriodicTaskRunner, TaskAction};
use crate::scheduler::AlarmScheduler;

pub const DELAYED_SWEEP_TASK: &str = "delayed-reminder-sweep";

const SHUTDOWN_TIMEOUT: StdDuration = StdDuration::from_secs(5);

/// Re-arm every due durability record, removing each one after the attempt.
/// A record whose reminder is already pending or delivered is dropped
/// without re-arming. Stops between records once `cancel` fires; the rest
/// wait for the next run.
pub async fn sweep_delayed(
    scheduler: &AlarmScheduler,
    notifications: &NotificationAdapter,
    delayed: &DelayedReminderStore,
    clock: &dyn Clock,
    cancel: &CancellationToken,
) -> usize {
    let due = delayed.due(clock.now()).await;
    if due.is_empty() {
        return 0;
    }

    let mut live: HashSet<String> = notifications
        .list_pending()
        .await
        .into_iter()
        .map(|r| r.id)
        .chain(notifications.list_delivered().await.into_iter().map(|d| d.request.id))
        .collect();

    let mut armed = 0;
    for record in due {
        if cancel.is_cancelled() {
            debug!("delayed sweep cancelled");
            break;
        }
        let alarm_id = &record.alarm_reference_id;
        let reminder_id = match record.kind {
            DelayKind::OneShot => delayed_identifier(alarm_id.as_str()),
            DelayKind::Recurring => alarm_id.to_string(),
        };
        if live.contains(&reminder_id) {
            debug!(%reminder_id, "reminder already live, discarding delayed record");
        } else {
            let outcome = match record.kind {
                DelayKind::OneShot => scheduler.arm_delayed(alarm_id, Duration::seconds(1)).await,
                DelayKind::Recurring => scheduler.arm_recurring(alarm_id).await,
            };
            match outcome {
                Ok(true) => {
                    armed += 1;
                    let _ = live.insert(reminder_id);
                }
                Ok(false) => debug!(alarm_id = %alarm_id, "delayed record could not be re-armed, discarding"),
                Err(error) => warn!(alarm_id = %alarm_id, %error, "failed to re-arm delayed record"),
            }
        }
        if let Err(error) = delayed.remove(&record).await {
            warn!(alarm_id = %alarm_id, %error, "failed to remove delayed record");
        }
    }
    info!(armed, "delayed sweep finished");
    armed
}

pub struct ReminderSystem {
    gateway: Arc<dyn PersistenceGateway>,
    notifications: Arc<NotificationAdapter>,
    delayed: Arc<DelayedReminderStore>,
    scheduler: Arc<AlarmScheduler>,
    dose_log: Arc<DoseLog>,
    router: Arc<ActionRouter>,
    merge: Arc<MergeEngine>,
    runner: PeriodicTaskRunner,
    clock: Arc<dyn Clock>,
    policy: ReminderPolicy,
    shutdown: CancellationToken,
    handles: Mutex<Vec<JoinHandle<()>>>,
    launched: AtomicBool,
}

impl ReminderSystem {
    pub fn new(
        policy: ReminderPolicy,
        gateway: Arc<dyn PersistenceGateway>,
        center: Arc<dyn NotificationCenter>,
        clock: Arc<dyn Clock>,
        delayed: DelayedReminderStore,
    ) -> Self {
        let calendar = gateway.calendar();
        let delayed = Arc::new(delayed);
        let notifications = Arc::new(NotificationAdapter::new(center, clock.clone()));
        let scheduler = Arc::new(AlarmScheduler::new(gateway.clone(), notifications.clone(), delayed.clone()));
        let dose_log = Arc::new(DoseLog::new(
            gateway.clone(),
            notifications.clone(),
            delayed.clone(),
            clock.clone(),
            policy.clone(),
        ));
        let router = Arc::new(ActionRouter::new(
            notifications.clone(),
            delayed.clone(),
            dose_log.clone(),
            clock.clone(),
            calendar,
            policy.clone(),
        ));
        let merge = Arc::new(MergeEngine::new(
            gateway.clone(),
            notifications.clone(),
            delayed.clone(),
            clock.clone(),
            &policy,
        ));

        Self {
            gateway,
            notifications,
            delayed,
            scheduler,
            dose_log,
            router,
            merge,
            runner: PeriodicTaskRunner::new(policy.tick_interval),
            clock,
            policy,
            shutdown: CancellationToken::new(),
            handles: Mutex::new(Vec::new()),
            launched: AtomicBool::new(false),
        }
    }

    /// Open the SQLite store and the delayed-reminder file named by `settings`.
    pub async fn open(
        settings: &ChronitolSettings,
        center: Arc<dyn NotificationCenter>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, EngineError> {
        let calendar = Calendar::from_name(settings.calendar.time_zone.as_deref())?;
        tokio::fs::create_dir_all(&settings.storage.data_dir).await?;
        let gateway = SqliteGateway::open(&settings.storage.database_path(), calendar)?;
        let delayed = DelayedReminderStore::open(settings.storage.delayed_reminders_path()).await?;
        info!(data_dir = %settings.storage.data_dir, ?calendar, "reminder system opened");
        Ok(Self::new(
            ReminderPolicy::from_settings(settings),
            Arc::new(gateway),
            center,
            clock,
            delayed,
        ))
    }

    pub fn gateway(&self) -> &Arc<dyn PersistenceGateway> {
        &self.gateway
    }

    pub fn notifications(&self) -> &Arc<NotificationAdapter> {
        &self.notifications
    }

    pub fn scheduler(&self) -> &Arc<AlarmScheduler> {
        &self.scheduler
    }

    pub fn dose_log(&self) -> &Arc<DoseLog> {
        &self.dose_log
    }

    pub fn merge(&self) -> &Arc<MergeEngine> {
        &self.merge
    }

    pub fn delayed(&self) -> &Arc<DelayedReminderStore> {
        &self.delayed
    }

    pub fn runner(&self) -> &PeriodicTaskRunner {
        &self.runner
    }

    pub fn policy(&self) -> &ReminderPolicy {
        &self.policy
    }

    /// App start: authorize, resync alarms, start the sweep, the merge
    /// listener and the action router, then compute the first snapshot.
    /// Repeat calls are no-ops.
    #[instrument(skip(self))]
    pub async fn launch(&self) -> Result<Arc<DoseListSnapshot>, EngineError> {
        if self.launched.swap(true, Ordering::SeqCst) {
            debug!("already launched");
            return Ok(self.merge.snapshot());
        }

        let authorized = self.notifications.ensure_authorized().await;
        match self.scheduler.resync_all().await {
            Ok(armed) => debug!(armed, authorized, "alarms resynced at launch"),
            Err(error) => warn!(%error, "alarm resync failed at launch"),
        }

        self.runner
            .register(DELAYED_SWEEP_TASK, self.policy.sweep_frequency, self.sweep_action());
        let _ = self.runner.start();

        {
            let mut handles = self.handles.lock();
            handles.push(self.merge.clone().spawn_listener(
                self.notifications.subscribe(),
                self.gateway.subscribe(),
                self.shutdown.child_token(),
            ));
            if let Some(actions) = self.notifications.take_action_stream() {
                handles.push(self.router.clone().spawn(actions, self.shutdown.child_token()));
            }
        }

        let snapshot = self.merge.refresh(RefreshScope::All).await?;
        info!(generation = snapshot.generation(), "reminder system launched");
        Ok(snapshot)
    }

    fn sweep_action(&self) -> TaskAction {
        let scheduler = self.scheduler.clone();
        let notifications = self.notifications.clone();
        let delayed = self.delayed.clone();
        let clock = self.clock.clone();
        Arc::new(move |cancel: CancellationToken| {
            let scheduler = scheduler.clone();
            let notifications = notifications.clone();
            let delayed = delayed.clone();
            let clock = clock.clone();
            async move {
                let _ = sweep_delayed(&scheduler, &notifications, &delayed, clock.as_ref(), &cancel).await;
            }
            .boxed()
        })
    }

    /// Run the delayed sweep immediately.
    pub async fn sweep_now(&self) -> usize {
        sweep_delayed(
            &self.scheduler,
            &self.notifications,
            &self.delayed,
            self.clock.as_ref(),
            &self.shutdown,
        )
        .await
    }

    /// App returned to the foreground: recompute everything once, picking up
    /// reminders that crossed into the due window with no event.
    pub async fn foreground(&self) -> Result<Arc<DoseListSnapshot>, EngineError> {
        self.merge.refresh(RefreshScope::All).await
    }

    pub async fn handle_response(&self, response: &NotificationResponse) -> Result<(), EngineError> {
        self.router.handle(response).await
    }

    /// A "taken" signal from outside a notification action.
    pub async fn dose_taken(&self, reminder_id: &str) -> Result<(), EngineError> {
        let _ = self.dose_log.record_taken(reminder_id).await?;
        self.notifications.resolve_delivered(reminder_id).await;
        Ok(())
    }

    pub async fn alarm_deleted(&self, alarm_id: &AlarmId) -> Result<(), EngineError> {
        self.scheduler.remove_alarm(alarm_id).await
    }

    pub async fn export_backup(&self) -> Result<String, EngineError> {
        let drugs = backup::export(self.gateway.as_ref()).await?;
        Ok(backup::to_json(&drugs)?)
    }

    /// Import a backup file. With `reset`, the store, durability records and
    /// every notification are cleared first. Imported alarms of active drugs
    /// are armed; imported doses schedule nothing.
    #[instrument(skip(self, data))]
    pub async fn import_backup(&self, data: &str, reset: bool) -> Result<ImportSummary, EngineError> {
        let drugs = backup::from_json(data)?;

        if reset {
            self.notifications.cancel_all().await;
            self.delayed.clear().await?;
            self.gateway.delete_all().await?;
            info!("store reset before import");
        }

        let summary = backup::import(self.gateway.as_ref(), &drugs).await?;
        for alarm_id in &summary.alarms {
            if let Err(error) = self.scheduler.arm(alarm_id).await {
                warn!(alarm_id = %alarm_id, %error, "failed to arm imported alarm");
            }
        }
        let _ = self.merge.refresh(RefreshScope::All).await?;
        Ok(summary)
    }

    /// Stop the runner and every background loop, waiting a bounded time.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let mut handles: Vec<JoinHandle<()>> = self.handles.lock().drain(..).collect();
        if let Some(runner) = self.runner.stop() {
            handles.push(runner);
        }
        info!(task_count = handles.len(), "waiting for background tasks");

        let drain = futures::future::join_all(handles);
        if tokio::time::timeout(SHUTDOWN_TIMEOUT, drain).await.is_err() {
            warn!("shutdown timed out after {SHUTDOWN_TIMEOUT:?}, some tasks may still be running");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notifications::memory::InMemoryNotificationCenter;
    use crate::notifications::NotificationAction;
    use crate::testing::utc;
    use chronitol_core::{AlarmTime, DelayedReminderRecord, ManualClock};

    struct Harness {
        system: ReminderSystem,
        center: Arc<InMemoryNotificationCenter>,
        clock: Arc<ManualClock>,
    }

    fn harness(start: &str) -> Harness {
        let calendar = Calendar::Zone(chrono_tz::UTC);
        let clock = Arc::new(ManualClock::new(utc(start)));
        let center = Arc::new(InMemoryNotificationCenter::new(calendar, clock.clone()));
        let gateway = Arc::new(SqliteGateway::in_memory(calendar).unwrap());
        let system = ReminderSystem::new(
            ReminderPolicy::default(),
            gateway,
            center.clone(),
            clock.clone(),
            DelayedReminderStore::in_memory(),
        );
        Harness { system, center, clock }
    }

    #[tokio::test]
    async fn launch_resyncs_and_is_idempotent() {
        let h = harness("2026-01-01T07:00:00Z");
        let drug = h.system.gateway().create_drug("Aspirin", true).await.unwrap();
        let alarm = h
            .system
            .gateway()
            .create_alarm(&drug.id, AlarmTime::new(8, 0))
            .await
            .unwrap();

        let snapshot = h.system.launch().await.unwrap();
        assert_eq!(h.center.pending_ids(), vec![alarm.id.to_string()]);
        assert_eq!(snapshot.pending().len(), 1);
        assert!(h.system.runner().is_running());
        assert_eq!(h.system.runner().task_names(), vec![DELAYED_SWEEP_TASK]);

        let again = h.system.launch().await.unwrap();
        assert_eq!(again.generation(), snapshot.generation());
        h.system.shutdown().await;
        assert!(!h.system.runner().is_running());
    }

    #[tokio::test]
    async fn sweep_rearms_due_records_and_discards_orphans() {
        let h = harness("2026-01-01T09:00:00Z");
        let drug = h.system.gateway().create_drug("Aspirin", true).await.unwrap();
        let alarm = h
            .system
            .gateway()
            .create_alarm(&drug.id, AlarmTime::new(8, 0))
            .await
            .unwrap();
        let delayed = h.system.delayed();
        delayed.record_delay(&alarm.id, utc("2026-01-01T08:45:00Z")).await.unwrap();
        delayed.record_delay(&AlarmId::new(), utc("2026-01-01T08:50:00Z")).await.unwrap();
        delayed.record_delay(&alarm.id, utc("2026-01-01T10:00:00Z")).await.unwrap();

        assert_eq!(h.system.sweep_now().await, 1);
        assert_eq!(h.center.pending_ids(), vec![format!("{}:delayed", alarm.id)]);
        let left = delayed.all().await;
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].fire_after, utc("2026-01-01T10:00:00Z"));
    }

    #[tokio::test]
    async fn recurring_record_restores_daily_alarm() {
        let h = harness("2026-01-01T08:01:00Z");
        let drug = h.system.gateway().create_drug("Aspirin", true).await.unwrap();
        let alarm = h
            .system
            .gateway()
            .create_alarm(&drug.id, AlarmTime::new(8, 0))
            .await
            .unwrap();
        h.system
            .delayed()
            .record(DelayedReminderRecord::recurring(alarm.id.clone(), utc("2026-01-01T08:00:30Z")))
            .await
            .unwrap();

        assert_eq!(h.system.sweep_now().await, 1);
        assert_eq!(h.center.pending_ids(), vec![alarm.id.to_string()]);
        assert!(h.system.delayed().all().await.is_empty());
    }

    #[tokio::test]
    async fn cancelled_sweep_leaves_records() {
        let h = harness("2026-01-01T09:00:00Z");
        h.system
            .delayed()
            .record_delay(&AlarmId::new(), utc("2026-01-01T08:00:00Z"))
            .await
            .unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let armed = sweep_delayed(
            &h.system.scheduler,
            &h.system.notifications,
            &h.system.delayed,
            h.clock.as_ref(),
            &cancel,
        )
        .await;
        assert_eq!(armed, 0);
        assert_eq!(h.system.delayed().all().await.len(), 1);
    }

    #[tokio::test]
    async fn import_with_reset_replaces_everything() {
        let h = harness("2026-01-01T07:00:00Z");
        let old = h.system.gateway().create_drug("Old", true).await.unwrap();
        let old_alarm = h.system.scheduler().add_alarm(&old.id, 6, 0).await.unwrap();
        h.system.delayed().record_delay(&old_alarm.id, h.clock.now()).await.unwrap();

        let backup = r#"[{"name":"Aspirin","isActive":true,
            "alarms":[{"id":"7d3f4f39-6e0c-4a57-9f5e-1f7b1d2b9a10","alarmHour":8,"alarmMinute":0}],
            "takenDosages":[{"date":"2025-12-31T00:00:00Z","timestamp":"2025-12-31T08:05:00Z"}]},
            {"name":"Paused","isActive":false,
            "alarms":[{"id":"0b0f6c1e-2f4a-4c1e-8a57-3d1a9b7c2e11","alarmHour":9,"alarmMinute":0}]}]"#;
        let summary = h.system.import_backup(backup, true).await.unwrap();

        assert_eq!(summary.drugs, 2);
        assert_eq!(summary.doses, 1);
        assert_eq!(h.center.pending_ids(), vec!["7d3f4f39-6e0c-4a57-9f5e-1f7b1d2b9a10".to_string()]);
        assert!(h.system.delayed().all().await.is_empty());
        assert_eq!(h.system.gateway().all_drugs().await.unwrap().len(), 2);
        assert!(h.system.gateway().alarm(&old_alarm.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn malformed_backup_changes_nothing() {
        let h = harness("2026-01-01T07:00:00Z");
        let _ = h.system.gateway().create_drug("Keep", true).await.unwrap();
        assert!(h.system.import_backup("not json", true).await.is_err());
        assert_eq!(h.system.gateway().all_drugs().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn export_contains_store_contents() {
        let h = harness("2026-01-01T07:00:00Z");
        let drug = h.system.gateway().create_drug("Aspirin", true).await.unwrap();
        let _ = h.system.scheduler().add_alarm(&drug.id, 8, 0).await.unwrap();

        let json: serde_json::Value = serde_json::from_str(&h.system.export_backup().await.unwrap()).unwrap();
        assert_eq!(json[0]["name"], "Aspirin");
        assert_eq!(json[0]["alarms"][0]["alarmHour"], 8);
    }

    #[tokio::test]
    async fn sweep_skips_reminders_already_live() {
        let h = harness("2026-01-02T00:05:00Z");
        let drug = h.system.gateway().create_drug("Aspirin", true).await.unwrap();
        let alarm = h.system.scheduler().add_alarm(&drug.id, 8, 0).await.unwrap();
        assert!(h.system.scheduler().arm_delayed(&alarm.id, Duration::minutes(1)).await.unwrap());
        let delayed = h.system.delayed();
        delayed.record_delay(&alarm.id, utc("2026-01-02T00:05:00Z")).await.unwrap();
        delayed
            .record(DelayedReminderRecord::recurring(alarm.id.clone(), utc("2026-01-02T00:01:00Z")))
            .await
            .unwrap();

        assert_eq!(h.system.sweep_now().await, 0);
        assert!(delayed.all().await.is_empty());
        assert_eq!(h.center.pending_ids().len(), 2);
    }

    #[tokio::test]
    async fn answered_overnight_snooze_is_not_delivered_twice() {
        let h = harness("2026-01-01T23:50:00Z");
        let drug = h.system.gateway().create_drug("Aspirin", true).await.unwrap();
        let alarm = h.system.scheduler().add_alarm(&drug.id, 23, 50).await.unwrap();
        let delivered = h.center.deliver_now(alarm.id.as_str()).unwrap();
        h.system
            .handle_response(&NotificationResponse {
                notification: delivered,
                action: NotificationAction::Snooze(15),
            })
            .await
            .unwrap();

        h.clock.set(utc("2026-01-02T00:05:00Z"));
        let snoozed = h.center.deliver_due().remove(0);
        h.system
            .handle_response(&NotificationResponse {
                notification: snoozed,
                action: NotificationAction::TakenNow,
            })
            .await
            .unwrap();
        assert_eq!(h.system.sweep_now().await, 0);

        h.clock.set(utc("2026-01-02T00:06:00Z"));
        assert_eq!(h.system.sweep_now().await, 0);
        assert!(h.center.deliver_due().is_empty());
        assert_eq!(h.center.pending_ids(), vec![alarm.id.to_string()]);
        assert_eq!(h.system.gateway().dose_history().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn foreground_refreshes_once() {
        let h = harness("2026-01-01T07:00:00Z");
        let mut events = h.system.notifications().subscribe();
        let before = h.system.merge().snapshot().generation();

        let snapshot = h.system.foreground().await.unwrap();
        assert_eq!(snapshot.generation(), before + 1);
        // No event left for the listener to recompute again.
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn unusable_data_dir_is_an_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("blocker");
        std::fs::write(&blocker, "").unwrap();
        let mut settings = ChronitolSettings::default();
        settings.storage.data_dir = blocker.join("data").to_string_lossy().into_owned();

        let clock = Arc::new(ManualClock::new(utc("2026-01-01T07:00:00Z")));
        let center = Arc::new(InMemoryNotificationCenter::new(Calendar::Zone(chrono_tz::UTC), clock.clone()));
        let err = ReminderSystem::open(&settings, center, clock).await.err().unwrap();
        assert!(matches!(err, EngineError::Io(_)));
    }
}
