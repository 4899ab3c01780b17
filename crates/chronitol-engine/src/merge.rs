//! Pending, due and history rows merged into one sectioned list.
//!
//! A snapshot holds two halves: pending sections (`Due`, `Upcoming`) and
//! history sections (one per local day). A refresh recomputes one half or
//! both and copies the other from the previous snapshot unchanged.
//! Refreshes are serialized from fetch to publish; each published snapshot
//! carries the next generation number.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, watch, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use chronitol_core::model::UNKNOWN_DRUG_NAME;
use chronitol_core::{
    Calendar, Clock, DelayKind, DoseId, DrugId, DueTimestamp, PendingDosageInfo, PersistenceGateway, ReminderEvent,
    StoreChange,
};

use crate::delayed::DelayedReminderStore;
use crate::error::EngineError;
use crate::notifications::adapter::NotificationAdapter;
use crate::notifications::{delayed_identifier, Trigger};
use crate::policy::ReminderPolicy;

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum SectionKey {
    Due,
    Upcoming,
    /// Start of the local day.
    HistoryDay(DateTime<Utc>),
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct HistoryDose {
    pub id: DoseId,
    pub drug_id: DrugId,
    pub drug_name: String,
    pub timestamp: DateTime<Utc>,
    pub date: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum DoseListItem {
    Pending(PendingDosageInfo),
    History(HistoryDose),
}

/// What makes two items "the same row" across snapshots.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum ItemIdentity {
    Pending(PendingDosageInfo),
    Dose(DoseId),
}

impl DoseListItem {
    pub fn identity(&self) -> ItemIdentity {
        match self {
            Self::Pending(info) => ItemIdentity::Pending(info.clone()),
            Self::History(dose) => ItemIdentity::Dose(dose.id.clone()),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Section {
    pub key: SectionKey,
    pub items: Vec<DoseListItem>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DoseListSnapshot {
    pending: Vec<Section>,
    history: Vec<Section>,
    generation: u64,
}

impl DoseListSnapshot {
    /// Pending sections first, then history days.
    pub fn sections(&self) -> impl Iterator<Item = &Section> {
        self.pending.iter().chain(self.history.iter())
    }

    pub fn pending(&self) -> &[Section] {
        &self.pending
    }

    pub fn history(&self) -> &[Section] {
        &self.history
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn section(&self, key: &SectionKey) -> Option<&Section> {
        self.sections().find(|s| &s.key == key)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RefreshScope {
    Pending,
    History,
    All,
}

impl RefreshScope {
    fn pending(self) -> bool {
        matches!(self, Self::Pending | Self::All)
    }

    fn history(self) -> bool {
        matches!(self, Self::History | Self::All)
    }
}

/// `Due` once `now - at` reaches the window, `Upcoming` before that.
pub fn classify(at: DateTime<Utc>, now: DateTime<Utc>, due_window: Duration) -> DueTimestamp {
    if now - at >= due_window {
        DueTimestamp::Due(at)
    } else {
        DueTimestamp::Upcoming(at)
    }
}

pub struct MergeEngine {
    gateway: Arc<dyn PersistenceGateway>,
    notifications: Arc<NotificationAdapter>,
    delayed: Arc<DelayedReminderStore>,
    clock: Arc<dyn Clock>,
    calendar: Calendar,
    due_window: Duration,
    refresh_lock: Mutex<()>,
    snapshots: watch::Sender<Arc<DoseListSnapshot>>,
}

impl MergeEngine {
    pub fn new(
        gateway: Arc<dyn PersistenceGateway>,
        notifications: Arc<NotificationAdapter>,
        delayed: Arc<DelayedReminderStore>,
        clock: Arc<dyn Clock>,
        policy: &ReminderPolicy,
    ) -> Self {
        let calendar = gateway.calendar();
        let (snapshots, _) = watch::channel(Arc::new(DoseListSnapshot::default()));
        Self {
            gateway,
            notifications,
            delayed,
            clock,
            calendar,
            due_window: policy.due_window,
            refresh_lock: Mutex::new(()),
            snapshots,
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<Arc<DoseListSnapshot>> {
        self.snapshots.subscribe()
    }

    pub fn snapshot(&self) -> Arc<DoseListSnapshot> {
        self.snapshots.borrow().clone()
    }

    /// Recompute the requested half and publish a new snapshot.
    #[instrument(skip(self))]
    pub async fn refresh(&self, scope: RefreshScope) -> Result<Arc<DoseListSnapshot>, EngineError> {
        let _guard = self.refresh_lock.lock().await;
        let previous = self.snapshot();

        let pending = if scope.pending() {
            self.compute_pending().await?
        } else {
            previous.pending.clone()
        };
        let history = if scope.history() {
            self.compute_history().await?
        } else {
            previous.history.clone()
        };

        let next = Arc::new(DoseListSnapshot {
            pending,
            history,
            generation: previous.generation + 1,
        });
        let _ = self.snapshots.send_replace(next.clone());
        debug!(generation = next.generation, "dose list refreshed");
        Ok(next)
    }

    async fn compute_pending(&self) -> Result<Vec<Section>, EngineError> {
        let now = self.clock.now();
        let mut items = Vec::new();
        let mut live = HashSet::new();

        for delivered in self.notifications.list_delivered().await {
            let payload = delivered.request.payload();
            items.push(PendingDosageInfo {
                reminder_id: delivered.request.id.clone(),
                drug_reference_id: payload.map(|p| p.drug_id.clone()),
                drug_name: payload.map_or_else(|| UNKNOWN_DRUG_NAME.to_string(), |p| p.drug_name.clone()),
                due_timestamp: DueTimestamp::Due(delivered.delivered_at),
            });
            let _ = live.insert(delivered.request.id);
        }

        for request in self.notifications.list_pending().await {
            if live.contains(&request.id) {
                continue;
            }
            let payload = request.payload();
            let due_timestamp = match request.trigger {
                Trigger::Daily { hour, minute } => {
                    let latest = self.calendar.latest_occurrence(hour, minute, now);
                    let drug_id = payload.map(|p| &p.drug_id);
                    if self.is_outstanding(&request.id, drug_id, latest).await? {
                        classify(latest, now, self.due_window)
                    } else {
                        DueTimestamp::Upcoming(request.trigger.next_fire(now, &self.calendar))
                    }
                }
                Trigger::Interval { .. } => {
                    classify(request.trigger.next_fire(now, &self.calendar), now, self.due_window)
                }
            };
            items.push(PendingDosageInfo {
                reminder_id: request.id.clone(),
                drug_reference_id: payload.map(|p| p.drug_id.clone()),
                drug_name: payload.map_or_else(|| UNKNOWN_DRUG_NAME.to_string(), |p| p.drug_name.clone()),
                due_timestamp,
            });
            let _ = live.insert(request.id);
        }

        for record in self.delayed.all().await {
            let reminder_id = match record.kind {
                DelayKind::OneShot => delayed_identifier(record.alarm_reference_id.as_str()),
                DelayKind::Recurring => record.alarm_reference_id.to_string(),
            };
            if !live.insert(reminder_id.clone()) {
                continue;
            }
            let drug = match self.gateway.alarm(&record.alarm_reference_id).await? {
                Some(alarm) => self.gateway.drug(&alarm.drug_id).await?,
                None => None,
            };
            items.push(PendingDosageInfo {
                reminder_id,
                drug_reference_id: drug.as_ref().map(|d| d.id.clone()),
                drug_name: drug
                    .as_ref()
                    .map_or_else(|| UNKNOWN_DRUG_NAME.to_string(), |d| d.display_name().to_string()),
                due_timestamp: classify(record.fire_after, now, self.due_window),
            });
        }

        let (mut due, mut upcoming): (Vec<_>, Vec<_>) = items.into_iter().partition(|i| i.due_timestamp.is_due());
        due.sort_by(|a, b| {
            (a.due_timestamp.at(), &a.reminder_id).cmp(&(b.due_timestamp.at(), &b.reminder_id))
        });
        upcoming.sort_by(|a, b| {
            (a.due_timestamp.at(), &a.reminder_id).cmp(&(b.due_timestamp.at(), &b.reminder_id))
        });

        let mut sections = Vec::new();
        for (key, items) in [(SectionKey::Due, due), (SectionKey::Upcoming, upcoming)] {
            if !items.is_empty() {
                sections.push(Section {
                    key,
                    items: items.into_iter().map(DoseListItem::Pending).collect(),
                });
            }
        }
        Ok(sections)
    }

    /// Whether the daily occurrence at `occurred_at` still waits for an
    /// answer: it falls inside the request's current cycle and no dose for
    /// the drug was logged since.
    async fn is_outstanding(
        &self,
        reminder_id: &str,
        drug_id: Option<&DrugId>,
        occurred_at: DateTime<Utc>,
    ) -> Result<bool, EngineError> {
        let Some(cycle_start) = self.notifications.cycle_start(reminder_id) else {
            return Ok(false);
        };
        if occurred_at <= cycle_start {
            return Ok(false);
        }
        let Some(drug_id) = drug_id else {
            return Ok(true);
        };
        let doses = self.gateway.doses_for_drug(drug_id).await?;
        Ok(!doses.iter().any(|d| d.timestamp() >= occurred_at))
    }

    async fn compute_history(&self) -> Result<Vec<Section>, EngineError> {
        let names: HashMap<DrugId, String> = self
            .gateway
            .all_drugs()
            .await?
            .into_iter()
            .map(|d| (d.id.clone(), d.display_name().to_string()))
            .collect();

        let mut days: BTreeMap<DateTime<Utc>, Vec<HistoryDose>> = BTreeMap::new();
        for dose in self.gateway.dose_history().await? {
            let drug_name = names
                .get(&dose.drug_id)
                .cloned()
                .unwrap_or_else(|| UNKNOWN_DRUG_NAME.to_string());
            days.entry(dose.date()).or_default().push(HistoryDose {
                id: dose.id.clone(),
                drug_id: dose.drug_id.clone(),
                drug_name,
                timestamp: dose.timestamp(),
                date: dose.date(),
            });
        }

        Ok(days
            .into_iter()
            .rev()
            .map(|(day, mut doses)| {
                doses.sort_by(|a, b| (b.timestamp, &b.id).cmp(&(a.timestamp, &a.id)));
                Section {
                    key: SectionKey::HistoryDay(day),
                    items: doses.into_iter().map(DoseListItem::History).collect(),
                }
            })
            .collect())
    }

    /// Recompute on reminder and store events until `cancel` fires.
    pub fn spawn_listener(
        self: Arc<Self>,
        mut reminders: broadcast::Receiver<ReminderEvent>,
        mut store: broadcast::Receiver<StoreChange>,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                let scope = tokio::select! {
                    () = cancel.cancelled() => break,
                    event = reminders.recv() => match event {
                        Ok(ReminderEvent::RemindersChanged) => RefreshScope::Pending,
                        Ok(ReminderEvent::Foregrounded) => RefreshScope::All,
                        Err(RecvError::Lagged(skipped)) => {
                            warn!(skipped, "reminder events lagged, refreshing everything");
                            RefreshScope::All
                        }
                        Err(RecvError::Closed) => break,
                    },
                    change = store.recv() => match change {
                        Ok(StoreChange::DoseHistory | StoreChange::Drugs) => RefreshScope::History,
                        Ok(StoreChange::Alarms) => continue,
                        Err(RecvError::Lagged(skipped)) => {
                            warn!(skipped, "store changes lagged, refreshing everything");
                            RefreshScope::All
                        }
                        Err(RecvError::Closed) => break,
                    },
                };
                if let Err(error) = self.refresh(scope).await {
                    warn!(?scope, %error, "dose list refresh failed");
                }
            }
            debug!("merge listener stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notifications::{NotificationAction, NotificationResponse};
    use crate::testing::{utc, Fixture};
    use chronitol_core::{AlarmId, DelayedReminderRecord};

    fn pending_infos(snapshot: &DoseListSnapshot) -> Vec<PendingDosageInfo> {
        snapshot
            .pending()
            .iter()
            .flat_map(|s| s.items.iter())
            .filter_map(|i| match i {
                DoseListItem::Pending(info) => Some(info.clone()),
                DoseListItem::History(_) => None,
            })
            .collect()
    }

    fn pending_ids(section: &Section) -> Vec<String> {
        section
            .items
            .iter()
            .filter_map(|i| match i {
                DoseListItem::Pending(info) => Some(info.reminder_id.clone()),
                DoseListItem::History(_) => None,
            })
            .collect()
    }

    #[test]
    fn boundary_is_inclusive() {
        let now = utc("2026-01-01T12:00:00Z");
        let window = Duration::minutes(60);
        assert!(!classify(now - Duration::minutes(59), now, window).is_due());
        assert!(classify(now - Duration::minutes(60), now, window).is_due());
        assert!(classify(now - Duration::minutes(61), now, window).is_due());
        assert!(!classify(now + Duration::minutes(5), now, window).is_due());
    }

    #[tokio::test]
    async fn delivered_is_due_and_pending_is_upcoming() {
        let fx = Fixture::new("2026-01-01T07:00:00Z");
        let drug = fx.gateway.create_drug("Aspirin", true).await.unwrap();
        let morning = fx.scheduler.add_alarm(&drug.id, 8, 0).await.unwrap();
        let evening = fx.scheduler.add_alarm(&drug.id, 20, 0).await.unwrap();

        fx.clock.advance(Duration::hours(1));
        let _ = fx.center.deliver_due();
        let snapshot = fx.merge.refresh(RefreshScope::All).await.unwrap();

        let due = snapshot.section(&SectionKey::Due).unwrap();
        assert_eq!(pending_ids(due), vec![morning.id.to_string()]);
        let DoseListItem::Pending(info) = &due.items[0] else {
            panic!("expected pending item");
        };
        assert_eq!(info.due_timestamp, DueTimestamp::Due(utc("2026-01-01T08:00:00Z")));
        assert_eq!(info.drug_name, "Aspirin");
        assert_eq!(info.drug_reference_id, Some(drug.id.clone()));

        let upcoming = snapshot.section(&SectionKey::Upcoming).unwrap();
        assert_eq!(pending_ids(upcoming), vec![evening.id.to_string()]);
    }

    #[tokio::test]
    async fn snoozed_reminder_crosses_window_boundary() {
        let fx = Fixture::new("2026-01-01T08:00:00Z");
        let drug = fx.gateway.create_drug("Aspirin", true).await.unwrap();
        let alarm = fx
            .gateway
            .create_alarm(&drug.id, chronitol_core::AlarmTime::new(8, 0))
            .await
            .unwrap();
        assert!(fx.scheduler.arm_delayed(&alarm.id, Duration::minutes(5)).await.unwrap());
        let fire = utc("2026-01-01T08:05:00Z");

        for (offset, due) in [(59, false), (60, true), (61, true)] {
            fx.clock.set(fire + Duration::minutes(offset));
            let snapshot = fx.merge.refresh(RefreshScope::Pending).await.unwrap();
            let key = if due { SectionKey::Due } else { SectionKey::Upcoming };
            let section = snapshot.section(&key).unwrap();
            assert_eq!(pending_ids(section), vec![delayed_identifier(alarm.id.as_str())], "offset {offset}");
        }
    }

    #[tokio::test]
    async fn undelivered_daily_reminder_crosses_window_boundary() {
        let fx = Fixture::new("2026-01-01T07:00:00Z");
        let drug = fx.gateway.create_drug("Aspirin", true).await.unwrap();
        let alarm = fx.scheduler.add_alarm(&drug.id, 8, 0).await.unwrap();
        let occurrence = utc("2026-01-01T08:00:00Z");

        for (offset, expected) in [
            (59, DueTimestamp::Upcoming(occurrence)),
            (60, DueTimestamp::Due(occurrence)),
            (61, DueTimestamp::Due(occurrence)),
        ] {
            fx.clock.set(occurrence + Duration::minutes(offset));
            let snapshot = fx.merge.refresh(RefreshScope::Pending).await.unwrap();
            let infos = pending_infos(&snapshot);
            assert_eq!(infos.len(), 1, "offset {offset}");
            assert_eq!(infos[0].reminder_id, alarm.id.to_string());
            assert_eq!(infos[0].due_timestamp, expected, "offset {offset}");
        }
    }

    #[tokio::test]
    async fn taken_daily_reminder_moves_to_next_occurrence() {
        let fx = Fixture::new("2026-01-01T07:00:00Z");
        let drug = fx.gateway.create_drug("Aspirin", true).await.unwrap();
        let alarm = fx.scheduler.add_alarm(&drug.id, 8, 0).await.unwrap();

        fx.clock.set(utc("2026-01-01T08:00:00Z"));
        let notification = fx.center.deliver_due().remove(0);
        fx.clock.set(utc("2026-01-01T08:03:00Z"));
        fx.router
            .handle(&NotificationResponse {
                notification,
                action: NotificationAction::TakenNow,
            })
            .await
            .unwrap();

        for now in ["2026-01-01T08:03:00Z", "2026-01-01T09:30:00Z"] {
            fx.clock.set(utc(now));
            let snapshot = fx.merge.refresh(RefreshScope::Pending).await.unwrap();
            assert!(snapshot.section(&SectionKey::Due).is_none(), "at {now}");
            let infos = pending_infos(&snapshot);
            assert_eq!(infos.len(), 1);
            assert_eq!(infos[0].reminder_id, alarm.id.to_string());
            assert_eq!(infos[0].due_timestamp, DueTimestamp::Upcoming(utc("2026-01-02T08:00:00Z")));
        }
    }

    #[tokio::test]
    async fn dose_logged_after_occurrence_answers_it() {
        let fx = Fixture::new("2026-01-01T07:00:00Z");
        let drug = fx.gateway.create_drug("Aspirin", true).await.unwrap();
        let _ = fx.scheduler.add_alarm(&drug.id, 8, 0).await.unwrap();
        // Yesterday's dose does not count for today's occurrence.
        let _ = fx.gateway.create_dose(&drug.id, utc("2025-12-31T08:10:00Z")).await.unwrap();

        fx.clock.set(utc("2026-01-01T09:30:00Z"));
        let snapshot = fx.merge.refresh(RefreshScope::Pending).await.unwrap();
        assert_eq!(
            pending_infos(&snapshot)[0].due_timestamp,
            DueTimestamp::Due(utc("2026-01-01T08:00:00Z"))
        );

        let _ = fx.dose_log.log_dose(&drug.id, utc("2026-01-01T08:30:00Z")).await.unwrap();
        let snapshot = fx.merge.refresh(RefreshScope::Pending).await.unwrap();
        assert_eq!(
            pending_infos(&snapshot)[0].due_timestamp,
            DueTimestamp::Upcoming(utc("2026-01-02T08:00:00Z"))
        );
    }

    #[tokio::test]
    async fn alarm_armed_after_its_time_waits_for_tomorrow() {
        let fx = Fixture::new("2026-01-01T11:00:00Z");
        let drug = fx.gateway.create_drug("Aspirin", true).await.unwrap();
        let _ = fx.scheduler.add_alarm(&drug.id, 8, 0).await.unwrap();

        let snapshot = fx.merge.refresh(RefreshScope::Pending).await.unwrap();
        let infos = pending_infos(&snapshot);
        assert_eq!(infos.len(), 1);
        assert_eq!(infos[0].due_timestamp, DueTimestamp::Upcoming(utc("2026-01-02T08:00:00Z")));
    }

    #[tokio::test]
    async fn records_shadowed_by_live_requests() {
        let fx = Fixture::new("2026-01-01T08:00:00Z");
        let drug = fx.gateway.create_drug("Aspirin", true).await.unwrap();
        let alarm = fx
            .gateway
            .create_alarm(&drug.id, chronitol_core::AlarmTime::new(8, 0))
            .await
            .unwrap();
        fx.delayed.record_delay(&alarm.id, utc("2026-01-01T08:15:00Z")).await.unwrap();

        let snapshot = fx.merge.refresh(RefreshScope::Pending).await.unwrap();
        let upcoming = snapshot.section(&SectionKey::Upcoming).unwrap();
        assert_eq!(upcoming.items.len(), 1);
        let DoseListItem::Pending(info) = &upcoming.items[0] else {
            panic!("expected pending item");
        };
        assert_eq!(info.drug_name, "Aspirin");

        // Same reminder now live as a request: listed once.
        assert!(fx.scheduler.arm_delayed(&alarm.id, Duration::minutes(15)).await.unwrap());
        let snapshot = fx.merge.refresh(RefreshScope::Pending).await.unwrap();
        assert_eq!(snapshot.section(&SectionKey::Upcoming).unwrap().items.len(), 1);
    }

    #[tokio::test]
    async fn orphan_record_uses_fallback_name() {
        let fx = Fixture::new("2026-01-01T08:00:00Z");
        fx.delayed
            .record(DelayedReminderRecord::recurring(AlarmId::new(), utc("2026-01-01T06:00:00Z")))
            .await
            .unwrap();
        let snapshot = fx.merge.refresh(RefreshScope::Pending).await.unwrap();
        let DoseListItem::Pending(info) = &snapshot.section(&SectionKey::Due).unwrap().items[0] else {
            panic!("expected pending item");
        };
        assert_eq!(info.drug_name, UNKNOWN_DRUG_NAME);
        assert_eq!(info.drug_reference_id, None);
    }

    #[tokio::test]
    async fn ordering_and_empty_sections() {
        let fx = Fixture::new("2026-01-01T12:00:00Z");
        let snapshot = fx.merge.refresh(RefreshScope::All).await.unwrap();
        assert_eq!(snapshot.sections().count(), 0);

        for at in ["2026-01-01T09:00:00Z", "2026-01-01T07:00:00Z", "2026-01-01T15:00:00Z", "2026-01-01T13:00:00Z"] {
            fx.delayed.record_delay(&AlarmId::new(), utc(at)).await.unwrap();
        }
        let a = fx.gateway.create_drug("A", true).await.unwrap();
        let d1 = fx.gateway.create_dose(&a.id, utc("2025-12-30T10:00:00Z")).await.unwrap();
        let d2 = fx.gateway.create_dose(&a.id, utc("2025-12-31T09:00:00Z")).await.unwrap();
        let d3 = fx.gateway.create_dose(&a.id, utc("2025-12-31T18:00:00Z")).await.unwrap();

        let snapshot = fx.merge.refresh(RefreshScope::All).await.unwrap();
        let keys: Vec<SectionKey> = snapshot.sections().map(|s| s.key.clone()).collect();
        assert_eq!(
            keys,
            vec![
                SectionKey::Due,
                SectionKey::Upcoming,
                SectionKey::HistoryDay(utc("2025-12-31T00:00:00Z")),
                SectionKey::HistoryDay(utc("2025-12-30T00:00:00Z")),
            ]
        );

        let due_times: Vec<_> = snapshot.pending()[0]
            .items
            .iter()
            .map(|i| match i {
                DoseListItem::Pending(p) => p.due_timestamp.at(),
                DoseListItem::History(_) => unreachable!(),
            })
            .collect();
        assert_eq!(due_times, vec![utc("2026-01-01T07:00:00Z"), utc("2026-01-01T09:00:00Z")]);

        let upcoming_times: Vec<_> = snapshot.pending()[1]
            .items
            .iter()
            .map(|i| match i {
                DoseListItem::Pending(p) => p.due_timestamp.at(),
                DoseListItem::History(_) => unreachable!(),
            })
            .collect();
        assert_eq!(upcoming_times, vec![utc("2026-01-01T13:00:00Z"), utc("2026-01-01T15:00:00Z")]);

        let day: Vec<_> = snapshot.history()[0].items.iter().map(DoseListItem::identity).collect();
        assert_eq!(day, vec![ItemIdentity::Dose(d3.id), ItemIdentity::Dose(d2.id)]);
        assert_eq!(snapshot.history()[1].items[0].identity(), ItemIdentity::Dose(d1.id));
    }

    #[tokio::test]
    async fn history_refresh_preserves_pending_half() {
        let fx = Fixture::new("2026-01-01T07:00:00Z");
        let drug = fx.gateway.create_drug("Aspirin", true).await.unwrap();
        let _ = fx.scheduler.add_alarm(&drug.id, 8, 0).await.unwrap();
        let before = fx.merge.refresh(RefreshScope::All).await.unwrap();

        // Change pending state without refreshing it.
        fx.adapter.cancel_all().await;
        let _ = fx.gateway.create_dose(&drug.id, fx.clock_now()).await.unwrap();
        let after = fx.merge.refresh(RefreshScope::History).await.unwrap();

        assert_eq!(after.pending(), before.pending());
        assert_eq!(after.history().len(), 1);
        assert_eq!(after.generation(), before.generation() + 1);
    }

    #[tokio::test]
    async fn pending_refresh_preserves_history_half() {
        let fx = Fixture::new("2026-01-01T07:00:00Z");
        let drug = fx.gateway.create_drug("Aspirin", true).await.unwrap();
        let _ = fx.gateway.create_dose(&drug.id, fx.clock_now()).await.unwrap();
        let before = fx.merge.refresh(RefreshScope::All).await.unwrap();

        fx.gateway.delete_all().await.unwrap();
        let _ = fx.scheduler.add_alarm(&fx.gateway.create_drug("B", true).await.unwrap().id, 9, 0).await;
        let after = fx.merge.refresh(RefreshScope::Pending).await.unwrap();

        assert_eq!(after.history(), before.history());
        assert_ne!(after.pending(), before.pending());
    }

    #[tokio::test]
    async fn listener_follows_events() {
        let fx = Fixture::new("2026-01-01T07:00:00Z");
        let cancel = CancellationToken::new();
        let mut snapshots = fx.merge.subscribe();
        let handle = fx
            .merge
            .clone()
            .spawn_listener(fx.adapter.subscribe(), fx.gateway.subscribe(), cancel.clone());

        let drug = fx.gateway.create_drug("Aspirin", true).await.unwrap();
        let _ = fx.scheduler.add_alarm(&drug.id, 8, 0).await.unwrap();

        let found = tokio::time::timeout(std::time::Duration::from_secs(5), async {
            loop {
                snapshots.changed().await.unwrap();
                if snapshots.borrow().section(&SectionKey::Upcoming).is_some() {
                    break;
                }
            }
        })
        .await;
        assert!(found.is_ok());

        cancel.cancel();
        handle.await.unwrap();
    }
}
