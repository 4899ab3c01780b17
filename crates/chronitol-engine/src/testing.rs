//! Shared wiring for unit tests: in-memory SQLite, the simulated
//! notification center and a manual clock, all in UTC.

use std::sync::Arc;

use chrono::{DateTime, Utc};

use chronitol_core::{Calendar, Clock, ManualClock, PersistenceGateway};
use chronitol_store::SqliteGateway;

use crate::delayed::DelayedReminderStore;
use crate::dose_log::DoseLog;
use crate::merge::MergeEngine;
use crate::notifications::adapter::NotificationAdapter;
use crate::notifications::memory::InMemoryNotificationCenter;
use crate::policy::ReminderPolicy;
use crate::router::ActionRouter;
use crate::scheduler::AlarmScheduler;

pub(crate) fn utc(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
}

pub(crate) struct Fixture {
    pub gateway: Arc<SqliteGateway>,
    pub center: Arc<InMemoryNotificationCenter>,
    pub clock: Arc<ManualClock>,
    pub adapter: Arc<NotificationAdapter>,
    pub delayed: Arc<DelayedReminderStore>,
    pub scheduler: Arc<AlarmScheduler>,
    pub dose_log: Arc<DoseLog>,
    pub router: Arc<ActionRouter>,
    pub merge: Arc<MergeEngine>,
}

impl Fixture {
    pub fn new(start: &str) -> Self {
        let calendar = Calendar::Zone(chrono_tz::UTC);
        let policy = ReminderPolicy::default();
        let clock = Arc::new(ManualClock::new(utc(start)));
        let gateway = Arc::new(SqliteGateway::in_memory(calendar).unwrap());
        let center = Arc::new(InMemoryNotificationCenter::new(calendar, clock.clone()));
        let adapter = Arc::new(NotificationAdapter::new(center.clone(), clock.clone()));
        let delayed = Arc::new(DelayedReminderStore::in_memory());

        let dyn_gateway: Arc<dyn PersistenceGateway> = gateway.clone();
        let dyn_clock: Arc<dyn Clock> = clock.clone();
        let scheduler = Arc::new(AlarmScheduler::new(dyn_gateway.clone(), adapter.clone(), delayed.clone()));
        let dose_log = Arc::new(DoseLog::new(
            dyn_gateway.clone(),
            adapter.clone(),
            delayed.clone(),
            dyn_clock.clone(),
            policy.clone(),
        ));
        let router = Arc::new(ActionRouter::new(
            adapter.clone(),
            delayed.clone(),
            dose_log.clone(),
            dyn_clock.clone(),
            calendar,
            policy.clone(),
        ));
        let merge = Arc::new(MergeEngine::new(dyn_gateway, adapter.clone(), delayed.clone(), dyn_clock, &policy));

        Self {
            gateway,
            center,
            clock,
            adapter,
            delayed,
            scheduler,
            dose_log,
            router,
            merge,
        }
    }

    pub fn clock_now(&self) -> DateTime<Utc> {
        self.clock.now()
    }
}
