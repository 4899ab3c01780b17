use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::broadcast;
use tracing::debug;

use chronitol_core::gateway::PersistenceResult;
use chronitol_core::{
    Alarm, AlarmId, AlarmTime, Calendar, DoseEntry, DoseId, Drug, DrugId, EventBus, PersistenceGateway,
    StoreChange,
};

use crate::alarms::AlarmRepo;
use crate::database::Database;
use crate::doses::DoseRepo;
use crate::drugs::DrugRepo;
use crate::error::StoreError;

const CHANGE_CHANNEL_CAPACITY: usize = 256;

/// [`PersistenceGateway`] over the SQLite repositories. Announces every
/// committed mutation on its change bus.
pub struct SqliteGateway {
    db: Database,
    drugs: DrugRepo,
    alarms: AlarmRepo,
    doses: DoseRepo,
    calendar: Calendar,
    changes: EventBus<StoreChange>,
}

impl SqliteGateway {
    pub fn new(db: Database, calendar: Calendar) -> Self {
        Self {
            drugs: DrugRepo::new(db.clone()),
            alarms: AlarmRepo::new(db.clone()),
            doses: DoseRepo::new(db.clone(), calendar),
            db,
            calendar,
            changes: EventBus::new(CHANGE_CHANNEL_CAPACITY),
        }
    }

    pub fn open(path: &Path, calendar: Calendar) -> Result<Self, StoreError> {
        Ok(Self::new(Database::open(path)?, calendar))
    }

    pub fn in_memory(calendar: Calendar) -> Result<Self, StoreError> {
        Ok(Self::new(Database::in_memory()?, calendar))
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    fn announce(&self, changes: &[StoreChange]) {
        for change in changes {
            let receivers = self.changes.publish(*change);
            debug!(?change, receivers, "store change published");
        }
    }
}

#[async_trait]
impl PersistenceGateway for SqliteGateway {
    fn calendar(&self) -> Calendar {
        self.calendar
    }

    fn subscribe(&self) -> broadcast::Receiver<StoreChange> {
        self.changes.subscribe()
    }

    // ── Drugs ───────────────────────────────────────────────────────────

    async fn create_drug(&self, name: &str, is_active: bool) -> PersistenceResult<Drug> {
        let drug = self.drugs.create(name, is_active)?;
        self.announce(&[StoreChange::Drugs]);
        Ok(drug)
    }

    async fn drug(&self, id: &DrugId) -> PersistenceResult<Option<Drug>> {
        Ok(self.drugs.get(id)?)
    }

    async fn update_drug(&self, drug: &Drug) -> PersistenceResult<()> {
        self.drugs.update(drug)?;
        self.announce(&[StoreChange::Drugs]);
        Ok(())
    }

    async fn delete_drug(&self, id: &DrugId) -> PersistenceResult<()> {
        self.drugs.delete(id)?;
        self.announce(&[StoreChange::Drugs, StoreChange::Alarms, StoreChange::DoseHistory]);
        Ok(())
    }

    async fn all_drugs(&self) -> PersistenceResult<Vec<Drug>> {
        Ok(self.drugs.list()?)
    }

    async fn active_drugs(&self) -> PersistenceResult<Vec<Drug>> {
        Ok(self.drugs.list_active()?)
    }

    // ── Alarms ──────────────────────────────────────────────────────────

    async fn create_alarm(&self, drug_id: &DrugId, time: AlarmTime) -> PersistenceResult<Alarm> {
        let alarm = self.alarms.create(drug_id, time)?;
        self.announce(&[StoreChange::Alarms]);
        Ok(alarm)
    }

    async fn insert_alarm(&self, alarm: &Alarm) -> PersistenceResult<()> {
        self.alarms.insert(alarm)?;
        self.announce(&[StoreChange::Alarms]);
        Ok(())
    }

    async fn alarm(&self, id: &AlarmId) -> PersistenceResult<Option<Alarm>> {
        Ok(self.alarms.get(id)?)
    }

    async fn alarms_for_drug(&self, drug_id: &DrugId) -> PersistenceResult<Vec<Alarm>> {
        Ok(self.alarms.list_for_drug(drug_id)?)
    }

    async fn update_alarm(&self, alarm: &Alarm) -> PersistenceResult<()> {
        self.alarms.update(alarm)?;
        self.announce(&[StoreChange::Alarms]);
        Ok(())
    }

    async fn delete_alarm(&self, id: &AlarmId) -> PersistenceResult<()> {
        self.alarms.delete(id)?;
        self.announce(&[StoreChange::Alarms]);
        Ok(())
    }

    // ── Doses ───────────────────────────────────────────────────────────

    async fn create_dose(&self, drug_id: &DrugId, timestamp: DateTime<Utc>) -> PersistenceResult<DoseEntry> {
        let dose = self.doses.create(drug_id, timestamp)?;
        self.announce(&[StoreChange::DoseHistory]);
        Ok(dose)
    }

    async fn dose(&self, id: &DoseId) -> PersistenceResult<Option<DoseEntry>> {
        Ok(self.doses.get(id)?)
    }

    async fn update_dose_timestamp(&self, id: &DoseId, timestamp: DateTime<Utc>) -> PersistenceResult<DoseEntry> {
        let dose = self.doses.update_timestamp(id, timestamp)?;
        self.announce(&[StoreChange::DoseHistory]);
        Ok(dose)
    }

    async fn delete_dose(&self, id: &DoseId) -> PersistenceResult<()> {
        self.doses.delete(id)?;
        self.announce(&[StoreChange::DoseHistory]);
        Ok(())
    }

    async fn doses_for_drug(&self, drug_id: &DrugId) -> PersistenceResult<Vec<DoseEntry>> {
        Ok(self.doses.list_for_drug(drug_id)?)
    }

    async fn dose_history(&self) -> PersistenceResult<Vec<DoseEntry>> {
        Ok(self.doses.history()?)
    }

    async fn delete_all(&self) -> PersistenceResult<()> {
        let removed = self.drugs.delete_all()?;
        debug!(removed, "store cleared");
        self.announce(&[StoreChange::Drugs, StoreChange::Alarms, StoreChange::DoseHistory]);
        Ok(())
    }
}
