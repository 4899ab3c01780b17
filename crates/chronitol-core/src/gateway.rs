use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::broadcast;

use crate::calendar::Calendar;
use crate::errors::PersistenceError;
use crate::events::StoreChange;
use crate::ids::{AlarmId, DoseId, DrugId};
use crate::model::{Alarm, AlarmTime, DoseEntry, Drug};

pub type PersistenceResult<T> = Result<T, PersistenceError>;

/// Storage of drugs, alarms and dose history.
///
/// Lookups return `Ok(None)` for missing rows; mutations of missing rows
/// return [`PersistenceError::NotFound`]. Every successful mutation is
/// announced on [`PersistenceGateway::subscribe`].
#[async_trait]
pub trait PersistenceGateway: Send + Sync {
    /// Calendar used to derive dose dates.
    fn calendar(&self) -> Calendar;

    fn subscribe(&self) -> broadcast::Receiver<StoreChange>;

    // ── Drugs ───────────────────────────────────────────────────────────
    async fn create_drug(&self, name: &str, is_active: bool) -> PersistenceResult<Drug>;
    async fn drug(&self, id: &DrugId) -> PersistenceResult<Option<Drug>>;
    async fn update_drug(&self, drug: &Drug) -> PersistenceResult<()>;
    /// Removes the drug together with its alarms and doses.
    async fn delete_drug(&self, id: &DrugId) -> PersistenceResult<()>;
    async fn all_drugs(&self) -> PersistenceResult<Vec<Drug>>;
    async fn active_drugs(&self) -> PersistenceResult<Vec<Drug>>;

    // ── Alarms ──────────────────────────────────────────────────────────
    async fn create_alarm(&self, drug_id: &DrugId, time: AlarmTime) -> PersistenceResult<Alarm>;
    /// Insert an alarm keeping its id (backup import).
    async fn insert_alarm(&self, alarm: &Alarm) -> PersistenceResult<()>;
    async fn alarm(&self, id: &AlarmId) -> PersistenceResult<Option<Alarm>>;
    async fn alarms_for_drug(&self, drug_id: &DrugId) -> PersistenceResult<Vec<Alarm>>;
    async fn update_alarm(&self, alarm: &Alarm) -> PersistenceResult<()>;
    async fn delete_alarm(&self, id: &AlarmId) -> PersistenceResult<()>;

    // ── Doses ───────────────────────────────────────────────────────────
    async fn create_dose(&self, drug_id: &DrugId, timestamp: DateTime<Utc>) -> PersistenceResult<DoseEntry>;
    async fn dose(&self, id: &DoseId) -> PersistenceResult<Option<DoseEntry>>;
    /// Moves the timestamp and recomputes the day in one write.
    async fn update_dose_timestamp(&self, id: &DoseId, timestamp: DateTime<Utc>) -> PersistenceResult<DoseEntry>;
    async fn delete_dose(&self, id: &DoseId) -> PersistenceResult<()>;
    async fn doses_for_drug(&self, drug_id: &DrugId) -> PersistenceResult<Vec<DoseEntry>>;
    /// Every dose, most recent first.
    async fn dose_history(&self) -> PersistenceResult<Vec<DoseEntry>>;

    /// Batch delete of every drug, alarm and dose.
    async fn delete_all(&self) -> PersistenceResult<()>;
}
