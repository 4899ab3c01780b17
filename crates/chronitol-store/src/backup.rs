//! Backup file codec.
//!
//! The file is a JSON array of drugs with their alarms and taken dosages:
//!
//! ```json
//! [{"name": "Aspirin", "isActive": true,
//!   "alarms": [{"id": "…", "alarmHour": 8, "alarmMinute": 0}],
//!   "takenDosages": [{"date": "…", "timestamp": "…"}]}]
//! ```
//!
//! Import writes rows only. Arming notifications for imported alarms is the
//! caller's job, using the ids in [`ImportSummary::alarms`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};

use chronitol_core::gateway::PersistenceResult;
use chronitol_core::{Alarm, AlarmId, AlarmTime, PersistenceGateway};

use crate::error::StoreError;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupDrug {
    pub name: String,
    pub is_active: bool,
    #[serde(default)]
    pub alarms: Vec<BackupAlarm>,
    #[serde(default)]
    pub taken_dosages: Vec<BackupDose>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupAlarm {
    pub id: AlarmId,
    pub alarm_hour: i64,
    pub alarm_minute: i64,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupDose {
    /// Informational; recomputed from `timestamp` on import.
    pub date: DateTime<Utc>,
    pub timestamp: DateTime<Utc>,
}

/// What an import wrote.
#[derive(Clone, Debug, Default)]
pub struct ImportSummary {
    pub drugs: usize,
    /// Alarms that belong to active drugs, in file order.
    pub alarms: Vec<AlarmId>,
    pub inactive_alarms: usize,
    pub doses: usize,
}

pub fn to_json(drugs: &[BackupDrug]) -> Result<String, StoreError> {
    Ok(serde_json::to_string_pretty(drugs)?)
}

pub fn from_json(raw: &str) -> Result<Vec<BackupDrug>, StoreError> {
    Ok(serde_json::from_str(raw)?)
}

/// Snapshot every drug with its alarms and dose history.
#[instrument(skip(gateway))]
pub async fn export(gateway: &dyn PersistenceGateway) -> PersistenceResult<Vec<BackupDrug>> {
    let mut out = Vec::new();
    for drug in gateway.all_drugs().await? {
        let alarms = gateway
            .alarms_for_drug(&drug.id)
            .await?
            .into_iter()
            .map(|alarm| BackupAlarm {
                id: alarm.id.clone(),
                alarm_hour: i64::from(alarm.hour()),
                alarm_minute: i64::from(alarm.minute()),
            })
            .collect();
        let taken_dosages = gateway
            .doses_for_drug(&drug.id)
            .await?
            .into_iter()
            .map(|dose| BackupDose {
                date: dose.date(),
                timestamp: dose.timestamp(),
            })
            .collect();
        out.push(BackupDrug {
            name: drug.name,
            is_active: drug.is_active,
            alarms,
            taken_dosages,
        });
    }
    info!(drugs = out.len(), "backup exported");
    Ok(out)
}

/// Write the backup's rows. Alarm ids are kept unless already taken, in
/// which case the alarm gets a fresh id.
#[instrument(skip(gateway, drugs), fields(count = drugs.len()))]
pub async fn import(gateway: &dyn PersistenceGateway, drugs: &[BackupDrug]) -> PersistenceResult<ImportSummary> {
    let mut summary = ImportSummary::default();

    for entry in drugs {
        let drug = gateway.create_drug(&entry.name, entry.is_active).await?;
        summary.drugs += 1;

        for backup_alarm in &entry.alarms {
            let time = AlarmTime::new(backup_alarm.alarm_hour, backup_alarm.alarm_minute);
            let id = match gateway.alarm(&backup_alarm.id).await? {
                None => backup_alarm.id.clone(),
                Some(_) => {
                    warn!(alarm_id = %backup_alarm.id, "alarm id already in use, assigning a new one");
                    AlarmId::new()
                }
            };
            let alarm = Alarm::with_id(id, drug.id.clone(), time);
            gateway.insert_alarm(&alarm).await?;
            if drug.is_active {
                summary.alarms.push(alarm.id);
            } else {
                summary.inactive_alarms += 1;
            }
        }

        for dose in &entry.taken_dosages {
            let _ = gateway.create_dose(&drug.id, dose.timestamp).await?;
            summary.doses += 1;
        }
    }

    info!(
        drugs = summary.drugs,
        alarms = summary.alarms.len() + summary.inactive_alarms,
        doses = summary.doses,
        "backup imported"
    );
    Ok(summary)
}
