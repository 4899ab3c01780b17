use chrono::Utc;
use rusqlite::params;
use tracing::instrument;

use chronitol_core::{Alarm, AlarmId, AlarmTime, DrugId};

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers::{format_timestamp, get, get_clock_component};

const TABLE: &str = "alarms";
const COLUMNS: &str = "id, drug_id, hour, minute";

pub struct AlarmRepo {
    db: Database,
}

impl AlarmRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    #[instrument(skip(self), fields(drug_id = %drug_id, time = %time))]
    pub fn create(&self, drug_id: &DrugId, time: AlarmTime) -> Result<Alarm, StoreError> {
        let alarm = Alarm::new(drug_id.clone(), time);
        self.insert(&alarm)?;
        Ok(alarm)
    }

    /// Insert keeping the alarm's id. Fails with `Conflict` when the id is
    /// taken or the drug does not exist.
    #[instrument(skip(self, alarm), fields(alarm_id = %alarm.id))]
    pub fn insert(&self, alarm: &Alarm) -> Result<(), StoreError> {
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO alarms (id, drug_id, hour, minute, created_at) VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    alarm.id.as_str(),
                    alarm.drug_id.as_str(),
                    alarm.hour(),
                    alarm.minute(),
                    format_timestamp(Utc::now()),
                ],
            )?;
            Ok(())
        })
    }

    #[instrument(skip(self), fields(alarm_id = %id))]
    pub fn get(&self, id: &AlarmId) -> Result<Option<Alarm>, StoreError> {
        let sql = format!("SELECT {COLUMNS} FROM alarms WHERE id = ?1");
        Ok(self.query(&sql, id.as_str())?.into_iter().next())
    }

    /// A drug's alarms in time-of-day order.
    #[instrument(skip(self), fields(drug_id = %drug_id))]
    pub fn list_for_drug(&self, drug_id: &DrugId) -> Result<Vec<Alarm>, StoreError> {
        let sql = format!("SELECT {COLUMNS} FROM alarms WHERE drug_id = ?1 ORDER BY hour, minute, id");
        self.query(&sql, drug_id.as_str())
    }

    #[instrument(skip(self, alarm), fields(alarm_id = %alarm.id))]
    pub fn update(&self, alarm: &Alarm) -> Result<(), StoreError> {
        self.db.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE alarms SET hour = ?2, minute = ?3 WHERE id = ?1",
                params![alarm.id.as_str(), alarm.hour(), alarm.minute()],
            )?;
            if changed == 0 {
                return Err(StoreError::not_found("alarm", &alarm.id));
            }
            Ok(())
        })
    }

    #[instrument(skip(self), fields(alarm_id = %id))]
    pub fn delete(&self, id: &AlarmId) -> Result<(), StoreError> {
        self.db.with_conn(|conn| {
            let changed = conn.execute("DELETE FROM alarms WHERE id = ?1", [id.as_str()])?;
            if changed == 0 {
                return Err(StoreError::not_found("alarm", id));
            }
            Ok(())
        })
    }

    fn query(&self, sql: &str, key: &str) -> Result<Vec<Alarm>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(sql)?;
            let mut rows = stmt.query([key])?;
            let mut alarms = Vec::new();
            while let Some(row) = rows.next()? {
                alarms.push(alarm_from_row(row)?);
            }
            Ok(alarms)
        })
    }
}

fn alarm_from_row(row: &rusqlite::Row<'_>) -> Result<Alarm, StoreError> {
    let hour = get_clock_component(row, 2, TABLE, "hour", 23)?;
    let minute = get_clock_component(row, 3, TABLE, "minute", 59)?;
    Ok(Alarm::with_id(
        AlarmId::from_raw(get::<String>(row, 0, TABLE, "id")?),
        DrugId::from_raw(get::<String>(row, 1, TABLE, "drug_id")?),
        AlarmTime::new(hour, minute),
    ))
}
