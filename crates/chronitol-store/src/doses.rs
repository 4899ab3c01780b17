use chrono::{DateTime, SubsecRound, Utc};
use rusqlite::params;
use tracing::instrument;

use chronitol_core::{Calendar, DoseEntry, DoseId, DrugId};

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers::{format_timestamp, get, get_timestamp};

const TABLE: &str = "dose_entries";
const COLUMNS: &str = "id, drug_id, timestamp, date";

pub struct DoseRepo {
    db: Database,
    calendar: Calendar,
}

impl DoseRepo {
    pub fn new(db: Database, calendar: Calendar) -> Self {
        Self { db, calendar }
    }

    /// Log a dose. Sub-microsecond precision is dropped so the returned
    /// entry equals what a later read yields.
    #[instrument(skip(self), fields(drug_id = %drug_id))]
    pub fn create(&self, drug_id: &DrugId, timestamp: DateTime<Utc>) -> Result<DoseEntry, StoreError> {
        let dose = DoseEntry::new(drug_id.clone(), timestamp.trunc_subsecs(6), &self.calendar);
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO dose_entries (id, drug_id, timestamp, date) VALUES (?1, ?2, ?3, ?4)",
                params![
                    dose.id.as_str(),
                    dose.drug_id.as_str(),
                    format_timestamp(dose.timestamp()),
                    format_timestamp(dose.date()),
                ],
            )?;
            Ok(())
        })?;
        Ok(dose)
    }

    #[instrument(skip(self), fields(dose_id = %id))]
    pub fn get(&self, id: &DoseId) -> Result<Option<DoseEntry>, StoreError> {
        let sql = format!("SELECT {COLUMNS} FROM dose_entries WHERE id = ?1");
        Ok(self.query(&sql, Some(id.as_str()))?.into_iter().next())
    }

    /// Move a dose in time. `timestamp` and `date` change in the same statement.
    #[instrument(skip(self), fields(dose_id = %id))]
    pub fn update_timestamp(&self, id: &DoseId, timestamp: DateTime<Utc>) -> Result<DoseEntry, StoreError> {
        let mut dose = self.get(id)?.ok_or_else(|| StoreError::not_found("dose", id))?;
        dose.update_timestamp(timestamp.trunc_subsecs(6), &self.calendar);
        self.db.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE dose_entries SET timestamp = ?2, date = ?3 WHERE id = ?1",
                params![
                    id.as_str(),
                    format_timestamp(dose.timestamp()),
                    format_timestamp(dose.date()),
                ],
            )?;
            if changed == 0 {
                return Err(StoreError::not_found("dose", id));
            }
            Ok(())
        })?;
        Ok(dose)
    }

    #[instrument(skip(self), fields(dose_id = %id))]
    pub fn delete(&self, id: &DoseId) -> Result<(), StoreError> {
        self.db.with_conn(|conn| {
            let changed = conn.execute("DELETE FROM dose_entries WHERE id = ?1", [id.as_str()])?;
            if changed == 0 {
                return Err(StoreError::not_found("dose", id));
            }
            Ok(())
        })
    }

    /// A drug's doses, oldest first.
    #[instrument(skip(self), fields(drug_id = %drug_id))]
    pub fn list_for_drug(&self, drug_id: &DrugId) -> Result<Vec<DoseEntry>, StoreError> {
        let sql = format!("SELECT {COLUMNS} FROM dose_entries WHERE drug_id = ?1 ORDER BY timestamp, id");
        self.query(&sql, Some(drug_id.as_str()))
    }

    /// Every dose, most recent first.
    #[instrument(skip(self))]
    pub fn history(&self) -> Result<Vec<DoseEntry>, StoreError> {
        let sql = format!("SELECT {COLUMNS} FROM dose_entries ORDER BY timestamp DESC, id DESC");
        self.query(&sql, None)
    }

    fn query(&self, sql: &str, key: Option<&str>) -> Result<Vec<DoseEntry>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(sql)?;
            let mut rows = match key {
                Some(key) => stmt.query([key])?,
                None => stmt.query([])?,
            };
            let mut doses = Vec::new();
            while let Some(row) = rows.next()? {
                doses.push(dose_from_row(row)?);
            }
            Ok(doses)
        })
    }
}

fn dose_from_row(row: &rusqlite::Row<'_>) -> Result<DoseEntry, StoreError> {
    Ok(DoseEntry::from_parts(
        DoseId::from_raw(get::<String>(row, 0, TABLE, "id")?),
        DrugId::from_raw(get::<String>(row, 1, TABLE, "drug_id")?),
        get_timestamp(row, 2, TABLE, "timestamp")?,
        get_timestamp(row, 3, TABLE, "date")?,
    ))
}
