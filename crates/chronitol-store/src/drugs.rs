use chrono::Utc;
use rusqlite::{params, OptionalExtension};
use tracing::instrument;

use chronitol_core::{Drug, DrugId};

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers::{format_timestamp, get};

const TABLE: &str = "drugs";

pub struct DrugRepo {
    db: Database,
}

impl DrugRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    #[instrument(skip(self))]
    pub fn create(&self, name: &str, is_active: bool) -> Result<Drug, StoreError> {
        let drug = Drug::new(name, is_active);
        self.insert(&drug)?;
        Ok(drug)
    }

    #[instrument(skip(self, drug), fields(drug_id = %drug.id))]
    pub fn insert(&self, drug: &Drug) -> Result<(), StoreError> {
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO drugs (id, name, is_active, created_at) VALUES (?1, ?2, ?3, ?4)",
                params![drug.id.as_str(), drug.name, drug.is_active, format_timestamp(Utc::now())],
            )?;
            Ok(())
        })
    }

    #[instrument(skip(self), fields(drug_id = %id))]
    pub fn get(&self, id: &DrugId) -> Result<Option<Drug>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare("SELECT id, name, is_active FROM drugs WHERE id = ?1")?;
            let mut rows = stmt.query([id.as_str()])?;
            match rows.next()? {
                Some(row) => Ok(Some(drug_from_row(row)?)),
                None => Ok(None),
            }
        })
    }

    #[instrument(skip(self, drug), fields(drug_id = %drug.id))]
    pub fn update(&self, drug: &Drug) -> Result<(), StoreError> {
        self.db.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE drugs SET name = ?2, is_active = ?3 WHERE id = ?1",
                params![drug.id.as_str(), drug.name, drug.is_active],
            )?;
            if changed == 0 {
                return Err(StoreError::not_found("drug", &drug.id));
            }
            Ok(())
        })
    }

    /// Deletes the drug; alarms and doses go with it through `ON DELETE CASCADE`.
    #[instrument(skip(self), fields(drug_id = %id))]
    pub fn delete(&self, id: &DrugId) -> Result<(), StoreError> {
        self.db.with_conn(|conn| {
            let changed = conn.execute("DELETE FROM drugs WHERE id = ?1", [id.as_str()])?;
            if changed == 0 {
                return Err(StoreError::not_found("drug", id));
            }
            Ok(())
        })
    }

    pub fn exists(&self, id: &DrugId) -> Result<bool, StoreError> {
        self.db.with_conn(|conn| {
            let found = conn
                .query_row("SELECT 1 FROM drugs WHERE id = ?1", [id.as_str()], |_| Ok(()))
                .optional()?;
            Ok(found.is_some())
        })
    }

    #[instrument(skip(self))]
    pub fn list(&self) -> Result<Vec<Drug>, StoreError> {
        self.query_list("SELECT id, name, is_active FROM drugs ORDER BY created_at, id")
    }

    /// Only drugs with `is_active` set.
    #[instrument(skip(self))]
    pub fn list_active(&self) -> Result<Vec<Drug>, StoreError> {
        self.query_list(
            "SELECT id, name, is_active FROM drugs WHERE is_active = 1 ORDER BY created_at, id",
        )
    }

    /// Removes every drug and, by cascade, every alarm and dose.
    #[instrument(skip(self))]
    pub fn delete_all(&self) -> Result<usize, StoreError> {
        self.db.with_tx(|tx| {
            let _ = tx.execute("DELETE FROM dose_entries", [])?;
            let _ = tx.execute("DELETE FROM alarms", [])?;
            Ok(tx.execute("DELETE FROM drugs", [])?)
        })
    }

    fn query_list(&self, sql: &str) -> Result<Vec<Drug>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(sql)?;
            let mut rows = stmt.query([])?;
            let mut drugs = Vec::new();
            while let Some(row) = rows.next()? {
                drugs.push(drug_from_row(row)?);
            }
            Ok(drugs)
        })
    }
}

fn drug_from_row(row: &rusqlite::Row<'_>) -> Result<Drug, StoreError> {
    Ok(Drug {
        id: DrugId::from_raw(get::<String>(row, 0, TABLE, "id")?),
        name: get(row, 1, TABLE, "name")?,
        is_active: get(row, 2, TABLE, "is_active")?,
    })
}
