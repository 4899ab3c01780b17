//! Durable list of delayed reminders, kept in a JSON file beside the database.
//!
//! Every mutation is load-modify-save under one async mutex. The file is
//! replaced atomically (temp file, then rename). A failed save leaves the
//! in-memory list unchanged.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tracing::{debug, instrument, warn};

use chronitol_core::{AlarmId, DelayKind, DelayedReminderRecord};

use crate::error::EngineError;

pub struct DelayedReminderStore {
    path: Option<PathBuf>,
    records: Mutex<Vec<DelayedReminderRecord>>,
}

impl DelayedReminderStore {
    /// Open the store at `path`. A missing file is an empty store; an
    /// unreadable one is logged and treated as empty.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self, EngineError> {
        let path = path.into();
        let records = match tokio::fs::read_to_string(&path).await {
            Ok(raw) if raw.trim().is_empty() => Vec::new(),
            Ok(raw) => match serde_json::from_str::<Vec<DelayedReminderRecord>>(&raw) {
                Ok(records) => records,
                Err(error) => {
                    warn!(path = %path.display(), %error, "delayed reminder file is corrupt, starting empty");
                    Vec::new()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(file_error(e)),
        };
        debug!(path = %path.display(), count = records.len(), "delayed reminders loaded");
        Ok(Self {
            path: Some(path),
            records: Mutex::new(records),
        })
    }

    pub fn in_memory() -> Self {
        Self {
            path: None,
            records: Mutex::new(Vec::new()),
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Remember a one-shot reminder for `alarm_id`. Duplicates are kept.
    pub async fn record_delay(&self, alarm_id: &AlarmId, fire_after: DateTime<Utc>) -> Result<(), EngineError> {
        self.record(DelayedReminderRecord::one_shot(alarm_id.clone(), fire_after))
            .await
    }

    #[instrument(skip(self, record), fields(alarm_id = %record.alarm_reference_id, kind = ?record.kind))]
    pub async fn record(&self, record: DelayedReminderRecord) -> Result<(), EngineError> {
        let mut records = self.records.lock().await;
        let mut next = records.clone();
        next.push(record);
        self.save(&next).await?;
        *records = next;
        Ok(())
    }

    /// Drop every record for `alarm_id`. Returns how many were removed.
    #[instrument(skip(self), fields(alarm_id = %alarm_id))]
    pub async fn remove_for_alarm(&self, alarm_id: &AlarmId) -> Result<usize, EngineError> {
        let mut records = self.records.lock().await;
        let next: Vec<_> = records
            .iter()
            .filter(|r| &r.alarm_reference_id != alarm_id)
            .cloned()
            .collect();
        let removed = records.len() - next.len();
        if removed > 0 {
            self.save(&next).await?;
            *records = next;
        }
        Ok(removed)
    }

    /// Drop the one-shot records for `alarm_id`, keeping recurring ones.
    #[instrument(skip(self), fields(alarm_id = %alarm_id))]
    pub async fn remove_one_shots(&self, alarm_id: &AlarmId) -> Result<usize, EngineError> {
        let mut records = self.records.lock().await;
        let next: Vec<_> = records
            .iter()
            .filter(|r| !(&r.alarm_reference_id == alarm_id && r.kind == DelayKind::OneShot))
            .cloned()
            .collect();
        let removed = records.len() - next.len();
        if removed > 0 {
            self.save(&next).await?;
            *records = next;
        }
        Ok(removed)
    }

    /// Drop the first record equal to `record`.
    pub async fn remove(&self, record: &DelayedReminderRecord) -> Result<bool, EngineError> {
        let mut records = self.records.lock().await;
        let Some(idx) = records.iter().position(|r| r == record) else {
            return Ok(false);
        };
        let mut next = records.clone();
        let _ = next.remove(idx);
        self.save(&next).await?;
        *records = next;
        Ok(true)
    }

    /// Records whose fire time is at or before `now`, earliest first.
    pub async fn due(&self, now: DateTime<Utc>) -> Vec<DelayedReminderRecord> {
        let mut due: Vec<_> = self
            .records
            .lock()
            .await
            .iter()
            .filter(|r| r.fire_after <= now)
            .cloned()
            .collect();
        due.sort_by_key(|r| r.fire_after);
        due
    }

    pub async fn all(&self) -> Vec<DelayedReminderRecord> {
        self.records.lock().await.clone()
    }

    pub async fn clear(&self) -> Result<(), EngineError> {
        let mut records = self.records.lock().await;
        self.save(&[]).await?;
        records.clear();
        Ok(())
    }

    async fn save(&self, records: &[DelayedReminderRecord]) -> Result<(), EngineError> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(file_error)?;
        }
        let json = serde_json::to_vec_pretty(records).map_err(file_error)?;
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, json).await.map_err(file_error)?;
        tokio::fs::rename(&tmp, path).await.map_err(file_error)?;
        Ok(())
    }
}

fn file_error(e: impl std::fmt::Display) -> EngineError {
    EngineError::DelayedFile(e.to_string())
}
