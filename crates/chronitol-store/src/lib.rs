pub mod alarms;
pub mod backup;
pub mod database;
pub mod doses;
pub mod drugs;
pub mod error;
pub mod gateway;
pub mod row_helpers;
pub mod schema;

pub use backup::{BackupAlarm, BackupDose, BackupDrug, ImportSummary};
pub use database::Database;
pub use error::StoreError;
pub use gateway::SqliteGateway;
