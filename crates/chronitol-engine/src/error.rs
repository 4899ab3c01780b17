use chronitol_core::{CalendarError, NotificationError, PersistenceError};
use chronitol_store::StoreError;

/// Errors surfaced by engine operations. None of them are fatal to the
/// process; callers log and carry on.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("persistence error: {0}")]
    Persistence(#[from] PersistenceError),

    #[error("notification error: {0}")]
    Notification(#[from] NotificationError),

    #[error("calendar error: {0}")]
    Calendar(#[from] CalendarError),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    #[error("delayed reminder file error: {0}")]
    DelayedFile(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl EngineError {
    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    /// Missing rows, whether reported by the engine or by the gateway.
    pub fn is_not_found(&self) -> bool {
        match self {
            Self::NotFound { .. } => true,
            Self::Persistence(e) => e.is_not_found(),
            _ => false,
        }
    }
}
