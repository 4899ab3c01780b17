/// Failures surfaced by a persistence gateway.
#[derive(Clone, Debug, thiserror::Error)]
pub enum PersistenceError {
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("corrupt record: {0}")]
    Corrupt(String),
    #[error("storage failure: {0}")]
    Storage(String),
}

impl PersistenceError {
    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// Short classification string for logging.
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::NotFound { .. } => "not_found",
            Self::Conflict(_) => "conflict",
            Self::Corrupt(_) => "corrupt",
            Self::Storage(_) => "storage",
        }
    }
}

/// Failures from the OS notification service.
#[derive(Clone, Debug, thiserror::Error)]
pub enum NotificationError {
    #[error("notification authorization denied")]
    AuthorizationDenied,
    #[error("failed to add notification request {id}: {reason}")]
    AddFailed { id: String, reason: String },
    #[error("notification center unavailable: {0}")]
    Unavailable(String),
}

impl NotificationError {
    pub fn is_authorization(&self) -> bool {
        matches!(self, Self::AuthorizationDenied)
    }

    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::AuthorizationDenied => "authorization_denied",
            Self::AddFailed { .. } => "add_failed",
            Self::Unavailable(_) => "unavailable",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum CalendarError {
    #[error("unknown time zone: {0}")]
    UnknownZone(String),
}
