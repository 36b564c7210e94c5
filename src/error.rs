//! Error taxonomy shared by the store, the queue transport and the pipeline

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// Referenced conversation or user does not exist
    #[error("not found: {0}")]
    NotFound(String),

    /// Malformed input; never enters the pipeline
    #[error("validation failed: {0}")]
    Validation(String),

    /// Duplicate conversation id
    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// Store or transport temporarily unavailable
    #[error("infrastructure unavailable: {0}")]
    TransientInfra(String),

    /// Operation against a channel the broker already closed
    #[error("channel {0} is closed")]
    ChannelClosed(String),

    /// Content-analysis collaborator failed
    #[error("content analysis failed: {0}")]
    Analysis(String),

    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("unexpected error: {0}")]
    Unexpected(String),
}

impl Error {
    /// Stable code persisted into `conversation_events.error_code`
    pub fn code(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "NOT_FOUND",
            Self::Validation(_) => "VALIDATION_ERROR",
            Self::AlreadyExists(_) => "ALREADY_EXISTS",
            Self::TransientInfra(_) => "TRANSIENT_INFRA",
            Self::ChannelClosed(_) => "CHANNEL_CLOSED",
            Self::Analysis(_) => "ANALYSIS_ERROR",
            Self::Sqlite(err) if is_sqlite_unavailable(err) => "TRANSIENT_INFRA",
            Self::Sqlite(_) => "SQLITE_ERROR",
            Self::Json(_) => "JSON_ERROR",
            Self::Io(_) => "IO_ERROR",
            Self::Unexpected(_) => "UNEXPECTED_ERROR",
        }
    }

    /// Connection-level failure: callers reconnect instead of failing the event
    pub fn is_infra(&self) -> bool {
        match self {
            Self::TransientInfra(_) | Self::ChannelClosed(_) | Self::Io(_) => true,
            Self::Sqlite(err) => is_sqlite_unavailable(err),
            _ => false,
        }
    }

    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::NotFound(_) | Self::Validation(_))
    }
}

/// Busy, locked, or unopenable database
pub fn is_sqlite_unavailable(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(inner, _)
            if matches!(
                inner.code,
                rusqlite::ErrorCode::DatabaseBusy
                    | rusqlite::ErrorCode::DatabaseLocked
                    | rusqlite::ErrorCode::CannotOpen
            )
    )
}

pub fn is_unique_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(inner, _)
            if inner.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE
    )
}
