//! Error types for the capacity engine

use thiserror::Error;

#[derive(Error, Debug)]
pub enum CapacityError {
    /// Worker, project, initiative or commitment does not exist
    #[error("Not found: {0}")]
    NotFound(String),

    /// Percentage outside [0, 100] or malformed identifier
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// The active allocation backend cannot be reached
    #[error("Backend unavailable ({backend}): {reason}")]
    BackendUnavailable { backend: &'static str, reason: String },

    /// Commitment already exists for this (worker, target) pair
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Non-transient backend fault (constraint violation, corrupt row, ...)
    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, CapacityError>;

impl CapacityError {
    /// Prefix the message with the failing operation, keeping the variant.
    pub fn context(self, operation: &str, subject: impl std::fmt::Display) -> Self {
        let prefix = format!("{} ({})", operation, subject);
        match self {
            Self::NotFound(msg) => Self::NotFound(format!("{}: {}", prefix, msg)),
            Self::InvalidArgument(msg) => Self::InvalidArgument(format!("{}: {}", prefix, msg)),
            Self::BackendUnavailable { backend, reason } => Self::BackendUnavailable {
                backend,
                reason: format!("{}: {}", prefix, reason),
            },
            Self::Conflict(msg) => Self::Conflict(format!("{}: {}", prefix, msg)),
            Self::Storage(msg) => Self::Storage(format!("{}: {}", prefix, msg)),
            other => other,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    pub fn is_backend_unavailable(&self) -> bool {
        matches!(self, Self::BackendUnavailable { .. })
    }
}
