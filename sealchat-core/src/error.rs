//! Error types for the chat core

use thiserror::Error;

use crate::crypto::CryptoError;

/// Coarse classification callers branch on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Validation,
    Crypto,
    NotFound,
    Transport,
    Persistence,
}

#[derive(Error, Debug)]
pub enum CoreError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Remote error: {0}")]
    Remote(String),

    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("{source}; recording the failure status also failed: {status_error}")]
    StatusUpdate {
        source: Box<CoreError>,
        status_error: Box<CoreError>,
    },
}

impl CoreError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            CoreError::Validation(_) => ErrorKind::Validation,
            CoreError::Crypto(_) => ErrorKind::Crypto,
            CoreError::NotFound(_) => ErrorKind::NotFound,
            CoreError::Transport(_) | CoreError::Remote(_) => ErrorKind::Transport,
            CoreError::Persistence(_)
            | CoreError::Database(_)
            | CoreError::Migration(_)
            | CoreError::Serialization(_) => ErrorKind::Persistence,
            CoreError::StatusUpdate { source, .. } => source.kind(),
        }
    }

    /// Attach a failed status write to the error that caused it
    pub fn with_status_error(self, status_error: CoreError) -> Self {
        CoreError::StatusUpdate {
            source: Box::new(self),
            status_error: Box::new(status_error),
        }
    }
}

pub type CoreResult<T> = Result<T, CoreError>;
