use crate::notifications::NotificationError;
use crate::reference::ReferenceError;
use crate::semantic::sanitize::SanitizationError;
use crate::semantic::{EmbeddingError, SyncError};

#[derive(thiserror::Error, Debug)]
pub enum AppError {
    #[error("note {0} not found")]
    NotFound(String),

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("{0}")]
    Sanitization(#[from] SanitizationError),

    #[error("{0}")]
    Embedding(#[from] EmbeddingError),

    #[error("{0}")]
    Reference(ReferenceError),

    #[error("{0}")]
    Notification(#[from] NotificationError),

    #[error("unexpected error: {0:?}")]
    Other(#[from] anyhow::Error),
}

impl From<ReferenceError> for AppError {
    fn from(err: ReferenceError) -> Self {
        match err {
            ReferenceError::NotFound(uri) => AppError::NotFound(uri),
            err => AppError::Reference(err),
        }
    }
}

impl From<SyncError> for AppError {
    fn from(err: SyncError) -> Self {
        match err {
            SyncError::NoteNotFound(uri) => AppError::NotFound(uri),
            SyncError::Sanitization(err) => err.into(),
            SyncError::Embedding(err) => err.into(),
            SyncError::Reference(err) => err.into(),
            SyncError::Store(err) => AppError::Other(err),
            err @ (SyncError::Index(_) | SyncError::NotLoaded) => AppError::Other(err.into()),
        }
    }
}
