//! Change notifications pushed by the reference service.
//!
//! Messages arrive wrapped in a pub/sub envelope whose `data` field is the
//! base64 encoded JSON notification.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::{Deserialize, Serialize};

use crate::semantic::{IndexSynchronizer, SyncError};

#[derive(Debug, thiserror::Error)]
pub enum NotificationError {
    #[error("Base64: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("malformed notification: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotificationKind {
    Upsert,
    Deletion,
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    #[serde(rename = "type")]
    pub kind: NotificationKind,
    pub uri: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnvelopeMessage {
    pub data: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub message: EnvelopeMessage,
}

impl Envelope {
    pub fn decode(&self) -> Result<Notification, NotificationError> {
        let raw = STANDARD.decode(self.message.data.trim())?;
        Ok(serde_json::from_slice(&raw)?)
    }

    pub fn wrap(notification: &Notification) -> Result<Self, NotificationError> {
        let json = serde_json::to_vec(notification)?;
        Ok(Self {
            message: EnvelopeMessage {
                data: STANDARD.encode(json),
            },
        })
    }
}

/// Apply one notification to the index. Failures and unknown kinds are
/// logged, never returned to the sender.
pub async fn handle(synchronizer: &IndexSynchronizer, notification: Notification) {
    let result: Result<(), SyncError> = match notification.kind {
        NotificationKind::Upsert => synchronizer.upsert_note(&notification.uri).await.map(|_| ()),
        NotificationKind::Deletion => synchronizer.delete_note(&notification.uri).await.map(|_| ()),
        NotificationKind::Unknown => {
            log::warn!("ignoring notification of unknown type for {}", notification.uri);
            return;
        }
    };

    match result {
        Ok(()) => log::info!("applied {:?} of {}", notification.kind, notification.uri),
        Err(SyncError::NoteNotFound(uri)) if notification.kind == NotificationKind::Deletion => {
            log::info!("note {uri} already deleted")
        }
        Err(err) => log::error!(
            "{:?} of {} failed: {err}",
            notification.kind,
            notification.uri
        ),
    }
}
