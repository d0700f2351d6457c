use shared::domain::DeviceId;
use storage::StoreError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SessionError {
    /// Rejected before anything was written; session state is unchanged.
    #[error("{0}")]
    Validation(String),
    #[error("device {device_id} is currently controlled by \"{holder}\"")]
    LeaseConflict { device_id: DeviceId, holder: String },
    #[error("store unavailable: {0}")]
    StoreUnavailable(#[from] StoreError),
    #[error("connect attempt was cancelled by a disconnect")]
    Cancelled,
}

impl SessionError {
    pub fn validation(message: impl Into<String>) -> Self {
        SessionError::Validation(message.into())
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, SessionError::LeaseConflict { .. })
    }
}
