use thiserror::Error;

use super::storage::StorageError;

#[derive(Debug, Error)]
pub enum InfraError {
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("telemetry initialization failed: {0}")]
    Telemetry(String),
}

impl InfraError {
    pub fn telemetry(message: impl Into<String>) -> Self {
        Self::Telemetry(message.into())
    }
}
