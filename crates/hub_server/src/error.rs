use player_sync::{BusError, StoreError};
use thiserror::Error;

/// Errors raised while running the hub.
#[derive(Error, Debug)]
pub enum HubError {
    #[error("Network error: {0}")]
    Network(String),
    #[error("Store error: {0}")]
    Store(#[from] StoreError),
    #[error("Configuration error: {0}")]
    Config(String),
    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<BusError> for HubError {
    fn from(error: BusError) -> Self {
        match error {
            BusError::Store(e) => Self::Store(e),
            BusError::Send { .. } => Self::Network(error.to_string()),
            other => Self::Internal(other.to_string()),
        }
    }
}
