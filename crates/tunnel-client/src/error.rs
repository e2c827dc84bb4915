//! Client errors

use std::time::Duration;
use thiserror::Error;
use tunnel_proto::{TransactionId, ValidationError};
use tunnel_transport::TransportError;

/// Client errors
#[derive(Debug, Error)]
pub enum ClientError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("Failed to connect: {0}")]
    Dial(TransportError),

    #[error("Transport error: {0}")]
    Transport(TransportError),

    #[error("No acknowledgement received within {0:?}")]
    Timeout(Duration),

    #[error("Request rejected by server")]
    Rejected,

    #[error("Client stopped")]
    Stopped,

    #[error("Already listening on tunnel {0}")]
    AlreadyListening(String),

    #[error("Transaction {0} already awaiting acknowledgement")]
    TransactionInUse(TransactionId),

    #[error("Configuration error: {0}")]
    ConfigError(String),
}

impl ClientError {
    /// Returns true if this error is non-recoverable and retrying won't help
    pub fn is_non_recoverable(&self) -> bool {
        matches!(
            self,
            ClientError::Validation(_)
                | ClientError::Rejected
                | ClientError::Stopped
                | ClientError::AlreadyListening(_)
                | ClientError::ConfigError(_)
        )
    }

    /// Returns true if this error is recoverable and retrying might succeed
    pub fn is_recoverable(&self) -> bool {
        !self.is_non_recoverable()
    }
}
