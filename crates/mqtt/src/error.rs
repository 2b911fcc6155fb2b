//! Error type for the MQTT session layer.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum TransferError {
    #[error("Client setup error: {0}")]
    ClientSetup(String),

    #[error("Configuration error: {0}")]
    ConfigError(#[from] validator::ValidationErrors),

    /// The request could not be queued on the client channel.
    #[error("Client transfer error: {0}")]
    ClientTransfer(#[from] rumqttc::ClientError),

    #[error("Client connection error: {0}")]
    ClientConnection(#[from] Box<rumqttc::ConnectionError>),

    #[error("Retry policy error: {0}")]
    RetriesPolicy(#[from] super::backoff::BackoffError),

    /// The session is not in the `Connected` state.
    #[error("Not connected to broker")]
    NotConnected,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<rumqttc::ConnectionError> for TransferError {
    fn from(err: rumqttc::ConnectionError) -> Self {
        TransferError::ClientConnection(Box::new(err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transfer_error_display() {
        assert_eq!(
            TransferError::NotConnected.to_string(),
            "Not connected to broker"
        );
        let err = TransferError::ClientSetup("bad client id".into());
        assert_eq!(err.to_string(), "Client setup error: bad client id");
    }

    #[test]
    fn test_transfer_error_from_connection_error() {
        let err: TransferError = rumqttc::ConnectionError::NetworkTimeout.into();
        assert!(matches!(err, TransferError::ClientConnection(_)));
    }
}
