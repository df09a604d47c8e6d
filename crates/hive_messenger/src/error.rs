//! Messenger error types.

/// Errors that can occur in the hive_messenger crate.
///
/// Most protocol conditions (echoes, foreign traffic, duplicates, gaps) are
/// expected on a shared channel and never surface as errors.
#[derive(Debug, thiserror::Error)]
pub enum MessengerError {
    /// The transport refused or failed to submit an envelope.
    #[error("Transport error: {0}")]
    Transport(String),

    /// JSON serialization / deserialization failed.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The configuration is invalid.
    #[error("Configuration error: {0}")]
    Config(String),

    /// The application tried to send one of the reserved control types.
    #[error("Reserved message type: {0}")]
    ReservedType(String),

    /// The messenger has been destroyed and is inert.
    #[error("Messenger destroyed")]
    Destroyed,

    /// Construction needs a running Tokio runtime for the beacon task.
    #[error("No Tokio runtime available")]
    NoRuntime,

    /// A global tracing subscriber could not be installed.
    #[error("Logging error: {0}")]
    Logging(String),

    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
