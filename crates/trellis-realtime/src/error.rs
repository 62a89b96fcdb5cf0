//! Error types for the realtime server.

/// Errors that can occur in the realtime layer.
#[derive(Debug, thiserror::Error)]
pub enum RealtimeError {
    /// A Redis operation failed.
    #[error("Redis error: {0}")]
    Redis(#[from] fred::error::Error),

    /// A message could not be encoded or decoded.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The data layer failed.
    #[error(transparent)]
    Data(#[from] trellis_data::DataError),

    /// A configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// The channel adapter's message stream was already taken.
    #[error("channel adapter is already listening")]
    AlreadyListening,
}
