//! Error types for the core framework.
//!
//! [`CoreError`] covers the failures the framework itself can raise while
//! preparing or finishing a request. Errors raised by user actions travel
//! as [`anyhow::Error`] and are turned into responses by the
//! [`Dispatcher`](crate::dispatch::Dispatcher).

/// Errors that can occur in the core framework layer.
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    /// The request body could not be read.
    #[error("failed to read request body: {0}")]
    Body(String),

    /// The request body claimed to be JSON but did not parse.
    #[error("invalid JSON body: {0}")]
    Json(#[from] serde_json::Error),

    /// A header value could not be set on the response.
    #[error("invalid header: {0}")]
    Header(String),

    /// An application with the same name was already mounted.
    #[error("application already mounted: {0}")]
    DuplicateApplication(String),
}
