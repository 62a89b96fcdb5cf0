//! Error types for the data layer.
//!
//! Lookups of unknown names fail with [`LookupError`] at the point of use.
//! Everything else is a [`DataError`], which also wraps the underlying
//! [`fred`] and `serde_json` errors of the Redis adapter.

/// A name did not resolve.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LookupError {
    /// No source with this name.
    #[error("unknown source `{0}`")]
    Source(String),

    /// The source has no command with this name.
    #[error("unknown command `{command}` for source `{source_name}`")]
    Command {
        /// The source.
        source_name: String,
        /// The missing command.
        command: String,
    },

    /// The source has no query with this name.
    #[error("unknown query `{query}` for source `{source_name}`")]
    Query {
        /// The source.
        source_name: String,
        /// The missing query.
        query: String,
    },

    /// The source has no association with this name.
    #[error("unknown association `{association}` for source `{source_name}`")]
    Association {
        /// The source.
        source_name: String,
        /// The missing association.
        association: String,
    },

    /// No subscription handler registered under this name.
    #[error("unknown subscription handler `{0}`")]
    Handler(String),
}

/// Errors that can occur in the data layer.
#[derive(Debug, thiserror::Error)]
pub enum DataError {
    /// A name did not resolve.
    #[error(transparent)]
    Lookup(#[from] LookupError),

    /// Source definitions are inconsistent.
    #[error("invalid definition: {0}")]
    Definition(String),

    /// A query was called with the wrong number of arguments.
    #[error("query `{query}` takes {expected} argument(s), got {got}")]
    Arity {
        /// The query.
        query: String,
        /// Declared arity.
        expected: usize,
        /// Arguments passed.
        got: usize,
    },

    /// A value could not be coerced to its attribute type.
    #[error("`{source_name}.{attribute}` {message}")]
    InvalidValue {
        /// The source.
        source_name: String,
        /// The attribute.
        attribute: String,
        /// Why the value was rejected.
        message: String,
    },

    /// A command body failed.
    #[error("command `{command}` failed: {message}")]
    Command {
        /// The command.
        command: String,
        /// The failure, with its cause chain.
        message: String,
    },

    /// A Redis operation failed.
    #[error("Redis error: {0}")]
    Redis(#[from] fred::error::Error),

    /// A serialization or deserialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A configuration error.
    #[error("Configuration error: {0}")]
    Config(String),
}
