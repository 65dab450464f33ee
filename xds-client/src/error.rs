//! Error types for the xDS client.

use thiserror::Error;

/// Error type for the xDS client.
#[derive(Debug, Clone, Error)]
pub enum Error {
    /// Failed to establish a connection to the xDS server.
    #[error("connection error: {0}")]
    Connection(String),

    /// The ADS stream was closed by the server.
    #[error("ADS stream closed")]
    StreamClosed,

    /// The ADS stream failed with a gRPC status.
    #[cfg(feature = "transport-tonic")]
    #[error("ADS stream error: {0}")]
    Stream(tonic::Status),

    /// A message could not be decoded.
    #[cfg(feature = "codegen-prost")]
    #[error("decode error: {0}")]
    Decode(#[from] prost::DecodeError),

    /// A resource or configuration value failed validation.
    #[error("validation error: {0}")]
    Validation(String),

    /// The resource was not sent by the server before the watch expired, or
    /// was removed from a state-of-the-world response.
    #[error("resource does not exist")]
    ResourceDoesNotExist,

    /// No xDS server is configured.
    #[error("no xDS server configured")]
    NoServer,
}

/// Result type alias for xDS client operations.
pub type Result<T> = std::result::Result<T, Error>;
