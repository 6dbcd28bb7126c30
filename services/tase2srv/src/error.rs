//! Error handling for the TASE.2 bridge
//!
//! `Tase2Error` covers configuration import, TLS material loading and
//! session construction. Protocol operations report `ClientError` codes
//! (see `endpoint`) which never escape the operation boundary as panics.

use thiserror::Error;

use crate::endpoint::ClientError;

/// Bridge service error type
#[derive(Error, Debug, Clone)]
pub enum Tase2Error {
    /// Configuration document errors (structure, field types, values)
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// OSI selector / AP title parsing errors, abort the protocol import
    #[error("OSI configuration error: {0}")]
    OsiError(String),

    /// TLS material missing or unreadable
    #[error("TLS error: {0}")]
    TlsError(String),

    /// Endpoint (session object) construction or protocol failures
    #[error("Endpoint error: {0}")]
    EndpointError(String),

    /// Input/Output operation errors
    #[error("IO error: {0}")]
    IoError(String),

    /// JSON document errors
    #[error("JSON error: {0}")]
    JsonError(String),
}

/// Result type alias for the bridge
pub type Result<T> = std::result::Result<T, Tase2Error>;

impl Tase2Error {
    pub fn config(msg: impl Into<String>) -> Self {
        Tase2Error::ConfigError(msg.into())
    }

    pub fn osi(msg: impl Into<String>) -> Self {
        Tase2Error::OsiError(msg.into())
    }

    pub fn tls(msg: impl Into<String>) -> Self {
        Tase2Error::TlsError(msg.into())
    }

    pub fn endpoint(msg: impl Into<String>) -> Self {
        Tase2Error::EndpointError(msg.into())
    }
}

impl From<std::io::Error> for Tase2Error {
    fn from(err: std::io::Error) -> Self {
        Tase2Error::IoError(err.to_string())
    }
}

impl From<serde_json::Error> for Tase2Error {
    fn from(err: serde_json::Error) -> Self {
        Tase2Error::JsonError(err.to_string())
    }
}

impl From<ClientError> for Tase2Error {
    fn from(err: ClientError) -> Self {
        Tase2Error::EndpointError(err.to_string())
    }
}
