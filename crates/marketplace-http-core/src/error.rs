//! Error types for the marketplace HTTP core library
//!
//! Classified call failures travel as [`HttpError`]; everything that can go
//! wrong before a request is ever sent (configuration, pipeline assembly,
//! URL resolution) is reported through the other variants so that it fails
//! at construction time.

use thiserror::Error;

use crate::http::error::{ErrorKind, HttpError};

/// Main error type for marketplace HTTP operations
#[derive(Error, Debug)]
pub enum Error {
    /// A call failed and was classified by the response classifier
    #[error(transparent)]
    Http(#[from] HttpError),

    /// Configuration or pipeline assembly errors
    #[error("Configuration error: {message}")]
    Configuration {
        message: String,
        #[source]
        source: Option<anyhow::Error>,
    },

    /// JSON parsing and serialization errors
    #[error("JSON error: {message}")]
    Json {
        message: String,
        #[source]
        source: serde_json::Error,
    },

    /// IO errors
    #[error("IO error: {message}")]
    Io {
        message: String,
        #[source]
        source: std::io::Error,
    },

    /// URL parsing or resolution errors
    #[error("Invalid URL: {message}")]
    Url {
        message: String,
        #[source]
        source: url::ParseError,
    },
}

/// Convenience type alias for Results using our Error type
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Shorthand for a configuration error without a source
    pub fn configuration(message: impl Into<String>) -> Self {
        Error::Configuration {
            message: message.into(),
            source: None,
        }
    }

    /// The classified kind, if this is a failed call
    pub fn kind(&self) -> Option<ErrorKind> {
        match self {
            Error::Http(http) => Some(http.kind),
            _ => None,
        }
    }

    /// The classified HTTP error, if this is a failed call
    pub fn as_http(&self) -> Option<&HttpError> {
        match self {
            Error::Http(http) => Some(http),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(source: serde_json::Error) -> Self {
        Error::Json {
            message: source.to_string(),
            source,
        }
    }
}

impl From<url::ParseError> for Error {
    fn from(source: url::ParseError) -> Self {
        Error::Url {
            message: source.to_string(),
            source,
        }
    }
}
