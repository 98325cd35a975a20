use std::sync::Arc;

use thiserror::Error;

/// Result type used by synchronization and lifecycle operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors produced while synchronizing templates or managing background threads.
///
/// Evaluation itself never returns this type: evaluation failures resolve to a fallback value with
/// [`EvaluationReason::Error`](crate::EvaluationReason::Error).
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum Error {
    /// `endpoint_url` or `metrics_endpoint` could not be parsed.
    #[error("invalid endpoint url")]
    InvalidEndpointUrl(#[source] url::ParseError),

    /// The server rejected the API token.
    #[error("unauthorized, api_token is likely invalid")]
    Unauthorized,

    /// The server answered with a status that is neither 2xx nor 304.
    #[error("unexpected response status: {0}")]
    UnexpectedStatus(u16),

    /// The response body is not a valid template document.
    #[error("malformed template document")]
    MalformedTemplate(#[source] Arc<serde_json::Error>),

    /// Network error.
    #[error(transparent)]
    Network(Arc<reqwest::Error>),

    /// An I/O error.
    #[error(transparent)]
    // std::io::Error is not clonable, so we're wrapping it in an Arc.
    Io(Arc<std::io::Error>),

    /// A background thread panicked. This should normally never happen.
    #[error("background thread panicked")]
    PollerThreadPanicked,

    /// No template has been loaded yet.
    #[error("template has not been loaded yet")]
    TemplateMissing,
}

impl From<std::io::Error> for Error {
    fn from(value: std::io::Error) -> Self {
        Self::Io(Arc::new(value))
    }
}

impl From<reqwest::Error> for Error {
    fn from(value: reqwest::Error) -> Self {
        Error::Network(Arc::new(value.without_url()))
    }
}

impl From<serde_json::Error> for Error {
    fn from(value: serde_json::Error) -> Self {
        Error::MalformedTemplate(Arc::new(value))
    }
}

/// Reasons a flag could not be evaluated against rules.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum EvaluationError {
    /// No template has been loaded yet.
    #[error("template missing")]
    TemplateMissing,

    /// The requested flag does not exist in the current template.
    #[error("flag not found")]
    FlagNotFound,

    /// The flag exists but its definition could not be parsed.
    #[error("flag definition could not be parsed")]
    FlagParseError,
}
