use thiserror::Error;

/// Application-wide error types for the harvester.
#[derive(Error, Debug)]
pub enum AppError {
    /// HTTP request failed or returned an unexpected status.
    #[error("HTTP error: {0}")]
    HttpError(String),

    /// Network/connection error.
    #[error("Network error: {0}")]
    NetworkError(String),

    /// Request timed out.
    #[error("Request timed out after {0} seconds")]
    Timeout(u64),

    /// The endpoint answered 503 with a zero Retry-After.
    #[error("Bad URL: {0}")]
    BadUrl(String),

    /// Response body could not be decompressed.
    #[error("Decode error: {0}")]
    DecodeError(String),

    /// Response body is not well-formed XML.
    #[error("XML error: {0}")]
    XmlError(String),

    /// The endpoint answered with an OAI-PMH `<error>` element.
    #[error("OAI-PMH error ({code}): {message}")]
    OaiError { code: String, message: String },

    /// A harvesting state machine was driven out of order.
    #[error("Protocol error: {0}")]
    ProtocolError(String),

    /// Reading or writing the progress store failed.
    #[error("Persistence error: {0}")]
    PersistenceError(String),

    /// Invalid or unreadable configuration.
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// A pipeline stage rejected its input.
    #[error("Action error: {0}")]
    ActionError(String),

    /// JSON serialization/deserialization failed.
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    /// Generic error.
    #[error("{0}")]
    Generic(String),
}

impl AppError {
    /// Returns true if this error is transient and worth retrying.
    pub fn is_retryable(&self) -> bool {
        match self {
            AppError::HttpError(_)
            | AppError::NetworkError(_)
            | AppError::Timeout(_)
            | AppError::DecodeError(_)
            | AppError::XmlError(_) => true,
            AppError::BadUrl(_)
            | AppError::OaiError { .. }
            | AppError::ProtocolError(_)
            | AppError::PersistenceError(_)
            | AppError::ConfigError(_)
            | AppError::ActionError(_)
            | AppError::SerializationError(_)
            | AppError::Generic(_) => false,
        }
    }

    /// Returns true if the failure concerns the whole provider rather than one request.
    pub fn is_provider_fatal(&self) -> bool {
        matches!(self, AppError::BadUrl(_) | AppError::PersistenceError(_))
    }
}

impl From<quick_xml::Error> for AppError {
    fn from(e: quick_xml::Error) -> Self {
        AppError::XmlError(e.to_string())
    }
}

impl From<quick_xml::events::attributes::AttrError> for AppError {
    fn from(e: quick_xml::events::attributes::AttrError) -> Self {
        AppError::XmlError(e.to_string())
    }
}
