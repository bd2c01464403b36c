use thiserror::Error;

/// Failure of a remote call or subscription, carrying the service's status
/// code. Kept distinct from local validation errors so callers can decide
/// whether to surface a "corrupted deep link" style message or a generic one.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Remote call failed (code {code}): {message}")]
pub struct RemoteError {
    pub code: i32,
    pub message: String,
}

impl RemoteError {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    /// The request was malformed (corrupted link, bad key, ...).
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::new(3, message)
    }

    /// The referenced entity is unknown to the service.
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(5, message)
    }

    /// The service is not running or the transport dropped.
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::new(14, message)
    }
}
