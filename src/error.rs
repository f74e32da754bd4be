//! Error types for sluice.

use thiserror::Error;

/// Main error type for limiter operations.
#[derive(Error, Debug)]
pub enum SluiceError {
    /// `max_events` was missing or below 1
    #[error("max_events must be an integer >= 1, got {0:?}")]
    InvalidMaxEvents(Option<i64>),

    /// The window start function was missing or produced no timestamp
    #[error("since must be a function returning a timestamp: {0}")]
    InvalidSinceFunction(String),

    /// The on_limit handler name is not registered on the limiter
    #[error("unknown on_limit handler: {0}")]
    UnknownLimitHandler(String),

    /// track/limited?/events was called before an event type was set
    #[error("event type is not set")]
    EventTypeNotSet,

    /// A custom on_limit handler aborted the tracking loop
    #[error("on_limit handler '{handler}' aborted: {reason}")]
    Handler { handler: String, reason: String },

    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Event repository errors
    #[error("Storage error: {0}")]
    Storage(String),

    /// Lock acquisition or release errors
    #[error("Lock error: {0}")]
    Lock(String),

    /// Database errors
    #[cfg(feature = "postgres")]
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl SluiceError {
    /// Build the error a custom handler returns to stop waiting.
    pub fn handler_abort(handler: impl Into<String>, reason: impl Into<String>) -> Self {
        SluiceError::Handler {
            handler: handler.into(),
            reason: reason.into(),
        }
    }

    /// Whether this error came from registration-time validation.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            SluiceError::InvalidMaxEvents(_)
                | SluiceError::InvalidSinceFunction(_)
                | SluiceError::UnknownLimitHandler(_)
                | SluiceError::Config(_)
        )
    }
}

impl From<config::ConfigError> for SluiceError {
    fn from(err: config::ConfigError) -> Self {
        SluiceError::Config(err.to_string())
    }
}

impl From<serde_yaml::Error> for SluiceError {
    fn from(err: serde_yaml::Error) -> Self {
        SluiceError::Config(err.to_string())
    }
}

/// Result type alias for sluice operations.
pub type Result<T> = std::result::Result<T, SluiceError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_configuration_errors_are_classified() {
        assert!(SluiceError::InvalidMaxEvents(Some(0)).is_configuration());
        assert!(SluiceError::UnknownLimitHandler("nope".into()).is_configuration());
        assert!(!SluiceError::EventTypeNotSet.is_configuration());
        assert!(!SluiceError::Storage("down".into()).is_configuration());
    }

    #[test]
    fn test_handler_abort_message() {
        let err = SluiceError::handler_abort("give_up", "retried 3 times");
        assert_eq!(
            err.to_string(),
            "on_limit handler 'give_up' aborted: retried 3 times"
        );
    }
}
