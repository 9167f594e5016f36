//! Error types and handling for Helios
//!
//! This module defines the error types used throughout the application.
//! Poll-level failures (`Connection`, `Parse`, `Validation`) are recovered by
//! the coordinator's fallback chain; only `AllSourcesExhausted` and
//! `NoCachedDataInNightMode` end a cycle.

use thiserror::Error;

/// Result type alias for Helios operations
pub type Result<T> = std::result::Result<T, HeliosError>;

/// Main error type for Helios
#[derive(Debug, Error)]
pub enum HeliosError {
    /// Configuration-related errors
    #[error("Configuration error: {message}")]
    Config { message: String },

    /// Transport never completed (refused, reset, non-success status)
    #[error("Connection error: {message}")]
    Connection { message: String },

    /// Transport completed but the payload could not be parsed
    #[error("Parse error: {message}")]
    Parse { message: String },

    /// Parsed but semantically empty or incomplete
    #[error("Validation error: {field} - {message}")]
    Validation { field: String, message: String },

    /// Snapshot cache unreadable or unwritable
    #[error("Cache error: {message}")]
    Cache { message: String },

    /// Night mode was selected and there is nothing cached to serve
    #[error("No cached data available in night mode")]
    NoCachedDataInNightMode,

    /// Every source in the fallback chain failed
    #[error("All data sources exhausted: {cause}")]
    AllSourcesExhausted { cause: Box<HeliosError> },

    /// Serialization/deserialization errors
    #[error("Serialization error: {message}")]
    Serialization { message: String },

    /// File I/O errors
    #[error("I/O error: {message}")]
    Io { message: String },

    /// Authentication against the gateway failed
    #[error("Authentication error: {message}")]
    Auth { message: String },

    /// Timeout errors
    #[error("Timeout error: {message}")]
    Timeout { message: String },

    /// HTTP server errors
    #[error("Web server error: {message}")]
    Web { message: String },

    /// Generic errors with context
    #[error("Error: {message}")]
    Generic { message: String },
}

impl HeliosError {
    /// Create a new configuration error
    pub fn config<S: Into<String>>(message: S) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Create a new connection error
    pub fn connection<S: Into<String>>(message: S) -> Self {
        Self::Connection {
            message: message.into(),
        }
    }

    /// Create a new parse error
    pub fn parse<S: Into<String>>(message: S) -> Self {
        Self::Parse {
            message: message.into(),
        }
    }

    /// Create a new validation error
    pub fn validation<F: Into<String>, M: Into<String>>(field: F, message: M) -> Self {
        Self::Validation {
            field: field.into(),
            message: message.into(),
        }
    }

    /// Create a new cache error
    pub fn cache<S: Into<String>>(message: S) -> Self {
        Self::Cache {
            message: message.into(),
        }
    }

    /// Wrap the most recent underlying cause into a terminal cycle error
    pub fn exhausted(cause: Self) -> Self {
        Self::AllSourcesExhausted {
            cause: Box::new(cause),
        }
    }

    /// Create a new I/O error
    pub fn io<S: Into<String>>(message: S) -> Self {
        Self::Io {
            message: message.into(),
        }
    }

    /// Create a new auth error
    pub fn auth<S: Into<String>>(message: S) -> Self {
        Self::Auth {
            message: message.into(),
        }
    }

    /// Create a new timeout error
    pub fn timeout<S: Into<String>>(message: S) -> Self {
        Self::Timeout {
            message: message.into(),
        }
    }

    /// Create a new web error
    pub fn web<S: Into<String>>(message: S) -> Self {
        Self::Web {
            message: message.into(),
        }
    }

    /// Create a new generic error
    pub fn generic<S: Into<String>>(message: S) -> Self {
        Self::Generic {
            message: message.into(),
        }
    }

    /// Network-level failure where the transport never produced a usable response
    pub const fn is_transport(&self) -> bool {
        matches!(
            self,
            Self::Connection { .. } | Self::Timeout { .. } | Self::Auth { .. }
        )
    }

    /// Payload arrived but was unusable
    pub const fn is_payload(&self) -> bool {
        matches!(self, Self::Parse { .. } | Self::Validation { .. })
    }

    /// Whether this error ends a cycle rather than triggering a fallback
    pub const fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::AllSourcesExhausted { .. } | Self::NoCachedDataInNightMode
        )
    }

    /// Innermost cause for terminal errors, `self` otherwise
    pub fn root_cause(&self) -> &Self {
        match self {
            Self::AllSourcesExhausted { cause } => cause.root_cause(),
            other => other,
        }
    }
}

impl From<std::io::Error> for HeliosError {
    fn from(err: std::io::Error) -> Self {
        Self::io(err.to_string())
    }
}

impl From<serde_yaml::Error> for HeliosError {
    fn from(err: serde_yaml::Error) -> Self {
        Self::Serialization {
            message: err.to_string(),
        }
    }
}

impl From<serde_json::Error> for HeliosError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization {
            message: err.to_string(),
        }
    }
}

impl From<reqwest::Error> for HeliosError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::timeout(err.to_string())
        } else if err.is_decode() {
            Self::parse(err.to_string())
        } else {
            Self::connection(err.to_string())
        }
    }
}

impl From<chrono::ParseError> for HeliosError {
    fn from(err: chrono::ParseError) -> Self {
        Self::validation("datetime", err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_creation() {
        let err = HeliosError::config("test config error");
        assert!(matches!(err, HeliosError::Config { .. }));

        let err = HeliosError::connection("refused");
        assert!(matches!(err, HeliosError::Connection { .. }));

        let err = HeliosError::validation("devices", "empty");
        assert!(matches!(err, HeliosError::Validation { .. }));
    }

    #[test]
    fn test_error_display() {
        let err = HeliosError::config("test error");
        assert_eq!(err.to_string(), "Configuration error: test error");

        let err = HeliosError::validation("devices", "no devices found");
        assert_eq!(err.to_string(), "Validation error: devices - no devices found");

        let err = HeliosError::exhausted(HeliosError::connection("host down"));
        assert_eq!(
            err.to_string(),
            "All data sources exhausted: Connection error: host down"
        );
    }

    #[test]
    fn test_classification() {
        assert!(HeliosError::timeout("t").is_transport());
        assert!(HeliosError::auth("401").is_transport());
        assert!(!HeliosError::parse("bad json").is_transport());
        assert!(HeliosError::parse("bad json").is_payload());
        assert!(HeliosError::NoCachedDataInNightMode.is_terminal());
        assert!(!HeliosError::cache("unreadable").is_terminal());
    }

    #[test]
    fn test_root_cause_unwraps_nested() {
        let err = HeliosError::exhausted(HeliosError::parse("truncated"));
        assert!(matches!(err.root_cause(), HeliosError::Parse { .. }));
    }
}
