//! Unified error handling for the shuttle tracker.
//!
//! Runtime failures (feed hiccups, collaborator errors) are reported through
//! this type and logged by the caller; only configuration errors raised at
//! startup are meant to be fatal.

use std::fmt;

/// Unified error type for tracker operations.
#[derive(Debug, Clone)]
pub enum TrackerError {
    /// A feed payload could not be decoded
    MalformedFeed { message: String },
    /// Live feed connection or read failure
    Feed { message: String },
    /// An external collaborator (lap store, registry, classifier) failed
    Collaborator {
        collaborator: &'static str,
        message: String,
    },
    /// HTTP/API error
    Http {
        message: String,
        status_code: Option<u16>,
    },
    /// Route geometry fixture could not be parsed
    Geometry { route: String, message: String },
    /// Configuration error
    Config { message: String },
    /// Filesystem error
    Io { message: String },
    /// A collaborator call exceeded its deadline
    Timeout {
        operation: String,
        timeout_ms: u64,
    },
    /// Generic internal error
    Internal { message: String },
}

impl TrackerError {
    pub fn config(message: impl Into<String>) -> Self {
        TrackerError::Config {
            message: message.into(),
        }
    }

    pub fn collaborator(collaborator: &'static str, message: impl Into<String>) -> Self {
        TrackerError::Collaborator {
            collaborator,
            message: message.into(),
        }
    }
}

impl fmt::Display for TrackerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrackerError::MalformedFeed { message } => {
                write!(f, "Malformed feed payload: {}", message)
            }
            TrackerError::Feed { message } => write!(f, "Feed error: {}", message),
            TrackerError::Collaborator {
                collaborator,
                message,
            } => {
                write!(f, "{} failed: {}", collaborator, message)
            }
            TrackerError::Http {
                message,
                status_code,
            } => {
                if let Some(code) = status_code {
                    write!(f, "HTTP error ({}): {}", code, message)
                } else {
                    write!(f, "HTTP error: {}", message)
                }
            }
            TrackerError::Geometry { route, message } => {
                write!(f, "Route geometry '{}' invalid: {}", route, message)
            }
            TrackerError::Config { message } => {
                write!(f, "Configuration error: {}", message)
            }
            TrackerError::Io { message } => write!(f, "I/O error: {}", message),
            TrackerError::Timeout {
                operation,
                timeout_ms,
            } => {
                write!(f, "{} timed out after {}ms", operation, timeout_ms)
            }
            TrackerError::Internal { message } => {
                write!(f, "Internal error: {}", message)
            }
        }
    }
}

impl std::error::Error for TrackerError {}

impl From<serde_json::Error> for TrackerError {
    fn from(e: serde_json::Error) -> Self {
        TrackerError::MalformedFeed {
            message: e.to_string(),
        }
    }
}

impl From<std::io::Error> for TrackerError {
    fn from(e: std::io::Error) -> Self {
        TrackerError::Io {
            message: e.to_string(),
        }
    }
}

#[cfg(feature = "http")]
impl From<reqwest::Error> for TrackerError {
    fn from(e: reqwest::Error) -> Self {
        TrackerError::Http {
            message: e.to_string(),
            status_code: e.status().map(|s| s.as_u16()),
        }
    }
}

/// Result type alias for tracker operations.
pub type Result<T> = std::result::Result<T, TrackerError>;

/// Extension trait for converting Option to TrackerError.
pub trait OptionExt<T> {
    /// Convert Option to Result with a configuration error.
    fn ok_or_config(self, message: &str) -> Result<T>;
}

impl<T> OptionExt<T> for Option<T> {
    fn ok_or_config(self, message: &str) -> Result<T> {
        self.ok_or_else(|| TrackerError::config(message))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = TrackerError::Timeout {
            operation: "classify bus-7".to_string(),
            timeout_ms: 5000,
        };
        assert_eq!(err.to_string(), "classify bus-7 timed out after 5000ms");

        let err = TrackerError::collaborator("lap store", "connection refused");
        assert!(err.to_string().contains("lap store"));
    }

    #[test]
    fn test_json_error_is_malformed_feed() {
        let err: TrackerError = serde_json::from_str::<serde_json::Value>("{nope")
            .unwrap_err()
            .into();
        assert!(matches!(err, TrackerError::MalformedFeed { .. }));
    }

    #[test]
    fn test_option_ext() {
        let none: Option<i32> = None;
        let result = none.ok_or_config("missing stop table");
        assert!(matches!(result, Err(TrackerError::Config { .. })));
    }
}
