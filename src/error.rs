//! Error types for the channel kernel

use thiserror::Error;

use crate::retry::{ErrorClass, classify, classify_status};

/// Result type alias for channel kernel operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the channel kernel
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error (missing credential, malformed value)
    #[error("configuration error: {0}")]
    Config(String),

    /// Channel adapter error
    #[error("channel error: {0}")]
    Channel(String),

    /// Plugin discovery or instantiation error
    #[error("plugin error: {0}")]
    Plugin(String),

    /// Pairing / access-control error
    #[error("pairing error: {0}")]
    Pairing(String),

    /// Error reported by a remote platform or agent backend
    #[error("upstream error ({status}): {message}")]
    Upstream {
        /// HTTP-like status code reported by the remote side
        status: u16,
        /// Error body or description
        message: String,
    },

    /// Operation exceeded its deadline
    #[error("timed out: {0}")]
    Timeout(String),

    /// Operation was cancelled by shutdown
    #[error("cancelled")]
    Cancelled,

    /// A configured limit refused the operation
    #[error("limit reached: {0}")]
    Limit(String),

    /// Resource not found
    #[error("not found: {0}")]
    NotFound(String),

    /// IO error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// HTTP error
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// TOML parsing error
    #[error("toml error: {0}")]
    Toml(#[from] toml::de::Error),
}

impl Error {
    /// Classify this error as transient (worth retrying) or permanent
    #[must_use]
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::Timeout(_) => ErrorClass::Transient,
            Self::Config(_)
            | Self::Plugin(_)
            | Self::Pairing(_)
            | Self::Cancelled
            | Self::Limit(_)
            | Self::NotFound(_)
            | Self::Serialization(_)
            | Self::Toml(_) => ErrorClass::Permanent,
            Self::Upstream { status, message } => classify_status(*status, message),
            Self::Http(e) if e.is_timeout() || e.is_connect() => ErrorClass::Transient,
            Self::Http(e) => match e.status() {
                Some(status) => classify_status(status.as_u16(), &e.to_string()),
                None => classify(&e.to_string()),
            },
            _ => classify(&self.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upstream_status_drives_classification() {
        let overloaded = Error::Upstream {
            status: 503,
            message: "busy".to_string(),
        };
        assert_eq!(overloaded.class(), ErrorClass::Transient);

        let unauthorized = Error::Upstream {
            status: 401,
            message: "bad token".to_string(),
        };
        assert_eq!(unauthorized.class(), ErrorClass::Permanent);
    }

    #[test]
    fn config_errors_are_permanent() {
        let err = Error::Config("rate limit setting missing".to_string());
        assert_eq!(err.class(), ErrorClass::Permanent);
    }

    #[test]
    fn timeouts_are_transient() {
        assert_eq!(
            Error::Timeout("send".to_string()).class(),
            ErrorClass::Transient
        );
    }
}
