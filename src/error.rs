//! Error types for bandarr
//!
//! Every component surfaces failures through the [`Error`] enum. The polling
//! loops recover from all of these except cancellation; control-surface
//! methods return them as structured reasons rather than raw transport
//! errors.

use thiserror::Error;

/// Result type alias for bandarr operations
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for bandarr
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error with context about which setting is invalid
    #[error("configuration error: {message}")]
    Config {
        /// Human-readable message describing the configuration issue
        message: String,
    },

    /// HTTP transport error (TLS, malformed responses, unexpected status)
    #[error("network error: {0}")]
    Http(#[from] reqwest::Error),

    /// A polled service could not be reached at all (connection refused,
    /// request timeout). Carries the service's display name.
    #[error("{0} is unreachable")]
    Unreachable(String),

    /// Target URL could not be parsed
    #[error("invalid URL: {0}")]
    Url(#[from] url::ParseError),

    /// A daemon session expired and re-authentication did not recover it
    #[error("{client}: authentication expired")]
    AuthExpired {
        /// Display name of the client whose session expired
        client: String,
    },

    /// Login was rejected outright (bad credentials, bad API key)
    #[error("{client}: authentication failed: {message}")]
    AuthFailed {
        /// Display name of the client that rejected the login
        client: String,
        /// Reason reported by the daemon
        message: String,
    },

    /// A daemon rejected a limit change
    #[error("{client}: failed to apply limits: {message}")]
    Actuation {
        /// Display name of the client that rejected the request
        client: String,
        /// Reason reported by the daemon
        message: String,
    },

    /// An RPC-style daemon returned an application-level error
    #[error("{client}: RPC error: {message}")]
    Rpc {
        /// Display name of the client that returned the error
        client: String,
        /// The error payload from the daemon
        message: String,
    },

    /// A daemon returned a payload the adapter could not interpret
    #[error("{client}: unexpected response: {message}")]
    UnexpectedResponse {
        /// Display name of the client that returned the payload
        client: String,
        /// What was wrong with it
        message: String,
    },

    /// Link probe measurement failure (transport or counter anomaly)
    #[error("link probe error: {0}")]
    Probe(String),

    /// Requested entity does not exist (reservation id, client id)
    #[error("not found: {0}")]
    NotFound(String),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Other error
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Classify a failed request against a service: a daemon that cannot be
    /// reached at all (connection refused, timed out) surfaces as
    /// [`Error::Unreachable`]; everything else stays an HTTP error.
    pub fn transport(service: &str, error: reqwest::Error) -> Error {
        if error.is_connect() || error.is_timeout() {
            tracing::debug!(service, error = %error, "service unreachable");
            Error::Unreachable(service.to_string())
        } else {
            Error::Http(error)
        }
    }

    /// True if this error represents a transient transport failure that the
    /// unreachable-tracking machinery should count rather than surface.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::Http(_) | Error::Unreachable(_) | Error::Probe(_) | Error::AuthExpired { .. }
        )
    }
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_actuation_error_display() {
        let err = Error::Actuation {
            client: "qbittorrent-main".into(),
            message: "daemon returned 500".into(),
        };
        assert_eq!(
            err.to_string(),
            "qbittorrent-main: failed to apply limits: daemon returned 500"
        );
    }

    #[test]
    fn test_auth_expired_is_transient() {
        let err = Error::AuthExpired {
            client: "deluge".into(),
        };
        assert!(err.is_transient());
    }

    #[test]
    fn test_unreachable_display_and_transience() {
        let err = Error::Unreachable("qBittorrent".into());
        assert_eq!(err.to_string(), "qBittorrent is unreachable");
        assert!(err.is_transient());
    }

    #[test]
    fn test_config_error_not_transient() {
        let err = Error::Config {
            message: "total limit must be positive".into(),
        };
        assert!(!err.is_transient());
    }
}
