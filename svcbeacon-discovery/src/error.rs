//! Error types for discovery module

use thiserror::Error;

/// Errors returned by a discovery backend client
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("HTTP error {status} for {url}")]
    Http { status: reqwest::StatusCode, url: String },

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl From<reqwest::Error> for BackendError {
    fn from(err: reqwest::Error) -> Self {
        Self::Network(err.to_string())
    }
}

impl From<serde_json::Error> for BackendError {
    fn from(err: serde_json::Error) -> Self {
        Self::Parse(err.to_string())
    }
}

/// Registration and background task errors
///
/// Each variant names the step that failed. None of them is retried.
#[derive(Debug, Error)]
pub enum Error {
    #[error("Could not listen on {address}: {source}")]
    Listen {
        address: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Could not derive registration record: {0}")]
    RegistrationBuild(String),

    #[error("Service registration failed for '{service_id}': {source}")]
    Registration {
        service_id: String,
        #[source]
        source: BackendError,
    },

    #[error("Heartbeat failed for check '{check_id}': {source}")]
    Heartbeat {
        check_id: String,
        #[source]
        source: BackendError,
    },

    #[error("Membership watch failed for service '{service}': {source}")]
    Watch {
        service: String,
        #[source]
        source: BackendError,
    },

    #[error("Membership watch stream for service '{service}' ended")]
    WatchClosed { service: String },

    #[error("Deregistration failed for '{service_id}': {source}")]
    Deregistration {
        service_id: String,
        #[source]
        source: BackendError,
    },

    #[error("Background task failed: {0}")]
    TaskJoin(#[from] tokio::task::JoinError),
}

/// Result type for discovery operations
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backend_error_display_http() {
        let err = BackendError::Http {
            status: reqwest::StatusCode::INTERNAL_SERVER_ERROR,
            url: "http://127.0.0.1:8500/v1/agent/service/register".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "HTTP error 500 Internal Server Error for http://127.0.0.1:8500/v1/agent/service/register"
        );
    }

    #[test]
    fn test_backend_error_from_serde_json() {
        let json_err = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
        let err: BackendError = json_err.into();
        assert!(matches!(err, BackendError::Parse(_)));
    }

    #[test]
    fn test_error_names_failed_step() {
        let err = Error::Heartbeat {
            check_id: "svc-one-8080_health".to_string(),
            source: BackendError::Network("connection refused".to_string()),
        };
        assert_eq!(
            err.to_string(),
            "Heartbeat failed for check 'svc-one-8080_health': Network error: connection refused"
        );

        let err = Error::WatchClosed {
            service: "svc.one".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Membership watch stream for service 'svc.one' ended"
        );
    }
}
