//! Error types for the traces client.

/// Traces client errors.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// Resource not found on the server.
    #[error("not found: {url}")]
    NotFound { url: String },

    /// Login failed or the session was refused.
    #[error("unauthorized: {message}")]
    Unauthorized { message: String },

    /// Transient server-side failure (500, 502, 504).
    #[error("server error {status} for {url}: {message}")]
    Server {
        status: u16,
        url: String,
        message: String,
    },

    /// Any other non-success status.
    #[error("HTTP {status} for {url}: {message}")]
    Http {
        status: u16,
        url: String,
        message: String,
    },

    /// Connection-level failure.
    #[error("network error: {message}")]
    Network { message: String },

    /// Response body could not be understood.
    #[error("invalid response: {message}")]
    InvalidResponse { message: String },

    /// Configuration error (missing credentials, bad URL).
    #[error("configuration error: {message}")]
    Config { message: String },
}

impl ClientError {
    /// Exit code for CLI.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Config { .. } | Self::Unauthorized { .. } => 2,
            Self::NotFound { .. } | Self::Http { .. } | Self::InvalidResponse { .. } => 3,
            Self::Server { .. } | Self::Network { .. } => 3,
        }
    }

    /// Whether the error is retryable.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Server { .. } | Self::Network { .. })
    }
}

impl From<reqwest::Error> for ClientError {
    fn from(err: reqwest::Error) -> Self {
        Self::Network {
            message: err.to_string(),
        }
    }
}

/// Result type for client operations.
pub type ClientResult<T> = Result<T, ClientError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_transient_errors_are_retryable() {
        let server = ClientError::Server {
            status: 502,
            url: "http://x/api".into(),
            message: "bad gateway".into(),
        };
        let http = ClientError::Http {
            status: 422,
            url: "http://x/api".into(),
            message: "unprocessable".into(),
        };
        assert!(server.is_retryable());
        assert!(ClientError::Network {
            message: "reset".into()
        }
        .is_retryable());
        assert!(!http.is_retryable());
        assert!(!ClientError::NotFound { url: "u".into() }.is_retryable());
    }

    #[test]
    fn config_errors_map_to_exit_code_two() {
        let err = ClientError::Config {
            message: "no username".into(),
        };
        assert_eq!(err.exit_code(), 2);
    }
}
