use thiserror::Error;

/// Failure of a fetch or mutation against the remote resource server.
///
/// `Clone` because one failed fetch is handed to every coalesced caller.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FetchError {
    #[error("Client error {status}: {message}")]
    Client { status: u16, message: String },

    #[error("Network error: {0}")]
    Connectivity(String),

    #[error("Request timed out")]
    Timeout,

    #[error("Server error {status}: {message}")]
    Server { status: u16, message: String },

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("Request aborted")]
    Aborted,
}

/// Maximum length for error response bodies in error messages
const MAX_ERROR_BODY_LENGTH: usize = 500;

impl FetchError {
    /// Truncate a response body to avoid logging excessive data
    fn truncate_body(body: &str) -> String {
        if body.len() <= MAX_ERROR_BODY_LENGTH {
            body.to_string()
        } else {
            let mut end = MAX_ERROR_BODY_LENGTH;
            while !body.is_char_boundary(end) {
                end -= 1;
            }
            format!(
                "{}... (truncated, {} total bytes)",
                &body[..end],
                body.len()
            )
        }
    }

    /// Classify a non-success HTTP status.
    pub fn from_status(status: u16, body: &str) -> Self {
        let message = Self::truncate_body(body);
        match status {
            400..=499 => FetchError::Client { status, message },
            500..=599 => FetchError::Server { status, message },
            _ => FetchError::InvalidResponse(format!("Status {}: {}", status, message)),
        }
    }

    /// Network unreachable or timed out. These are the failures that get the
    /// long retry budget and, for mutations, land in the offline queue.
    pub fn is_connectivity(&self) -> bool {
        matches!(self, FetchError::Connectivity(_) | FetchError::Timeout)
    }

    pub fn is_client_error(&self) -> bool {
        matches!(self, FetchError::Client { .. })
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            FetchError::Client { status, .. } | FetchError::Server { status, .. } => Some(*status),
            _ => None,
        }
    }
}

impl From<reqwest::Error> for FetchError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            FetchError::Timeout
        } else if err.is_decode() {
            FetchError::InvalidResponse(err.to_string())
        } else if let Some(status) = err.status() {
            FetchError::from_status(status.as_u16(), &err.to_string())
        } else {
            FetchError::Connectivity(err.to_string())
        }
    }
}

/// Rejected configuration, reported at load time.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Strategy for domain '{domain}': {reason}")]
    InvalidStrategy { domain: String, reason: String },

    #[error("Invalidation rule '{tag}': {reason}")]
    InvalidRule { tag: String, reason: String },

    #[error("Invalid setting '{field}': {reason}")]
    InvalidSetting { field: &'static str, reason: String },
}
