// =============================================================================
// Error taxonomy for the fetch / persist / stream boundaries
// =============================================================================
//
// None of these errors are allowed to escape their component as a panic or a
// process-fatal failure. The fetcher and persistence layers log them and hand
// back an absent result; the streaming handler surfaces connection failures to
// the orchestrator, which closes the session.
// =============================================================================

use std::path::PathBuf;

/// Failures talking to the market data provider's REST API.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// Credentials rejected (HTTP 401 / 403).
    #[error("authentication rejected by provider (HTTP {status}): {message}")]
    Auth { status: u16, message: String },

    /// Request rejected locally before it was sent.
    #[error("malformed request: {0}")]
    InvalidRequest(String),

    /// Malformed request or a non-success response from the provider.
    #[error("provider returned {status}: {message}")]
    BadResponse { status: u16, message: String },

    /// Connection refused, dropped, or timed out.
    #[error("connection to provider failed: {0}")]
    Connection(String),

    /// Response body could not be decoded.
    #[error("failed to decode provider response: {0}")]
    Decode(String),
}

impl From<reqwest::Error> for TransportError {
    /// The request URL carries the API key as a query parameter, so it is
    /// stripped before the error is rendered.
    fn from(e: reqwest::Error) -> Self {
        let e = e.without_url();
        if e.is_decode() {
            Self::Decode(e.to_string())
        } else if let Some(status) = e.status() {
            Self::BadResponse {
                status: status.as_u16(),
                message: e.to_string(),
            }
        } else {
            Self::Connection(e.to_string())
        }
    }
}

/// Failures saving or loading a dataset file.
#[derive(Debug, thiserror::Error)]
pub enum PersistenceError {
    #[error("I/O error at {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("unparseable timestamp '{value}' on line {line}")]
    Timestamp { value: String, line: usize },

    #[error("malformed file: {0}")]
    Shape(String),
}

impl PersistenceError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

/// Failures of the real-time trade session.
#[derive(Debug, thiserror::Error)]
pub enum StreamError {
    /// Session establishment, authentication, or receive failure.
    #[error("streaming connection error: {0}")]
    Connection(String),

    /// A single message that could not be decoded. Never fatal to the loop.
    #[error("malformed stream message: {0}")]
    Decode(String),

    #[error("no symbols subscribed")]
    NotSubscribed,

    #[error("streaming session already closed")]
    Closed,
}

impl From<tokio_tungstenite::tungstenite::Error> for StreamError {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        Self::Connection(e.to_string())
    }
}

/// A repair the preprocessor applied instead of failing.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("column '{column}': {reason}")]
pub struct ValidationIssue {
    pub column: String,
    pub reason: String,
}
