//! Error types for Classlink Core

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Not connected")]
    NotConnected,

    #[error("Credential expired, re-authentication required")]
    AuthExpired,

    #[error("Credential refresh unavailable: {0}")]
    RefreshUnavailable(String),

    #[error("Signaling failed: {0}")]
    SignalingFailed(String),

    #[error("Upload failed: {0}")]
    UploadFailed(String),

    #[error("Cannot {operation} while {state}")]
    InvalidState {
        operation: &'static str,
        state: String,
    },

    #[error("Unknown message: {0}")]
    UnknownMessage(String),

    #[error("Upload cancelled")]
    Cancelled,

    #[error("Media error: {0}")]
    Media(String),

    #[error("Not logged in")]
    NotLoggedIn,

    #[error("Network error: {0}")]
    Network(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("WebSocket error: {0}")]
    WebSocket(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("Invalid URL: {0}")]
    Url(#[from] url::ParseError),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub(crate) fn invalid_state(operation: &'static str, state: impl std::fmt::Display) -> Self {
        Error::InvalidState {
            operation,
            state: state.to_string(),
        }
    }

    /// Whether the caller may retry the failed operation later.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::NotConnected
                | Error::RefreshUnavailable(_)
                | Error::UploadFailed(_)
                | Error::Network(_)
                | Error::Http(_)
                | Error::WebSocket(_)
        )
    }

    /// Whether the error ends the authenticated session.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::AuthExpired | Error::NotLoggedIn)
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        Error::Http(e.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for Error {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        Error::WebSocket(e.to_string())
    }
}
