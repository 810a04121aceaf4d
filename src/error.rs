//! Error types shared by the remote client and the board engine.

use thiserror::Error;

/// Failure talking to the remote order service.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ApiError {
    /// HTTP 401: the access token was rejected.
    #[error("access token is invalid or expired")]
    Unauthorized,
    /// Transport-level failure (connect, timeout, TLS, ...).
    #[error("{0}")]
    Network(String),
    /// Any other non-success HTTP status.
    #[error("{detail} (HTTP {status})")]
    Rejected { status: u16, detail: String },
    /// The response body could not be understood at all.
    #[error("invalid response from order service: {0}")]
    Decode(String),
}

impl ApiError {
    pub fn is_unauthorized(&self) -> bool {
        matches!(self, ApiError::Unauthorized)
    }
}

/// Errors surfaced by the board to its callers.
///
/// Fetch-level errors (`Network`, `MalformedSnapshot`) are board-wide and show
/// up in [`crate::BoardView::error`]. Command-level errors are local to one
/// order and have already been rolled back by the time the caller sees them.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BoardError {
    #[error("order service rejected the access token")]
    Unauthorized,
    #[error("session is no longer valid, sign in again")]
    SessionInvalid,
    #[error("network error: {0}")]
    Network(String),
    #[error("{command} failed for order {order_id}: {reason}")]
    CommandFailed {
        command: &'static str,
        order_id: String,
        reason: String,
    },
    #[error("malformed order snapshot: {0}")]
    MalformedSnapshot(String),
    #[error("action not permitted on order {order_id}: {reason}")]
    ActionNotPermitted { order_id: String, reason: String },
    #[error("order {0} is not on the board")]
    UnknownOrder(String),
    #[error("storage error: {0}")]
    Storage(String),
    #[error("configuration error: {0}")]
    Config(String),
}

impl From<ApiError> for BoardError {
    fn from(err: ApiError) -> Self {
        match err {
            ApiError::Unauthorized => BoardError::Unauthorized,
            ApiError::Network(msg) => BoardError::Network(msg),
            ApiError::Rejected { .. } => BoardError::Network(err.to_string()),
            ApiError::Decode(msg) => BoardError::MalformedSnapshot(msg),
        }
    }
}

impl From<rusqlite::Error> for BoardError {
    fn from(err: rusqlite::Error) -> Self {
        BoardError::Storage(err.to_string())
    }
}

impl From<serde_json::Error> for BoardError {
    fn from(err: serde_json::Error) -> Self {
        BoardError::Storage(format!("payload encoding: {err}"))
    }
}
