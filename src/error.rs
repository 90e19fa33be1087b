//! Error types for the statefull session client

use std::time::Duration;

use thiserror::Error;

/// Result type for session operations
pub type Result<T> = std::result::Result<T, SessionError>;

/// Why a node allocation request was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum AllocationErrorKind {
    /// Allocation endpoint answered 500
    #[error("internal server error")]
    InternalServerError,

    /// Allocation endpoint answered 404
    #[error("wrong endpoint")]
    WrongEndpoint,

    /// Allocation endpoint answered 403
    #[error("can't allocate node")]
    AllocationDenied,

    /// Any other non-200 status
    #[error("unexpected status code {0}")]
    UnexpectedStatus(u16),

    /// Allocation endpoint answered 401; the stored session token was cleared
    #[error("session expired")]
    SessionExpired,

    /// Allocation succeeded but the response body was empty
    #[error("received node url is empty")]
    EmptyNodeUrl,
}

/// Session client error
#[derive(Debug, Error)]
pub enum SessionError {
    /// A persisted ban is still active; `end_time == -1` means permanent
    #[error("banned until {end_time}: {reason}")]
    Banned { end_time: i64, reason: String },

    /// Settings document request did not answer 200
    #[error("settings fetch failed with status {status}: {body}")]
    SettingsFetch { status: u16, body: String },

    /// Settings document is missing a field or has the wrong type for it
    #[error("settings field '{field}' is missing or has the wrong type")]
    SettingsSchema { field: &'static str },

    /// Settings redirection never stabilized within the configured tries
    #[error("settings never converged: queried '{last_url}', settings point at '{settings_url}'")]
    Convergence {
        last_url: String,
        settings_url: String,
    },

    /// Node allocation request failed
    #[error("node allocation failed: {0}")]
    Allocation(AllocationErrorKind),

    /// Rotated session token header was absent, empty or malformed
    #[error("session token rotation failed: {0}")]
    SessionProtocol(String),

    /// No init message arrived within the handshake timeout
    #[error("no init message received within {0:?}")]
    HandshakeTimeout(Duration),

    /// Init message had the wrong prefix or was not a JSON object
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    /// WebSocket transport failed
    #[error("websocket transport error: {0}")]
    Transport(String),

    /// Socket closed without a terminal control signal
    #[error("connection closed before ready: code {code}, reason '{reason}'")]
    ConnectionClosed {
        code: u16,
        reason: String,
        was_clean: bool,
    },

    /// Socket closed after the handshake with a code the protocol does not know
    #[error("unknown close code {0}")]
    UnknownCloseCode(u16),

    /// Retryable failures exceeded the configured bound
    #[error("gave up after {attempts} attempts: {last}")]
    RetriesExhausted {
        attempts: u32,
        #[source]
        last: Box<SessionError>,
    },

    /// HTTP request failed
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// JSON serialization/deserialization failed
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}
