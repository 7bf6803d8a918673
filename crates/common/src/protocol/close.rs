// Close reasons sent by the relay in the WebSocket close frame.
//
// The frame's reason text is the stable string code; the numeric close code
// sits in the application range (4000-4999) except for shutdown, which uses
// the standard "going away" code.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CloseReason {
    AuthTokenRequired,
    InvalidToken,
    InvalidTokenFormat,
    InvalidDocumentName,
    InvalidDocumentFormat,
    InvalidNoteId,
    Unauthorized,
    AuthenticationFailed,
    BackendUnavailable,
    BackendTimeout,
    BackendError,
    BackendInvalidResponse,
    HeartbeatTimeout,
    ServerShuttingDown,
}

impl CloseReason {
    pub const ALL: [CloseReason; 14] = [
        Self::AuthTokenRequired,
        Self::InvalidToken,
        Self::InvalidTokenFormat,
        Self::InvalidDocumentName,
        Self::InvalidDocumentFormat,
        Self::InvalidNoteId,
        Self::Unauthorized,
        Self::AuthenticationFailed,
        Self::BackendUnavailable,
        Self::BackendTimeout,
        Self::BackendError,
        Self::BackendInvalidResponse,
        Self::HeartbeatTimeout,
        Self::ServerShuttingDown,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::AuthTokenRequired => "AUTH_TOKEN_REQUIRED",
            Self::InvalidToken => "INVALID_TOKEN",
            Self::InvalidTokenFormat => "INVALID_TOKEN_FORMAT",
            Self::InvalidDocumentName => "INVALID_DOCUMENT_NAME",
            Self::InvalidDocumentFormat => "INVALID_DOCUMENT_FORMAT",
            Self::InvalidNoteId => "INVALID_NOTE_ID",
            Self::Unauthorized => "UNAUTHORIZED",
            Self::AuthenticationFailed => "AUTHENTICATION_FAILED",
            Self::BackendUnavailable => "BACKEND_UNAVAILABLE",
            Self::BackendTimeout => "BACKEND_TIMEOUT",
            Self::BackendError => "BACKEND_ERROR",
            Self::BackendInvalidResponse => "BACKEND_INVALID_RESPONSE",
            Self::HeartbeatTimeout => "HEARTBEAT_TIMEOUT",
            Self::ServerShuttingDown => "SERVER_SHUTTING_DOWN",
        }
    }

    pub fn close_code(self) -> u16 {
        match self {
            Self::AuthTokenRequired => 4001,
            Self::InvalidToken => 4002,
            Self::InvalidTokenFormat => 4003,
            Self::InvalidDocumentName => 4004,
            Self::InvalidDocumentFormat => 4005,
            Self::InvalidNoteId => 4006,
            Self::AuthenticationFailed => 4401,
            Self::Unauthorized => 4403,
            Self::HeartbeatTimeout => 4408,
            Self::BackendError => 4502,
            Self::BackendUnavailable => 4503,
            Self::BackendTimeout => 4504,
            Self::BackendInvalidResponse => 4505,
            Self::ServerShuttingDown => 1001,
        }
    }

    /// Reverse of [`close_code`](Self::close_code). Close frames may also
    /// carry the reason string, which is preferred when present.
    pub fn from_close_code(code: u16) -> Option<Self> {
        Self::ALL.into_iter().find(|reason| reason.close_code() == code)
    }

    /// Definitive rejections: reconnecting with the same credential and
    /// document cannot succeed.
    pub fn is_auth_rejection(self) -> bool {
        matches!(
            self,
            Self::AuthTokenRequired
                | Self::InvalidToken
                | Self::InvalidTokenFormat
                | Self::InvalidDocumentName
                | Self::InvalidDocumentFormat
                | Self::InvalidNoteId
                | Self::Unauthorized
                | Self::AuthenticationFailed
        )
    }

    /// Backend trouble on the relay side.
    pub fn is_backend_failure(self) -> bool {
        matches!(
            self,
            Self::BackendUnavailable
                | Self::BackendTimeout
                | Self::BackendError
                | Self::BackendInvalidResponse
        )
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownCloseReason(pub String);

impl fmt::Display for UnknownCloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown close reason `{}`", self.0)
    }
}

impl std::error::Error for UnknownCloseReason {}

impl FromStr for CloseReason {
    type Err = UnknownCloseReason;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|reason| reason.as_str() == s)
            .ok_or_else(|| UnknownCloseReason(s.to_string()))
    }
}
