//! Error taxonomy for the session engine
//!
//! The first four variants of [`SessionError`] are protocol outcomes: they tell
//! the frontend what to do next (log in again, call refresh, warn the user,
//! satisfy a claim). Everything else is a [`GeneralError`] and is fatal to the
//! current request.

use thiserror::Error;

use crate::claims::ClaimValidationError;

/// Result alias used throughout the crate
pub type Result<T> = std::result::Result<T, SessionError>;

/// Errors surfaced by session operations
#[derive(Debug, Error)]
pub enum SessionError {
    /// The session (or its refresh token) is missing or no longer valid.
    /// Recoverable only by logging in again.
    #[error("{message}")]
    Unauthorised {
        /// Human readable cause, echoed in logs
        message: String,
        /// Whether the response should expire every session token
        clear_tokens: bool,
    },

    /// The access token could not be trusted locally; the client should call
    /// the refresh endpoint and retry.
    #[error("{message}")]
    TryRefreshToken {
        /// Human readable cause
        message: String,
    },

    /// A refresh token from an already rotated chain was replayed
    #[error("token theft detected")]
    TokenTheftDetected {
        /// Handle of the compromised session
        session_handle: String,
        /// Owner of the compromised session
        user_id: String,
    },

    /// One or more required claims failed validation, in validator order
    #[error("invalid claim")]
    InvalidClaims {
        /// Failed validators with their reasons
        claims: Vec<ClaimValidationError>,
    },

    /// Transport, codec or configuration failure outside the session protocol
    #[error(transparent)]
    General(#[from] GeneralError),
}

/// Failures that are not part of the session state machine
#[derive(Debug, Error)]
pub enum GeneralError {
    /// The HTTP request to the core could not be completed
    #[error("core request failed: {0}")]
    Transport(#[from] reqwest::Error),

    /// The core answered with a status this SDK does not handle
    #[error("core returned status {status} for {path}: {body}")]
    CoreStatus {
        /// Request path
        path: String,
        /// HTTP status code
        status: u16,
        /// Raw response body
        body: String,
    },

    /// The core answered 2xx but the body did not have the expected shape
    #[error("unexpected core response for {path}: {message}")]
    UnexpectedResponse {
        /// Request path
        path: String,
        /// What was wrong with it
        message: String,
    },

    /// JSON encoding or decoding failed
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// Invalid or inconsistent configuration
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Attempt to write a reserved access token payload key
    #[error("'{0}' is a protected access token payload key")]
    ProtectedPayloadKey(String),

    /// A header or cookie value could not be encoded
    #[error("invalid header value: {0}")]
    Header(String),

    /// An internal assumption did not hold. Never expected to reach callers.
    #[error("invariant violated: {0}")]
    InvariantViolation(String),
}

impl SessionError {
    /// Create an unauthorised error
    pub fn unauthorised(message: impl Into<String>, clear_tokens: bool) -> Self {
        Self::Unauthorised {
            message: message.into(),
            clear_tokens,
        }
    }

    /// Create a try-refresh-token error
    pub fn try_refresh(message: impl Into<String>) -> Self {
        Self::TryRefreshToken {
            message: message.into(),
        }
    }

    /// Create an invariant violation
    pub fn invariant(message: impl Into<String>) -> Self {
        Self::General(GeneralError::InvariantViolation(message.into()))
    }

    /// Create a configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Self::General(GeneralError::Config(message.into()))
    }

    /// Short machine-readable name of the error kind
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Unauthorised { .. } => "UNAUTHORISED",
            Self::TryRefreshToken { .. } => "TRY_REFRESH_TOKEN",
            Self::TokenTheftDetected { .. } => "TOKEN_THEFT_DETECTED",
            Self::InvalidClaims { .. } => "INVALID_CLAIMS",
            Self::General(_) => "GENERAL_ERROR",
        }
    }

    /// Whether handling this error should expire the session tokens on the response
    pub fn should_clear_tokens(&self) -> bool {
        match self {
            Self::Unauthorised { clear_tokens, .. } => *clear_tokens,
            Self::TokenTheftDetected { .. } => true,
            _ => false,
        }
    }

    /// True for [`SessionError::TryRefreshToken`]
    pub fn is_try_refresh(&self) -> bool {
        matches!(self, Self::TryRefreshToken { .. })
    }

    /// True for [`SessionError::Unauthorised`]
    pub fn is_unauthorised(&self) -> bool {
        matches!(self, Self::Unauthorised { .. })
    }
}

impl From<reqwest::Error> for SessionError {
    fn from(err: reqwest::Error) -> Self {
        Self::General(GeneralError::Transport(err))
    }
}

impl From<serde_json::Error> for SessionError {
    fn from(err: serde_json::Error) -> Self {
        Self::General(GeneralError::Json(err))
    }
}
