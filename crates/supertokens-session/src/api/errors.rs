//! Mapping of session errors to HTTP responses

use std::fmt;
use std::sync::Arc;

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;

use crate::claims::ClaimValidationError;
use crate::config::NormalisedConfig;

/// Builds the response for an error that carries only a message
pub type MessageHandler = Arc<dyn Fn(&str) -> Response + Send + Sync>;
/// Builds the response for token theft, given `(session_handle, user_id)`
pub type TokenTheftHandler = Arc<dyn Fn(&str, &str) -> Response + Send + Sync>;
/// Builds the response for failed claim validators
pub type InvalidClaimHandler = Arc<dyn Fn(&[ClaimValidationError]) -> Response + Send + Sync>;

/// Pluggable responses per session error kind
///
/// The engine decides whether tokens are cleared and revokes stolen sessions
/// before a handler runs; handlers only shape the body and status.
#[derive(Clone)]
pub struct ErrorHandlers {
    pub(crate) on_unauthorised: MessageHandler,
    pub(crate) on_try_refresh: MessageHandler,
    pub(crate) on_token_theft: TokenTheftHandler,
    pub(crate) on_invalid_claim: InvalidClaimHandler,
}

impl fmt::Debug for ErrorHandlers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ErrorHandlers").finish_non_exhaustive()
    }
}

fn message_response(status: StatusCode, message: &'static str) -> MessageHandler {
    Arc::new(move |_: &str| (status, Json(json!({ "message": message }))).into_response())
}

impl ErrorHandlers {
    /// Default handlers with the given status codes
    pub fn new(session_expired: StatusCode, invalid_claim: StatusCode) -> Self {
        Self {
            on_unauthorised: message_response(session_expired, "unauthorised"),
            on_try_refresh: message_response(session_expired, "try refresh token"),
            on_token_theft: Arc::new(move |_: &str, _: &str| {
                (session_expired, Json(json!({ "message": "token theft detected" })))
                    .into_response()
            }),
            on_invalid_claim: Arc::new(move |claims: &[ClaimValidationError]| {
                (
                    invalid_claim,
                    Json(json!({
                        "message": "invalid claim",
                        "claimValidationErrors": claims,
                    })),
                )
                    .into_response()
            }),
        }
    }

    /// Default handlers with the status codes from configuration
    pub fn from_config(config: &NormalisedConfig) -> Self {
        Self::new(
            StatusCode::from_u16(config.session_expired_status_code)
                .unwrap_or(StatusCode::UNAUTHORIZED),
            StatusCode::from_u16(config.invalid_claim_status_code)
                .unwrap_or(StatusCode::FORBIDDEN),
        )
    }

    /// Replace the unauthorised handler
    #[must_use]
    pub fn with_unauthorised(
        mut self,
        handler: impl Fn(&str) -> Response + Send + Sync + 'static,
    ) -> Self {
        self.on_unauthorised = Arc::new(handler);
        self
    }

    /// Replace the try-refresh-token handler
    #[must_use]
    pub fn with_try_refresh(
        mut self,
        handler: impl Fn(&str) -> Response + Send + Sync + 'static,
    ) -> Self {
        self.on_try_refresh = Arc::new(handler);
        self
    }

    /// Replace the token theft handler
    #[must_use]
    pub fn with_token_theft(
        mut self,
        handler: impl Fn(&str, &str) -> Response + Send + Sync + 'static,
    ) -> Self {
        self.on_token_theft = Arc::new(handler);
        self
    }

    /// Replace the invalid claim handler
    #[must_use]
    pub fn with_invalid_claim(
        mut self,
        handler: impl Fn(&[ClaimValidationError]) -> Response + Send + Sync + 'static,
    ) -> Self {
        self.on_invalid_claim = Arc::new(handler);
        self
    }
}

impl Default for ErrorHandlers {
    fn default() -> Self {
        Self::new(StatusCode::UNAUTHORIZED, StatusCode::FORBIDDEN)
    }
}

/// Response for failures outside the session protocol
pub(crate) fn general_error_response() -> Response {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({ "message": "internal server error" })),
    )
        .into_response()
}
