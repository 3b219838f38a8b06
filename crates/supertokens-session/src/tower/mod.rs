//! # Tower middleware for session verification
//!
//! - [`VerifySessionLayer`] wraps a service with [`VerifySessionService`]
//! - [`VerifySessionService`] verifies the session before the inner service runs
//!
//! ## Usage
//!
//! ```rust,ignore
//! use axum::{Router, routing::get};
//! use supertokens_session::tower::VerifySessionLayer;
//!
//! let app = Router::new()
//!     .route("/me", get(me))
//!     .layer(VerifySessionLayer::new(engine.clone()));
//! ```
//!
//! ## Request extensions
//!
//! On success the [`SessionContainer`] (when there is one) and the request's
//! [`PendingResponse`] are inserted into the request extensions. Handlers take
//! the container as an extractor:
//!
//! ```rust,ignore
//! async fn me(session: SessionContainer) -> String {
//!     session.get_user_id()
//! }
//! ```
//!
//! Token changes queued while the handler runs (a regenerated access token,
//! a revoked session) are written to the handler's response.

mod layer;
mod service;

pub use layer::VerifySessionLayer;
pub use service::{VerifySessionFuture, VerifySessionService};

use axum::Json;
use axum::extract::{FromRequestParts, OptionalFromRequestParts};
use axum::http::StatusCode;
use axum::http::request::Parts;
use axum::response::{IntoResponse, Response};
use serde_json::json;

use crate::container::SessionContainer;
use crate::transfer::PendingResponse;

/// Rejection of the session extractors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionRejection {
    /// The route is not behind [`VerifySessionLayer`], or the session was optional and absent
    MissingSession,
    /// The route is not behind [`VerifySessionLayer`]
    MissingPendingResponse,
}

impl IntoResponse for SessionRejection {
    fn into_response(self) -> Response {
        match self {
            Self::MissingSession => {
                (StatusCode::UNAUTHORIZED, Json(json!({ "message": "unauthorised" })))
                    .into_response()
            }
            Self::MissingPendingResponse => (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "message": "session middleware is not installed" })),
            )
                .into_response(),
        }
    }
}

impl<S> FromRequestParts<S> for SessionContainer
where
    S: Send + Sync,
{
    type Rejection = SessionRejection;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .extensions
            .get::<SessionContainer>()
            .cloned()
            .ok_or(SessionRejection::MissingSession)
    }
}

impl<S> OptionalFromRequestParts<S> for SessionContainer
where
    S: Send + Sync,
{
    type Rejection = SessionRejection;

    async fn from_request_parts(
        parts: &mut Parts,
        _state: &S,
    ) -> Result<Option<Self>, Self::Rejection> {
        Ok(parts.extensions.get::<SessionContainer>().cloned())
    }
}

impl<S> FromRequestParts<S> for PendingResponse
where
    S: Send + Sync,
{
    type Rejection = SessionRejection;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .extensions
            .get::<PendingResponse>()
            .cloned()
            .ok_or(SessionRejection::MissingPendingResponse)
    }
}
