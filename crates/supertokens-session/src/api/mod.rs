//! HTTP routes exposed by the SDK
//!
//! | Route | Handler |
//! |-------|---------|
//! | `POST {apiBasePath}/session/refresh` | rotate the refresh token |
//! | `POST {apiBasePath}/signout` | revoke the current session, if any |
//! | `GET {apiBasePath}/jwt/jwks.json` | the core's public signing keys |
//! | `GET /.well-known/openid-configuration` | discovery document |
//!
//! Merge the router into the application's own:
//!
//! ```rust,ignore
//! let app = Router::new()
//!     .route("/login", post(login))
//!     .merge(supertokens_session::api::router(engine.clone()));
//! ```

pub mod errors;

use axum::extract::State;
use axum::http::{HeaderMap, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::json;
use tracing::debug;

use crate::engine::{SessionEngine, VerifySessionOptions};
use crate::error::SessionError;
use crate::transfer::{PendingResponse, SessionRequest};

pub use errors::ErrorHandlers;

/// Path of the OpenID discovery document
pub const OPENID_CONFIGURATION_PATH: &str = "/.well-known/openid-configuration";

/// Apply queued token changes to a handler's response
pub fn respond(pending: &PendingResponse, response: impl IntoResponse) -> Response {
    let mut response = response.into_response();
    pending.apply_to(response.headers_mut());
    response
}

fn status_ok(pending: &PendingResponse) -> Response {
    respond(pending, (StatusCode::OK, Json(json!({ "status": "OK" }))))
}

/// Router with the session routes, mounted under the configured API base path
pub fn router(engine: SessionEngine) -> Router {
    let base = engine.config().api_base_path.clone();
    Router::new()
        .route(&format!("{base}/session/refresh"), post(refresh))
        .route(&format!("{base}/signout"), post(sign_out))
        .route(&format!("{base}/jwt/jwks.json"), get(jwks))
        .route(OPENID_CONFIGURATION_PATH, get(openid_configuration))
        .with_state(engine)
}

async fn refresh(State(engine): State<SessionEngine>, method: Method, headers: HeaderMap) -> Response {
    let pending = PendingResponse::new();
    match engine
        .refresh_session(&SessionRequest::new(&method, &headers), &pending)
        .await
    {
        Ok(_) => status_ok(&pending),
        Err(e) => engine.handle_error(e, &pending).await,
    }
}

async fn sign_out(
    State(engine): State<SessionEngine>,
    method: Method,
    headers: HeaderMap,
) -> Response {
    let pending = PendingResponse::new();
    let session = engine
        .get_session(
            &SessionRequest::new(&method, &headers),
            &pending,
            &VerifySessionOptions::optional(),
        )
        .await;

    match session {
        Ok(Some(session)) => match session.revoke_session().await {
            Ok(()) => status_ok(&pending),
            Err(e) => engine.handle_error(e, &pending).await,
        },
        Ok(None) => status_ok(&pending),
        Err(SessionError::Unauthorised { message, .. }) => {
            debug!(%message, "Sign out without a live session");
            status_ok(&pending)
        }
        Err(e) => engine.handle_error(e, &pending).await,
    }
}

async fn jwks(State(engine): State<SessionEngine>) -> Response {
    match engine.get_jwks().await {
        Ok(keys) => (StatusCode::OK, Json(keys)).into_response(),
        Err(e) => engine.handle_error(e, &PendingResponse::new()).await,
    }
}

async fn openid_configuration(State(engine): State<SessionEngine>) -> Response {
    (
        StatusCode::OK,
        Json(engine.get_open_id_discovery_configuration()),
    )
        .into_response()
}
