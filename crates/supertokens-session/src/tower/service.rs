//! Tower Service that verifies sessions
//!
//! The flow for each request:
//! 1. Verify the session with [`SessionEngine::get_session`]
//! 2. On success, insert the container and the pending response into the
//!    request extensions and call the inner service
//! 3. Apply the pending token changes to the inner service's response
//! 4. On a session error, answer through the engine's error handlers without
//!    calling the inner service

use std::task::{Context, Poll};

use axum::response::Response;
use futures::future::BoxFuture;
use http::Request;
use tower::Service;
use tracing::debug;

use crate::engine::{SessionEngine, VerifySessionOptions};
use crate::transfer::{PendingResponse, SessionRequest};

/// Tower Service produced by [`VerifySessionLayer`](super::VerifySessionLayer)
#[derive(Debug, Clone)]
pub struct VerifySessionService<S> {
    inner: S,
    engine: SessionEngine,
    options: VerifySessionOptions,
}

impl<S> VerifySessionService<S> {
    /// Create a new verifying service
    pub fn new(inner: S, engine: SessionEngine, options: VerifySessionOptions) -> Self {
        Self {
            inner,
            engine,
            options,
        }
    }

    /// Get a reference to the inner service
    pub fn inner(&self) -> &S {
        &self.inner
    }
}

/// Future returned by [`VerifySessionService`]
pub type VerifySessionFuture<T, E> = BoxFuture<'static, Result<T, E>>;

impl<S, B> Service<Request<B>> for VerifySessionService<S>
where
    S: Service<Request<B>, Response = Response> + Clone + Send + 'static,
    S::Future: Send,
    B: Send + 'static,
{
    type Response = Response;
    type Error = S::Error;
    type Future = VerifySessionFuture<Self::Response, Self::Error>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request<B>) -> Self::Future {
        let engine = self.engine.clone();
        let options = self.options.clone();
        let inner = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, inner);

        Box::pin(async move {
            let (mut parts, body) = req.into_parts();
            let pending = PendingResponse::new();

            let verified = engine
                .get_session(&SessionRequest::from(&parts), &pending, &options)
                .await;

            match verified {
                Ok(session) => {
                    if let Some(session) = session {
                        debug!(
                            session_handle = %session.get_handle(),
                            path = %parts.uri.path(),
                            "Session verified"
                        );
                        parts.extensions.insert(session);
                    }
                    parts.extensions.insert(pending.clone());

                    let mut response = inner.call(Request::from_parts(parts, body)).await?;
                    pending.apply_to(response.headers_mut());
                    Ok(response)
                }
                Err(e) => {
                    debug!(kind = e.kind(), path = %parts.uri.path(), "Session verification failed");
                    Ok(engine.handle_error(e, &pending).await)
                }
            }
        })
    }
}
