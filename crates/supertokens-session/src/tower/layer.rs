//! Tower Layer for session verification

use tower::Layer;

use super::service::VerifySessionService;
use crate::engine::{SessionEngine, VerifySessionOptions};

/// Tower Layer that verifies the session of every request
///
/// ```rust,ignore
/// use tower::ServiceBuilder;
/// use supertokens_session::{VerifySessionOptions, tower::VerifySessionLayer};
///
/// let service = ServiceBuilder::new()
///     .layer(VerifySessionLayer::with_options(engine, VerifySessionOptions::optional()))
///     .service(my_inner_service);
/// ```
#[derive(Debug, Clone)]
pub struct VerifySessionLayer {
    engine: SessionEngine,
    options: VerifySessionOptions,
}

impl VerifySessionLayer {
    /// Require a session with default verification options
    pub fn new(engine: SessionEngine) -> Self {
        Self::with_options(engine, VerifySessionOptions::default())
    }

    /// Verify with custom options
    pub fn with_options(engine: SessionEngine, options: VerifySessionOptions) -> Self {
        Self { engine, options }
    }

    /// Let requests without a session through
    #[must_use]
    pub fn optional(mut self) -> Self {
        self.options.session_required = false;
        self
    }

    /// Options applied to every request
    pub fn options(&self) -> &VerifySessionOptions {
        &self.options
    }
}

impl<S> Layer<S> for VerifySessionLayer {
    type Service = VerifySessionService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        VerifySessionService::new(inner, self.engine.clone(), self.options.clone())
    }
}
