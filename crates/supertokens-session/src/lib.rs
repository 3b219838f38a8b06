//! # SuperTokens Session
//!
//! Backend session management over a remote SuperTokens core: issue, verify,
//! refresh and revoke sessions, with the core as the source of truth.
//!
//! ## Design Principles
//!
//! - **Explicit engine**: one [`SessionEngine`] built at startup and shared by handlers
//! - **Local first**: access tokens are verified against cached signing keys and
//!   only sent to the core when the token or configuration demands it
//! - **Typed payloads**: reserved access token keys are rejected on insertion
//! - **Composable recipe**: overrides wrap the [`SessionRecipe`] as decorators
//!
//! ## Architecture
//!
//! - [`config`] - `SessionConfig` and its normalised form
//! - [`querier`] - HTTP client for the core (version negotiation, host failover, 429 retries)
//! - [`jwt`] - token decoding, RS256 verification and the signing key cache
//! - [`access_token`] - access token versions and structural validation
//! - [`payload`] - the access token payload
//! - [`claims`] - claims and validators on top of the payload
//! - [`recipe`] - token-level session operations and the override chain
//! - [`verification`] - the access token verification state machine
//! - [`transfer`] - cookies, headers and the `front-token` protocol
//! - [`container`] - the per-request [`SessionContainer`]
//! - [`engine`] - request-level operations and error mapping
//! - [`api`] - refresh, sign-out, JWKS and discovery routes (axum)
//! - [`tower`] - the verify-session middleware
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use supertokens_session::{SessionConfig, SessionEngine};
//!
//! # fn main() -> supertokens_session::Result<()> {
//! let engine = SessionEngine::new(SessionConfig::new(
//!     "http://localhost:3567",
//!     "https://api.example.com",
//!     "https://example.com",
//! ))?;
//!
//! let app = axum::Router::new()
//!     .merge(supertokens_session::api::router(engine.clone()));
//! # let _ = app;
//! # Ok(())
//! # }
//! ```
//!
//! ## Error kinds
//!
//! | Error | Frontend action | Default status |
//! |-------|-----------------|----------------|
//! | `Unauthorised` | log in again | 401 |
//! | `TryRefreshToken` | call the refresh endpoint | 401 |
//! | `TokenTheftDetected` | session revoked, warn the user | 401 |
//! | `InvalidClaims` | satisfy the claims | 403 |

pub mod access_token;
pub mod api;
pub mod claims;
pub mod config;
pub mod container;
pub mod engine;
pub mod error;
pub mod jwt;
pub mod payload;
pub mod querier;
pub mod recipe;
pub mod tower;
pub mod transfer;
pub mod utils;
pub mod verification;

#[doc(inline)]
pub use config::{AntiCsrfMode, AppInfo, CookieSameSite, SessionConfig, TokenTransferMethod};

#[doc(inline)]
pub use error::{GeneralError, Result, SessionError};

#[doc(inline)]
pub use engine::{OpenIdDiscovery, SessionEngine, SessionEngineBuilder, VerifySessionOptions};

#[doc(inline)]
pub use container::{SessionContainer, SessionTokens};

#[doc(inline)]
pub use payload::AccessTokenPayload;

#[doc(inline)]
pub use claims::{
    BooleanClaim, ClaimValidationError, PrimitiveArrayClaim, PrimitiveClaim, SessionClaim,
    SessionClaimValidator,
};

#[doc(inline)]
pub use recipe::{CoreSessionRecipe, SessionRecipe};

#[doc(inline)]
pub use transfer::{PendingResponse, SessionRequest, TransferMethod};

#[doc(inline)]
pub use api::ErrorHandlers;
