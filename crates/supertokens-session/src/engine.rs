//! Session engine
//!
//! [`SessionEngine`] is built once at startup and shared by every handler. It
//! owns the core client, the signing key cache and the recipe chain, and it
//! turns HTTP requests into session operations:
//!
//! - [`create_new_session`](SessionEngine::create_new_session) after login
//! - [`get_session`](SessionEngine::get_session) on every protected request
//! - [`refresh_session`](SessionEngine::refresh_session) from the refresh endpoint
//!
//! Response changes are queued on a [`PendingResponse`] the caller applies to
//! its outgoing response.

use std::fmt;
use std::sync::Arc;

use axum::response::Response;
use http::Method;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, error, info, warn};

use crate::access_token::validate_access_token_structure;
use crate::api::errors::{ErrorHandlers, general_error_response};
use crate::claims::{ClaimValidationError, SessionClaim, SessionClaimValidator};
use crate::config::{AntiCsrfMode, CookieSameSite, NormalisedConfig, SessionConfig};
use crate::container::SessionContainer;
use crate::error::{Result, SessionError};
use crate::jwt::{JWKS_PATH, SigningKeyCache, parse_without_verification};
use crate::payload::AccessTokenPayload;
use crate::querier::{CoreQuerier, RetryConfig};
use crate::recipe::{
    CoreSessionRecipe, CreateSessionInput, CreatedSession, GetSessionInput, RecipeChain,
    RecipeOverride, SessionInformation, SessionRecipe, build_recipe_chain,
};
use crate::transfer::{
    AVAILABLE_TRANSFER_METHODS, PendingResponse, SessionRequest, TokenType, TransferMethod,
    clear_legacy_id_refresh_token, clear_session, clear_session_from_all_methods,
    output_transfer_method,
};

const INSECURE_CROSS_SITE_COOKIES: &str = "Since your API and website domain are different, for sessions to work, please use https on your apiDomain and dont set cookieSecure to false.";
const NO_SESSION: &str = "Session does not exist. Are you sending the session tokens in the request with the appropriate token transfer method?";
const NO_REFRESH_TOKEN: &str =
    "Refresh token not found. Are you sending the refresh token in the request?";
const LEGACY_SESSION: &str = "using legacy session, please call the refresh API";
const LEGACY_REFRESH_CLEARED: &str =
    "Cleared legacy id refresh token because refresh token was not found";
const MISSING_RID_ON_VERIFY: &str = "anti-csrf check failed. Please pass 'rid: \"session\"' header in the request, or set doAntiCsrfCheck to false for this API";
const MISSING_RID_ON_REFRESH: &str =
    "anti-csrf check failed. Please pass 'rid: \"session\"' header in the request.";

/// Rewrites the global claim validators for one verification
pub type ValidatorOverride =
    Arc<dyn Fn(Vec<SessionClaimValidator>) -> Vec<SessionClaimValidator> + Send + Sync>;

/// Options of [`SessionEngine::get_session`]
#[derive(Clone)]
pub struct VerifySessionOptions {
    /// Force the anti-CSRF check on or off; by default it runs for every method but GET
    pub anti_csrf_check: Option<bool>,
    /// Fail with `Unauthorised` when there is no session; otherwise yield `None`
    pub session_required: bool,
    /// Always confirm the session with the core
    pub check_database: bool,
    /// Replace or extend the engine's global claim validators
    pub override_global_claim_validators: Option<ValidatorOverride>,
}

impl Default for VerifySessionOptions {
    fn default() -> Self {
        Self {
            anti_csrf_check: None,
            session_required: true,
            check_database: false,
            override_global_claim_validators: None,
        }
    }
}

impl fmt::Debug for VerifySessionOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VerifySessionOptions")
            .field("anti_csrf_check", &self.anti_csrf_check)
            .field("session_required", &self.session_required)
            .field("check_database", &self.check_database)
            .field(
                "override_global_claim_validators",
                &self.override_global_claim_validators.is_some(),
            )
            .finish()
    }
}

impl VerifySessionOptions {
    /// Options for routes where a session is optional
    pub fn optional() -> Self {
        Self {
            session_required: false,
            ..Self::default()
        }
    }

    /// Set the anti-CSRF check explicitly
    #[must_use]
    pub fn with_anti_csrf_check(mut self, check: bool) -> Self {
        self.anti_csrf_check = Some(check);
        self
    }

    /// Always confirm the session with the core
    #[must_use]
    pub fn with_check_database(mut self, check: bool) -> Self {
        self.check_database = check;
        self
    }

    /// Rewrite the global claim validators
    #[must_use]
    pub fn with_claim_validators(
        mut self,
        rewrite: impl Fn(Vec<SessionClaimValidator>) -> Vec<SessionClaimValidator>
        + Send
        + Sync
        + 'static,
    ) -> Self {
        self.override_global_claim_validators = Some(Arc::new(rewrite));
        self
    }
}

/// OpenID discovery document
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpenIdDiscovery {
    /// Token issuer
    pub issuer: String,
    /// Where the public signing keys are served
    pub jwks_uri: String,
}

struct EngineInner {
    config: Arc<NormalisedConfig>,
    querier: Arc<CoreQuerier>,
    keys: Arc<SigningKeyCache>,
    recipe: Arc<dyn SessionRecipe>,
    claims: Vec<Arc<dyn SessionClaim>>,
    global_validators: Vec<SessionClaimValidator>,
    error_handlers: ErrorHandlers,
}

/// Shared session engine; clones are cheap and share state
#[derive(Clone)]
pub struct SessionEngine {
    inner: Arc<EngineInner>,
}

impl fmt::Debug for SessionEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionEngine")
            .field("api_base_path", &self.inner.config.api_base_path)
            .field("recipe", &RecipeChain(self.inner.recipe.as_ref()))
            .field("claims", &self.inner.claims.len())
            .field("global_validators", &self.inner.global_validators)
            .finish_non_exhaustive()
    }
}

/// Builder for [`SessionEngine`]
pub struct SessionEngineBuilder {
    config: SessionConfig,
    retry: Option<RetryConfig>,
    overrides: Vec<RecipeOverride>,
    claims: Vec<Arc<dyn SessionClaim>>,
    global_validators: Vec<SessionClaimValidator>,
    error_handlers: Option<ErrorHandlers>,
}

impl fmt::Debug for SessionEngineBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionEngineBuilder")
            .field("config", &self.config)
            .field("overrides", &self.overrides.len())
            .field("claims", &self.claims.len())
            .field("global_validators", &self.global_validators.len())
            .finish_non_exhaustive()
    }
}

impl SessionEngineBuilder {
    /// Replace the rate-limit retry policy of the core client
    #[must_use]
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = Some(retry);
        self
    }

    /// Wrap the recipe; the last registered override is the outermost layer
    #[must_use]
    pub fn with_override(
        mut self,
        wrap: impl Fn(Arc<dyn SessionRecipe>) -> Arc<dyn SessionRecipe> + Send + Sync + 'static,
    ) -> Self {
        self.overrides.push(Arc::new(wrap));
        self
    }

    /// Build this claim into every new session
    #[must_use]
    pub fn with_claim(mut self, claim: Arc<dyn SessionClaim>) -> Self {
        self.claims.push(claim);
        self
    }

    /// Check this validator on every verified request
    #[must_use]
    pub fn with_global_validator(mut self, validator: SessionClaimValidator) -> Self {
        self.global_validators.push(validator);
        self
    }

    /// Replace the error responses
    #[must_use]
    pub fn with_error_handlers(mut self, handlers: ErrorHandlers) -> Self {
        self.error_handlers = Some(handlers);
        self
    }

    /// Validate the configuration and assemble the engine
    ///
    /// # Errors
    ///
    /// Returns a configuration error for invalid domains, paths or core hosts.
    pub fn build(self) -> Result<SessionEngine> {
        let config = Arc::new(self.config.normalise()?);
        let mut querier = CoreQuerier::new(&self.config)?;
        if let Some(retry) = self.retry {
            querier = querier.with_retry(retry);
        }
        let querier = Arc::new(querier);
        let keys = Arc::new(SigningKeyCache::new(
            Arc::clone(&querier),
            config.jwks_refresh_interval,
        ));
        let root: Arc<dyn SessionRecipe> = Arc::new(CoreSessionRecipe::new(
            Arc::clone(&querier),
            Arc::clone(&keys),
            Arc::clone(&config),
        ));
        let recipe = build_recipe_chain(root, &self.overrides);
        let error_handlers = self
            .error_handlers
            .unwrap_or_else(|| ErrorHandlers::from_config(&config));

        info!(
            hosts = ?querier.hosts(),
            api_base_path = %config.api_base_path,
            anti_csrf = ?config.anti_csrf,
            overrides = self.overrides.len(),
            "Session engine initialised"
        );

        Ok(SessionEngine {
            inner: Arc::new(EngineInner {
                config,
                querier,
                keys,
                recipe,
                claims: self.claims,
                global_validators: self.global_validators,
                error_handlers,
            }),
        })
    }
}

impl SessionEngine {
    /// Engine with default recipe, no claims and default error responses
    ///
    /// # Errors
    ///
    /// Returns a configuration error for invalid domains, paths or core hosts.
    pub fn new(config: SessionConfig) -> Result<Self> {
        Self::builder(config).build()
    }

    /// Start configuring an engine
    pub fn builder(config: SessionConfig) -> SessionEngineBuilder {
        SessionEngineBuilder {
            config,
            retry: None,
            overrides: Vec::new(),
            claims: Vec::new(),
            global_validators: Vec::new(),
            error_handlers: None,
        }
    }

    /// Normalised configuration
    pub fn config(&self) -> &NormalisedConfig {
        &self.inner.config
    }

    /// Outermost recipe of the override chain
    pub fn recipe(&self) -> &Arc<dyn SessionRecipe> {
        &self.inner.recipe
    }

    /// Core client
    pub fn querier(&self) -> &CoreQuerier {
        &self.inner.querier
    }

    /// Signing key cache
    pub fn signing_keys(&self) -> &SigningKeyCache {
        &self.inner.keys
    }

    /// Error responses
    pub fn error_handlers(&self) -> &ErrorHandlers {
        &self.inner.error_handlers
    }

    /// Validators checked on every verified request
    pub fn global_claim_validators(&self) -> &[SessionClaimValidator] {
        &self.inner.global_validators
    }

    fn container_from_created(
        &self,
        response: &PendingResponse,
        method: TransferMethod,
        created: CreatedSession,
    ) -> SessionContainer {
        SessionContainer::from_created(
            Arc::clone(&self.inner.recipe),
            Arc::clone(&self.inner.config),
            response.clone(),
            method,
            created,
        )
    }

    /// Create a session and queue its tokens on `response`
    ///
    /// Tokens go out with the output transfer method; access tokens that came
    /// in with the other method are cleared.
    ///
    /// # Errors
    ///
    /// Rejects cross-site cookies without `Secure` outside local development,
    /// reserved payload keys, and core failures.
    pub async fn create_new_session(
        &self,
        request: &SessionRequest<'_>,
        response: &PendingResponse,
        tenant_id: &str,
        user_id: &str,
        access_token_payload: Map<String, Value>,
        session_data_in_database: Value,
    ) -> Result<SessionContainer> {
        let config = &self.inner.config;
        let output = output_transfer_method(config, request);

        if output == TransferMethod::Cookie
            && config.cookie_same_site == CookieSameSite::None
            && !config.cookie_secure
            && !(config.api_is_local() && config.website_is_local())
        {
            return Err(SessionError::config(INSECURE_CROSS_SITE_COOKIES));
        }

        let mut payload = AccessTokenPayload::from_user(access_token_payload)?;
        for claim in &self.inner.claims {
            claim.build(user_id, tenant_id, &mut payload).await?;
        }

        let created = self
            .inner
            .recipe
            .create_new_session(CreateSessionInput {
                user_id: user_id.to_string(),
                tenant_id: tenant_id.to_string(),
                access_token_payload: payload,
                session_data_in_database,
                disable_anti_csrf: output == TransferMethod::Header,
            })
            .await?;

        for method in AVAILABLE_TRANSFER_METHODS {
            if method != output && request.token(TokenType::Access, method).is_some() {
                debug!(%method, "Clearing access token sent with another transfer method");
                clear_session(config, response, method)?;
            }
        }

        let container = self.container_from_created(response, output, created);
        container.attach_to_response()?;
        Ok(container)
    }

    /// Access token of the request and the method it arrived with
    ///
    /// Header wins when both are present. Tokens that do not parse, or whose
    /// payload lacks a mandatory field, count as absent so the other method
    /// can still supply the session.
    fn request_access_token(
        &self,
        request: &SessionRequest<'_>,
    ) -> Option<(String, TransferMethod)> {
        [TransferMethod::Header, TransferMethod::Cookie]
            .into_iter()
            .filter(|method| method.allowed_by(self.inner.config.token_transfer_method))
            .find_map(|method| {
                let token = request.token(TokenType::Access, method)?;
                let jwt = match parse_without_verification(&token) {
                    Ok(jwt) => jwt,
                    Err(e) => {
                        debug!(%method, error = %e, "Ignoring token that is not an access token");
                        return None;
                    }
                };
                match validate_access_token_structure(&jwt.payload, jwt.version) {
                    Ok(()) => Some((token, method)),
                    Err(e) => {
                        debug!(%method, error = %e, "Ignoring malformed access token");
                        None
                    }
                }
            })
    }

    /// Verify the session of a request
    ///
    /// Returns `Ok(None)` only when the session is optional and absent. A new
    /// access token issued by the core during verification is queued on
    /// `response`. Global claim validators (or their override) run last.
    ///
    /// # Errors
    ///
    /// `TryRefreshToken`, `Unauthorised` or `InvalidClaims` as the request
    /// warrants; general errors for core failures.
    pub async fn get_session(
        &self,
        request: &SessionRequest<'_>,
        response: &PendingResponse,
        options: &VerifySessionOptions,
    ) -> Result<Option<SessionContainer>> {
        if request.has_legacy_id_refresh_token() {
            debug!("Request carries a legacy id refresh token");
            return Err(SessionError::try_refresh(LEGACY_SESSION));
        }

        let Some((access_token, method)) = self.request_access_token(request) else {
            if options.session_required {
                return Err(SessionError::unauthorised(NO_SESSION, false));
            }
            debug!("No session on request and session is optional");
            return Ok(None);
        };

        let mut anti_csrf_check = options
            .anti_csrf_check
            .unwrap_or(*request.method != Method::GET);
        if method == TransferMethod::Header {
            anti_csrf_check = false;
        }
        if anti_csrf_check && self.inner.config.anti_csrf == AntiCsrfMode::ViaCustomHeader {
            if !request.has_rid_header() {
                warn!("Custom header anti-csrf check failed");
                return Err(SessionError::try_refresh(MISSING_RID_ON_VERIFY));
            }
            anti_csrf_check = false;
        }

        let anti_csrf_token = request.anti_csrf_token();
        let verified = match self
            .inner
            .recipe
            .get_session(
                &access_token,
                anti_csrf_token.as_deref(),
                GetSessionInput {
                    anti_csrf_check,
                    check_database: options.check_database,
                },
            )
            .await
        {
            Ok(verified) => verified,
            Err(SessionError::Unauthorised { message, .. }) if !options.session_required => {
                debug!(%message, "Session is optional; treating unauthorised as no session");
                return Ok(None);
            }
            Err(e) => return Err(e),
        };

        let token_changed = verified.new_access_token.is_some();
        let container = SessionContainer::from_verified(
            Arc::clone(&self.inner.recipe),
            Arc::clone(&self.inner.config),
            response.clone(),
            method,
            verified,
        );
        if token_changed {
            container.attach_to_response()?;
        }

        let mut validators = self.inner.global_validators.clone();
        if let Some(rewrite) = &options.override_global_claim_validators {
            validators = rewrite(validators);
        }
        if !validators.is_empty() {
            container.assert_claims(&validators).await?;
        }

        Ok(Some(container))
    }

    /// Rotate the refresh token of a request
    ///
    /// The new tokens are queued with the method the refresh token arrived
    /// with; a refresh token sent with the other method is cleared.
    ///
    /// # Errors
    ///
    /// `Unauthorised` when there is no usable refresh token,
    /// `TokenTheftDetected` when a rotated token is replayed.
    pub async fn refresh_session(
        &self,
        request: &SessionRequest<'_>,
        response: &PendingResponse,
    ) -> Result<SessionContainer> {
        let config = &self.inner.config;
        let Some((refresh_token, method)) = [TransferMethod::Header, TransferMethod::Cookie]
            .into_iter()
            .filter(|method| method.allowed_by(config.token_transfer_method))
            .find_map(|method| {
                request
                    .token(TokenType::Refresh, method)
                    .map(|token| (token, method))
            })
        else {
            if request.has_legacy_id_refresh_token() {
                clear_legacy_id_refresh_token(config, response)?;
                return Err(SessionError::unauthorised(LEGACY_REFRESH_CLEARED, false));
            }
            return Err(SessionError::unauthorised(NO_REFRESH_TOKEN, false));
        };

        let mut disable_anti_csrf = method == TransferMethod::Header;
        if config.anti_csrf == AntiCsrfMode::ViaCustomHeader && !disable_anti_csrf {
            if !request.has_rid_header() {
                warn!("Custom header anti-csrf check failed on refresh");
                return Err(SessionError::unauthorised(MISSING_RID_ON_REFRESH, false));
            }
            disable_anti_csrf = true;
        }

        let anti_csrf_token = request.anti_csrf_token();
        let created = match self
            .inner
            .recipe
            .refresh_session(&refresh_token, anti_csrf_token.as_deref(), disable_anti_csrf)
            .await
        {
            Ok(created) => created,
            Err(e) => {
                if e.should_clear_tokens() && request.has_legacy_id_refresh_token() {
                    clear_legacy_id_refresh_token(config, response)?;
                }
                return Err(e);
            }
        };

        for other in AVAILABLE_TRANSFER_METHODS {
            if other != method && request.token(TokenType::Refresh, other).is_some() {
                clear_session(config, response, other)?;
            }
        }

        let container = self.container_from_created(response, method, created);
        container.attach_to_response()?;
        if request.has_legacy_id_refresh_token() {
            clear_legacy_id_refresh_token(config, response)?;
        }

        debug!(session_handle = %container.get_handle(), %method, "Session refreshed");
        Ok(container)
    }

    /// Revoke one session; `false` when it did not exist
    ///
    /// # Errors
    ///
    /// Propagates core failures.
    pub async fn revoke_session(&self, session_handle: &str) -> Result<bool> {
        self.inner.recipe.revoke_session(session_handle).await
    }

    /// Revoke every session of a user
    ///
    /// # Errors
    ///
    /// Propagates core failures.
    pub async fn revoke_all_sessions_for_user(&self, user_id: &str) -> Result<Vec<String>> {
        self.inner.recipe.revoke_all_sessions_for_user(user_id).await
    }

    /// Handles of every live session of a user
    ///
    /// # Errors
    ///
    /// Propagates core failures.
    pub async fn get_all_session_handles_for_user(&self, user_id: &str) -> Result<Vec<String>> {
        self.inner
            .recipe
            .get_all_session_handles_for_user(user_id)
            .await
    }

    /// Stored state of a session
    ///
    /// # Errors
    ///
    /// Propagates core failures.
    pub async fn get_session_information(
        &self,
        session_handle: &str,
    ) -> Result<Option<SessionInformation>> {
        self.inner.recipe.get_session_information(session_handle).await
    }

    /// Replace the database-only session data
    ///
    /// # Errors
    ///
    /// Propagates core failures.
    pub async fn update_session_data_in_database(
        &self,
        session_handle: &str,
        data: Value,
    ) -> Result<bool> {
        self.inner
            .recipe
            .update_session_data_in_database(session_handle, data)
            .await
    }

    /// Merge into the stored access token payload of a session
    ///
    /// Takes effect on the client with the next refresh.
    ///
    /// # Errors
    ///
    /// Rejects reserved keys; propagates core failures.
    pub async fn merge_into_access_token_payload(
        &self,
        session_handle: &str,
        update: &Map<String, Value>,
    ) -> Result<bool> {
        self.inner
            .recipe
            .merge_into_access_token_payload(session_handle, update)
            .await
    }

    /// Fetch a claim and store it in the session's payload
    ///
    /// # Errors
    ///
    /// Propagates fetch and core failures.
    pub async fn fetch_and_set_claim(
        &self,
        session_handle: &str,
        claim: &dyn SessionClaim,
    ) -> Result<bool> {
        self.inner
            .recipe
            .fetch_and_set_claim(session_handle, claim)
            .await
    }

    /// Store an explicit claim value in the session's payload
    ///
    /// # Errors
    ///
    /// Propagates core failures.
    pub async fn set_claim_value(
        &self,
        session_handle: &str,
        claim: &dyn SessionClaim,
        value: Value,
    ) -> Result<bool> {
        self.inner
            .recipe
            .set_claim_value(session_handle, claim, value)
            .await
    }

    /// Read a claim from the session's stored payload
    ///
    /// # Errors
    ///
    /// Propagates core failures.
    pub async fn get_claim_value(
        &self,
        session_handle: &str,
        claim: &dyn SessionClaim,
    ) -> Result<Option<Value>> {
        self.inner
            .recipe
            .get_claim_value(session_handle, claim)
            .await
    }

    /// Remove a claim from the session's stored payload
    ///
    /// # Errors
    ///
    /// Propagates core failures.
    pub async fn remove_claim(&self, session_handle: &str, claim: &dyn SessionClaim) -> Result<bool> {
        self.inner.recipe.remove_claim(session_handle, claim).await
    }

    /// Run the global validators (optionally rewritten) against a stored session
    ///
    /// Refetched claims are merged into the stored payload. Returns `None`
    /// when the session does not exist.
    ///
    /// # Errors
    ///
    /// Propagates fetch and core failures.
    pub async fn validate_claims_for_session_handle(
        &self,
        session_handle: &str,
        override_validators: Option<&ValidatorOverride>,
    ) -> Result<Option<Vec<ClaimValidationError>>> {
        let Some(info) = self.get_session_information(session_handle).await? else {
            return Ok(None);
        };

        let mut validators = self.inner.global_validators.clone();
        if let Some(rewrite) = override_validators {
            validators = rewrite(validators);
        }

        let validation = self
            .inner
            .recipe
            .validate_claims(
                &info.user_id,
                &info.tenant_id,
                &info.custom_claims_in_access_token_payload,
                &validators,
            )
            .await?;

        if let Some(update) = &validation.access_token_payload_update
            && !self
                .merge_into_access_token_payload(session_handle, update.as_map())
                .await?
        {
            return Ok(None);
        }

        Ok(Some(validation.invalid_claims))
    }

    /// Public signing keys as served by the core
    ///
    /// # Errors
    ///
    /// Propagates core failures.
    pub async fn get_jwks(&self) -> Result<Value> {
        self.inner.querier.send_get(JWKS_PATH, &[]).await
    }

    /// OpenID discovery document for tokens issued through this API
    pub fn get_open_id_discovery_configuration(&self) -> OpenIdDiscovery {
        let issuer = self.inner.config.issuer();
        OpenIdDiscovery {
            jwks_uri: format!("{issuer}/jwt/jwks.json"),
            issuer,
        }
    }

    /// Turn a session error into a response
    ///
    /// Tokens are cleared for unauthorised errors that ask for it and for
    /// token theft; a stolen session is revoked before its handler runs.
    /// Pending changes are applied to the returned response.
    pub async fn handle_error(&self, err: SessionError, response: &PendingResponse) -> Response {
        let config = &self.inner.config;
        let handlers = &self.inner.error_handlers;

        if err.should_clear_tokens()
            && let Err(e) = clear_session_from_all_methods(config, response)
        {
            error!(error = %e, "Failed to clear session tokens");
        }

        let mut http_response = match &err {
            SessionError::Unauthorised { message, .. } => {
                debug!(%message, "Responding with unauthorised");
                (handlers.on_unauthorised)(message)
            }
            SessionError::TryRefreshToken { message } => {
                debug!(%message, "Responding with try refresh token");
                (handlers.on_try_refresh)(message)
            }
            SessionError::TokenTheftDetected {
                session_handle,
                user_id,
            } => {
                warn!(%session_handle, %user_id, "Token theft detected; revoking session");
                if let Err(e) = self.inner.recipe.revoke_session(session_handle).await {
                    error!(%session_handle, error = %e, "Failed to revoke stolen session");
                }
                (handlers.on_token_theft)(session_handle, user_id)
            }
            SessionError::InvalidClaims { claims } => {
                debug!(failed = claims.len(), "Responding with invalid claim");
                (handlers.on_invalid_claim)(claims)
            }
            SessionError::General(e) => {
                error!(error = %e, "Session operation failed");
                general_error_response()
            }
        };

        response.apply_to(http_response.headers_mut());
        http_response
    }
}
