//! Per-request session handle
//!
//! A [`SessionContainer`] is what `get_session`, `create_new_session` and
//! `refresh_session` hand back. It is cheap to clone; clones share state, so a
//! payload update made through one is visible through all of them and reaches
//! the response the container is attached to.

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::{Map, Value};
use tracing::debug;

use crate::claims::{SessionClaim, SessionClaimValidator};
use crate::config::NormalisedConfig;
use crate::error::{Result, SessionError};
use crate::payload::AccessTokenPayload;
use crate::recipe::{
    CreatedSession, SessionInformation, SessionRecipe, TokenInfo, VerifiedSession,
};
use crate::transfer::{
    ANTI_CSRF_HEADER, FrontToken, PendingResponse, TokenType, TransferMethod,
    attach_access_token, clear_session_from_all_methods, expiry_from_millis, set_token,
};

const SESSION_GONE: &str = "Session does not exist anymore";

/// Every token of the session, as the frontend would see them
#[derive(Debug, Clone, PartialEq)]
pub struct SessionTokens {
    /// Current access token
    pub access_token: String,
    /// Refresh token, only known right after creation or refresh
    pub refresh_token: Option<String>,
    /// Anti-CSRF token, only known right after creation or refresh
    pub anti_csrf_token: Option<String>,
    /// Encoded `front-token`
    pub front_token: String,
    /// Whether the access token changed while handling this request
    pub access_and_front_token_updated: bool,
}

#[derive(Debug)]
struct SessionState {
    session_handle: String,
    user_id: String,
    recipe_user_id: String,
    tenant_id: String,
    access_token: TokenInfo,
    refresh_token: Option<TokenInfo>,
    anti_csrf_token: Option<String>,
    payload: AccessTokenPayload,
    access_token_updated: bool,
}

/// A verified or newly created session bound to one request/response pair
#[derive(Clone)]
pub struct SessionContainer {
    recipe: Arc<dyn SessionRecipe>,
    config: Arc<NormalisedConfig>,
    response: PendingResponse,
    transfer_method: TransferMethod,
    state: Arc<Mutex<SessionState>>,
}

impl fmt::Debug for SessionContainer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("SessionContainer")
            .field("session_handle", &state.session_handle)
            .field("user_id", &state.user_id)
            .field("tenant_id", &state.tenant_id)
            .field("transfer_method", &self.transfer_method)
            .finish_non_exhaustive()
    }
}

impl SessionContainer {
    pub(crate) fn from_created(
        recipe: Arc<dyn SessionRecipe>,
        config: Arc<NormalisedConfig>,
        response: PendingResponse,
        transfer_method: TransferMethod,
        created: CreatedSession,
    ) -> Self {
        let state = SessionState {
            session_handle: created.session_handle,
            user_id: created.user_id,
            recipe_user_id: created.recipe_user_id,
            tenant_id: created.tenant_id,
            access_token: created.access_token,
            refresh_token: Some(created.refresh_token),
            anti_csrf_token: created.anti_csrf_token,
            payload: created.access_token_payload,
            access_token_updated: true,
        };
        Self {
            recipe,
            config,
            response,
            transfer_method,
            state: Arc::new(Mutex::new(state)),
        }
    }

    pub(crate) fn from_verified(
        recipe: Arc<dyn SessionRecipe>,
        config: Arc<NormalisedConfig>,
        response: PendingResponse,
        transfer_method: TransferMethod,
        verified: VerifiedSession,
    ) -> Self {
        let access_token_updated = verified.new_access_token.is_some();
        let access_token = verified.new_access_token.unwrap_or(TokenInfo {
            token: verified.access_token,
            expiry: verified.expiry_time,
            created_time: verified.time_created,
        });
        let state = SessionState {
            session_handle: verified.session_handle,
            user_id: verified.user_id,
            recipe_user_id: verified.recipe_user_id,
            tenant_id: verified.tenant_id,
            access_token,
            refresh_token: None,
            anti_csrf_token: None,
            payload: verified.access_token_payload,
            access_token_updated,
        };
        Self {
            recipe,
            config,
            response,
            transfer_method,
            state: Arc::new(Mutex::new(state)),
        }
    }

    /// Session handle
    pub fn get_handle(&self) -> String {
        self.state.lock().session_handle.clone()
    }

    /// Session owner
    pub fn get_user_id(&self) -> String {
        self.state.lock().user_id.clone()
    }

    /// Recipe user id
    pub fn get_recipe_user_id(&self) -> String {
        self.state.lock().recipe_user_id.clone()
    }

    /// Tenant of the session
    pub fn get_tenant_id(&self) -> String {
        self.state.lock().tenant_id.clone()
    }

    /// Current access token payload
    pub fn get_access_token_payload(&self) -> AccessTokenPayload {
        self.state.lock().payload.clone()
    }

    /// Current raw access token
    pub fn get_access_token(&self) -> String {
        self.state.lock().access_token.token.clone()
    }

    /// Method the session's tokens travel with
    pub fn transfer_method(&self) -> TransferMethod {
        self.transfer_method
    }

    /// Every token of the session, including the refresh token when known
    ///
    /// # Errors
    ///
    /// Fails only if the payload cannot be serialized into the front token.
    pub fn get_all_session_tokens_dangerously(&self) -> Result<SessionTokens> {
        let state = self.state.lock();
        let front_token = FrontToken {
            uid: state.user_id.clone(),
            ate: state.access_token.expiry,
            up: state.payload.clone(),
        }
        .encode()?;
        Ok(SessionTokens {
            access_token: state.access_token.token.clone(),
            refresh_token: state.refresh_token.as_ref().map(|token| token.token.clone()),
            anti_csrf_token: state.anti_csrf_token.clone(),
            front_token,
            access_and_front_token_updated: state.access_token_updated,
        })
    }

    /// Session creation time (ms epoch), read from the core
    ///
    /// # Errors
    ///
    /// [`SessionError::Unauthorised`] when the session no longer exists.
    pub async fn get_time_created(&self) -> Result<u64> {
        Ok(self.session_information().await?.time_created)
    }

    /// Refresh token expiry (ms epoch), read from the core
    ///
    /// # Errors
    ///
    /// [`SessionError::Unauthorised`] when the session no longer exists.
    pub async fn get_expiry(&self) -> Result<u64> {
        Ok(self.session_information().await?.expiry)
    }

    async fn session_information(&self) -> Result<SessionInformation> {
        self.recipe
            .get_session_information(&self.get_handle())
            .await?
            .ok_or_else(|| SessionError::unauthorised(SESSION_GONE, true))
    }

    /// Revoke the session in the core and clear its tokens from the response
    ///
    /// # Errors
    ///
    /// Propagates core failures.
    pub async fn revoke_session(&self) -> Result<()> {
        let handle = self.get_handle();
        self.recipe.revoke_session(&handle).await?;
        clear_session_from_all_methods(&self.config, &self.response)?;
        debug!(session_handle = %handle, "Session revoked");
        Ok(())
    }

    /// Data stored for the session in the core only
    ///
    /// # Errors
    ///
    /// [`SessionError::Unauthorised`] when the session no longer exists.
    pub async fn get_session_data_in_database(&self) -> Result<Value> {
        Ok(self.session_information().await?.session_data_in_database)
    }

    /// Replace the core-only session data
    ///
    /// # Errors
    ///
    /// [`SessionError::Unauthorised`] when the session no longer exists.
    pub async fn update_session_data_in_database(&self, data: Value) -> Result<()> {
        if self
            .recipe
            .update_session_data_in_database(&self.get_handle(), data)
            .await?
        {
            Ok(())
        } else {
            Err(SessionError::unauthorised(SESSION_GONE, true))
        }
    }

    /// Merge into the access token payload and issue a new access token
    ///
    /// `null` values delete keys. The new token and `front-token` are written to
    /// the response.
    ///
    /// # Errors
    ///
    /// Reserved keys are rejected; [`SessionError::Unauthorised`] when the
    /// session no longer exists.
    pub async fn merge_into_access_token_payload(&self, update: &Map<String, Value>) -> Result<()> {
        let (access_token, mut payload) = {
            let state = self.state.lock();
            (
                state.access_token.token.clone(),
                AccessTokenPayload::from_token(state.payload.user_payload()),
            )
        };
        payload.merge(update)?;

        let regenerated = self
            .recipe
            .regenerate_access_token(&access_token, Some(&payload))
            .await?
            .ok_or_else(|| SessionError::unauthorised(SESSION_GONE, true))?;

        let mut state = self.state.lock();
        state.payload = regenerated.access_token_payload;
        if let Some(token) = regenerated.access_token {
            state.access_token = token;
            state.access_token_updated = true;
            attach_access_token(
                &self.config,
                &self.response,
                &state.user_id,
                &state.access_token,
                &state.payload,
                self.transfer_method,
            )?;
        }
        Ok(())
    }

    /// Refetch stale claims, persist any refetched values and fail on invalid claims
    ///
    /// # Errors
    ///
    /// [`SessionError::InvalidClaims`] listing every failed validator.
    pub async fn assert_claims(&self, validators: &[SessionClaimValidator]) -> Result<()> {
        let (user_id, tenant_id, payload) = {
            let state = self.state.lock();
            (state.user_id.clone(), state.tenant_id.clone(), state.payload.clone())
        };

        let validation = self
            .recipe
            .validate_claims(&user_id, &tenant_id, &payload, validators)
            .await?;

        if let Some(update) = validation.access_token_payload_update {
            self.merge_into_access_token_payload(&update.user_payload())
                .await?;
        }

        if validation.invalid_claims.is_empty() {
            Ok(())
        } else {
            debug!(
                invalid = validation.invalid_claims.len(),
                "Session failed claim validation"
            );
            Err(SessionError::InvalidClaims {
                claims: validation.invalid_claims,
            })
        }
    }

    /// Fetch a claim and store it in the payload
    ///
    /// # Errors
    ///
    /// Propagates fetch and core failures.
    pub async fn fetch_and_set_claim(&self, claim: &dyn SessionClaim) -> Result<()> {
        let (user_id, tenant_id) = {
            let state = self.state.lock();
            (state.user_id.clone(), state.tenant_id.clone())
        };
        let mut update = AccessTokenPayload::new();
        claim.build(&user_id, &tenant_id, &mut update).await?;
        self.merge_into_access_token_payload(update.as_map()).await
    }

    /// Store an explicit claim value
    ///
    /// # Errors
    ///
    /// Propagates core failures.
    pub async fn set_claim_value(&self, claim: &dyn SessionClaim, value: Value) -> Result<()> {
        let mut update = AccessTokenPayload::new();
        claim.add_to_payload(&mut update, value)?;
        self.merge_into_access_token_payload(update.as_map()).await
    }

    /// Read a claim from the current payload
    pub fn get_claim_value(&self, claim: &dyn SessionClaim) -> Option<Value> {
        claim.get_value_from_payload(&self.state.lock().payload)
    }

    /// Remove a claim from the payload
    ///
    /// # Errors
    ///
    /// Propagates core failures.
    pub async fn remove_claim(&self, claim: &dyn SessionClaim) -> Result<()> {
        let mut update = AccessTokenPayload::new();
        claim.remove_from_payload_by_merge(&mut update)?;
        self.merge_into_access_token_payload(update.as_map()).await
    }

    /// Write the session's current tokens to the attached response
    ///
    /// The refresh and anti-CSRF tokens are only written when known, that is
    /// right after creation or refresh.
    ///
    /// # Errors
    ///
    /// Fails when a token cannot be encoded.
    pub fn attach_to_response(&self) -> Result<()> {
        let state = self.state.lock();
        attach_access_token(
            &self.config,
            &self.response,
            &state.user_id,
            &state.access_token,
            &state.payload,
            self.transfer_method,
        )?;
        if let Some(refresh) = &state.refresh_token {
            set_token(
                &self.config,
                &self.response,
                TokenType::Refresh,
                &refresh.token,
                expiry_from_millis(refresh.expiry)?,
                self.transfer_method,
            )?;
        }
        if let Some(anti_csrf) = &state.anti_csrf_token {
            self.response.set_header(ANTI_CSRF_HEADER, anti_csrf, true)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::claims::PrimitiveClaim;
    use crate::config::SessionConfig;
    use crate::recipe::RegeneratedToken;
    use crate::transfer::{ACCESS_TOKEN_HEADER, FRONT_TOKEN_HEADER};
    use async_trait::async_trait;
    use serde_json::json;

    #[derive(Default)]
    struct FakeCore {
        regenerated: Mutex<Vec<Map<String, Value>>>,
        revoked: Mutex<Vec<String>>,
        gone: bool,
    }

    #[async_trait]
    impl SessionRecipe for FakeCore {
        async fn regenerate_access_token(
            &self,
            _access_token: &str,
            new_payload: Option<&AccessTokenPayload>,
        ) -> Result<Option<RegeneratedToken>> {
            if self.gone {
                return Ok(None);
            }
            let payload = new_payload.cloned().unwrap_or_default();
            self.regenerated.lock().push(payload.as_map().clone());
            Ok(Some(RegeneratedToken {
                session_handle: "handle".into(),
                user_id: "user".into(),
                access_token_payload: payload,
                access_token: Some(TokenInfo {
                    token: "regenerated".into(),
                    expiry: 99,
                    created_time: 1,
                }),
            }))
        }

        async fn validate_claims(
            &self,
            user_id: &str,
            tenant_id: &str,
            payload: &AccessTokenPayload,
            validators: &[SessionClaimValidator],
        ) -> Result<crate::claims::ClaimsValidation> {
            crate::claims::validate_claims(user_id, tenant_id, payload, validators).await
        }

        async fn revoke_session(&self, session_handle: &str) -> Result<bool> {
            self.revoked.lock().push(session_handle.to_string());
            Ok(true)
        }
    }

    fn container(core: Arc<FakeCore>) -> (SessionContainer, PendingResponse) {
        let config = SessionConfig::new(
            "http://localhost:3567",
            "http://localhost:3001",
            "http://localhost:3000",
        )
        .normalise()
        .unwrap();
        let mut payload = AccessTokenPayload::new();
        payload.insert("theme", json!("dark")).unwrap();
        let response = PendingResponse::new();
        let container = SessionContainer::from_verified(
            core,
            Arc::new(config),
            response.clone(),
            TransferMethod::Header,
            VerifiedSession {
                session_handle: "handle".into(),
                user_id: "user".into(),
                recipe_user_id: "user".into(),
                tenant_id: "public".into(),
                access_token_payload: payload,
                access_token: "original".into(),
                new_access_token: None,
                expiry_time: 10,
                time_created: 1,
            },
        );
        (container, response)
    }

    #[tokio::test]
    async fn test_merge_regenerates_and_attaches() {
        let core = Arc::new(FakeCore::default());
        let (session, response) = container(Arc::clone(&core));

        let update = json!({"lang": "en", "theme": null});
        session
            .merge_into_access_token_payload(update.as_object().unwrap())
            .await
            .unwrap();

        assert_eq!(core.regenerated.lock()[0], *json!({"lang": "en"}).as_object().unwrap());
        assert_eq!(session.get_access_token(), "regenerated");
        assert_eq!(session.get_access_token_payload().get("theme"), None);
        assert_eq!(response.header(ACCESS_TOKEN_HEADER).as_deref(), Some("regenerated"));
        let front = FrontToken::decode(&response.header(FRONT_TOKEN_HEADER).unwrap()).unwrap();
        assert_eq!(front.ate, 99);
        assert!(session.get_all_session_tokens_dangerously().unwrap().access_and_front_token_updated);
    }

    #[tokio::test]
    async fn test_merge_on_missing_session_is_unauthorised() {
        let core = Arc::new(FakeCore {
            gone: true,
            ..FakeCore::default()
        });
        let (session, _) = container(core);
        let err = session
            .merge_into_access_token_payload(&Map::new())
            .await
            .unwrap_err();
        assert!(err.is_unauthorised());
    }

    #[tokio::test]
    async fn test_protected_key_rejected_before_core_call() {
        let core = Arc::new(FakeCore::default());
        let (session, _) = container(Arc::clone(&core));
        let err = session
            .merge_into_access_token_payload(json!({"sub": "other"}).as_object().unwrap())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "GENERAL_ERROR");
        assert!(core.regenerated.lock().is_empty());
    }

    #[tokio::test]
    async fn test_claim_helpers() {
        let core = Arc::new(FakeCore::default());
        let (session, _) = container(core);
        let claim = PrimitiveClaim::new("st-role", |_user, _tenant| async { Ok(Some(json!("admin"))) });

        session.fetch_and_set_claim(&claim).await.unwrap();
        assert_eq!(session.get_claim_value(&claim), Some(json!("admin")));
        session.assert_claims(&[claim.has_value(json!("admin"), None)]).await.unwrap();

        let err = session
            .assert_claims(&[claim.has_value(json!("superuser"), None).with_id("role")])
            .await
            .unwrap_err();
        match err {
            SessionError::InvalidClaims { claims } => {
                assert_eq!(claims.len(), 1);
                assert_eq!(claims[0].id, "role");
            }
            other => panic!("unexpected error {other:?}"),
        }

        session.remove_claim(&claim).await.unwrap();
        assert_eq!(session.get_claim_value(&claim), None);
        session.assert_claims(&[claim.has_value(json!("admin"), None)]).await.unwrap();
        assert_eq!(session.get_claim_value(&claim), Some(json!("admin")));
    }

    #[tokio::test]
    async fn test_revoke_clears_response() {
        let core = Arc::new(FakeCore::default());
        let (session, response) = container(Arc::clone(&core));
        session.revoke_session().await.unwrap();
        assert_eq!(*core.revoked.lock(), ["handle"]);
        assert_eq!(response.header(FRONT_TOKEN_HEADER).as_deref(), Some("remove"));
        assert_eq!(response.header(ACCESS_TOKEN_HEADER).as_deref(), Some(""));
    }
}
