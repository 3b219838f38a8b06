//! Session recipe interface and override chain
//!
//! [`SessionRecipe`] is the token-level API (no HTTP request involved). The
//! default implementation, [`CoreSessionRecipe`], talks to the core. Apps wrap
//! it with overrides: each override receives the current recipe and returns a
//! new one, usually a struct holding the previous recipe and returning it from
//! [`SessionRecipe::next`]. Methods a layer does not implement fall through to
//! the wrapped recipe.

mod core_recipe;

pub use core_recipe::CoreSessionRecipe;

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::claims::{ClaimsValidation, SessionClaim, SessionClaimValidator};
use crate::error::{Result, SessionError};
use crate::payload::AccessTokenPayload;

/// A token issued by the core
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenInfo {
    /// Raw token string
    pub token: String,
    /// Expiry (ms epoch)
    pub expiry: u64,
    /// Issue time (ms epoch)
    pub created_time: u64,
}

/// Tokens and session fields returned by session creation and refresh
#[derive(Debug, Clone)]
pub struct CreatedSession {
    /// Session handle
    pub session_handle: String,
    /// Session owner
    pub user_id: String,
    /// Recipe user id
    pub recipe_user_id: String,
    /// Tenant of the session
    pub tenant_id: String,
    /// Payload of the new access token
    pub access_token_payload: AccessTokenPayload,
    /// New access token
    pub access_token: TokenInfo,
    /// New refresh token
    pub refresh_token: TokenInfo,
    /// Anti-CSRF token, when the core minted one
    pub anti_csrf_token: Option<String>,
}

/// Outcome of access token verification
#[derive(Debug, Clone)]
pub struct VerifiedSession {
    /// Session handle
    pub session_handle: String,
    /// Session owner
    pub user_id: String,
    /// Recipe user id
    pub recipe_user_id: String,
    /// Tenant of the session
    pub tenant_id: String,
    /// Payload of the (possibly new) access token
    pub access_token_payload: AccessTokenPayload,
    /// Access token to use from here on
    pub access_token: String,
    /// Set when the core issued a replacement token that must reach the client
    pub new_access_token: Option<TokenInfo>,
    /// Access token expiry (ms epoch)
    pub expiry_time: u64,
    /// Access token issue time (ms epoch)
    pub time_created: u64,
}

/// Stored session state, as read from the core
#[derive(Debug, Clone)]
pub struct SessionInformation {
    /// Session handle
    pub session_handle: String,
    /// Session owner
    pub user_id: String,
    /// Recipe user id
    pub recipe_user_id: String,
    /// Tenant of the session
    pub tenant_id: String,
    /// Data stored only in the core
    pub session_data_in_database: Value,
    /// Refresh token expiry (ms epoch)
    pub expiry: u64,
    /// User-facing access token payload (reserved keys removed)
    pub custom_claims_in_access_token_payload: AccessTokenPayload,
    /// Creation time (ms epoch)
    pub time_created: u64,
}

/// Result of regenerating an access token with a new payload
#[derive(Debug, Clone)]
pub struct RegeneratedToken {
    /// Session handle
    pub session_handle: String,
    /// Session owner
    pub user_id: String,
    /// Payload now stored for the session
    pub access_token_payload: AccessTokenPayload,
    /// New access token, absent when the core kept the old one
    pub access_token: Option<TokenInfo>,
}

/// Input of [`SessionRecipe::create_new_session`]
#[derive(Debug, Clone)]
pub struct CreateSessionInput {
    /// Session owner
    pub user_id: String,
    /// Tenant of the session
    pub tenant_id: String,
    /// Access token payload (user data plus built claims)
    pub access_token_payload: AccessTokenPayload,
    /// Data stored only in the core
    pub session_data_in_database: Value,
    /// Skip minting an anti-CSRF token (header transport)
    pub disable_anti_csrf: bool,
}

/// Verification flags of [`SessionRecipe::get_session`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GetSessionInput {
    /// Perform the anti-CSRF check
    pub anti_csrf_check: bool,
    /// Always confirm the session with the core
    pub check_database: bool,
}

/// Builds an outer recipe around the current one
pub type RecipeOverride = Arc<dyn Fn(Arc<dyn SessionRecipe>) -> Arc<dyn SessionRecipe> + Send + Sync>;

/// Token-level session operations
///
/// Every method has a default body that forwards to [`next`](Self::next);
/// the root recipe implements all of them.
#[async_trait]
pub trait SessionRecipe: Send + Sync {
    /// The recipe this one wraps
    fn next(&self) -> Option<&dyn SessionRecipe> {
        None
    }

    /// [`next`](Self::next), or an invariant error on the root of the chain
    fn delegate(&self) -> Result<&dyn SessionRecipe> {
        self.next()
            .ok_or_else(|| SessionError::invariant("session recipe has no inner recipe to delegate to"))
    }

    /// Create a session in the core
    async fn create_new_session(&self, input: CreateSessionInput) -> Result<CreatedSession> {
        self.delegate()?.create_new_session(input).await
    }

    /// Verify an access token
    async fn get_session(
        &self,
        access_token: &str,
        anti_csrf_token: Option<&str>,
        input: GetSessionInput,
    ) -> Result<VerifiedSession> {
        self.delegate()?
            .get_session(access_token, anti_csrf_token, input)
            .await
    }

    /// Rotate a refresh token
    async fn refresh_session(
        &self,
        refresh_token: &str,
        anti_csrf_token: Option<&str>,
        disable_anti_csrf: bool,
    ) -> Result<CreatedSession> {
        self.delegate()?
            .refresh_session(refresh_token, anti_csrf_token, disable_anti_csrf)
            .await
    }

    /// Revoke one session; `false` when it did not exist
    async fn revoke_session(&self, session_handle: &str) -> Result<bool> {
        self.delegate()?.revoke_session(session_handle).await
    }

    /// Revoke every session of a user, returning the revoked handles
    async fn revoke_all_sessions_for_user(&self, user_id: &str) -> Result<Vec<String>> {
        self.delegate()?.revoke_all_sessions_for_user(user_id).await
    }

    /// Handles of every live session of a user
    async fn get_all_session_handles_for_user(&self, user_id: &str) -> Result<Vec<String>> {
        self.delegate()?.get_all_session_handles_for_user(user_id).await
    }

    /// Stored state of a session; `None` when it does not exist
    async fn get_session_information(
        &self,
        session_handle: &str,
    ) -> Result<Option<SessionInformation>> {
        self.delegate()?.get_session_information(session_handle).await
    }

    /// Replace the database-only session data
    async fn update_session_data_in_database(
        &self,
        session_handle: &str,
        data: Value,
    ) -> Result<bool> {
        self.delegate()?
            .update_session_data_in_database(session_handle, data)
            .await
    }

    /// Merge into the stored access token payload; `null` values delete keys
    async fn merge_into_access_token_payload(
        &self,
        session_handle: &str,
        update: &Map<String, Value>,
    ) -> Result<bool> {
        self.delegate()?
            .merge_into_access_token_payload(session_handle, update)
            .await
    }

    /// Issue a new access token for the same session, optionally with a new payload
    async fn regenerate_access_token(
        &self,
        access_token: &str,
        new_payload: Option<&AccessTokenPayload>,
    ) -> Result<Option<RegeneratedToken>> {
        self.delegate()?
            .regenerate_access_token(access_token, new_payload)
            .await
    }

    /// Refetch stale claims and run validators
    async fn validate_claims(
        &self,
        user_id: &str,
        tenant_id: &str,
        payload: &AccessTokenPayload,
        validators: &[SessionClaimValidator],
    ) -> Result<ClaimsValidation> {
        self.delegate()?
            .validate_claims(user_id, tenant_id, payload, validators)
            .await
    }

    /// Fetch a claim and store it in the session's payload
    async fn fetch_and_set_claim(
        &self,
        session_handle: &str,
        claim: &dyn SessionClaim,
    ) -> Result<bool> {
        self.delegate()?
            .fetch_and_set_claim(session_handle, claim)
            .await
    }

    /// Store an explicit claim value in the session's payload
    async fn set_claim_value(
        &self,
        session_handle: &str,
        claim: &dyn SessionClaim,
        value: Value,
    ) -> Result<bool> {
        self.delegate()?
            .set_claim_value(session_handle, claim, value)
            .await
    }

    /// Read a claim from the stored payload; `None` when the session or the claim is missing
    async fn get_claim_value(
        &self,
        session_handle: &str,
        claim: &dyn SessionClaim,
    ) -> Result<Option<Value>> {
        self.delegate()?.get_claim_value(session_handle, claim).await
    }

    /// Remove a claim from the stored payload
    async fn remove_claim(&self, session_handle: &str, claim: &dyn SessionClaim) -> Result<bool> {
        self.delegate()?.remove_claim(session_handle, claim).await
    }
}

/// Apply overrides to a root recipe; the last override becomes the outermost layer
pub fn build_recipe_chain(
    root: Arc<dyn SessionRecipe>,
    overrides: &[RecipeOverride],
) -> Arc<dyn SessionRecipe> {
    overrides
        .iter()
        .fold(root, |recipe, apply| apply(recipe))
}

/// Debug helper for trait objects
pub(crate) struct RecipeChain<'a>(pub(crate) &'a dyn SessionRecipe);

impl fmt::Debug for RecipeChain<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut depth = 1;
        let mut current = self.0;
        while let Some(next) = current.next() {
            depth += 1;
            current = next;
        }
        f.debug_struct("SessionRecipe").field("layers", &depth).finish()
    }
}
