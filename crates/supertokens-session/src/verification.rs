//! Access token verification state machine
//!
//! ```text
//! HasAccessToken ──parse/structure fail──────────────────────▶ TryRefresh
//!       │
//!       ├─ key mode (s-/d-) differs from config ─────────────▶ TryRefresh
//!       ▼
//! signature + expiry ──fail (legacy token, recent, unexpired)─▶ NeedsCoreVerification
//!       │            └─fail──────────────────────────────────▶ TryRefresh
//!       ▼
//! anti-CSRF (VIA_TOKEN) ──missing/mismatch────────────────────▶ TryRefresh
//!       ▼
//! LocallyVerified ──fast path allowed─────────────────────────▶ Verified
//!       └─────────────────────────────────────────────────────▶ NeedsCoreVerification
//!
//! NeedsCoreVerification ── OK ──▶ Verified
//!                       ── UNAUTHORISED ──▶ Unauthorised (clear tokens)
//!                       ── other ──▶ TryRefresh
//! ```

use std::fmt;

use serde_json::{Value, json};
use tracing::{debug, warn};

use crate::access_token::{AccessTokenInfo, validate_access_token_structure};
use crate::config::{AntiCsrfMode, NormalisedConfig};
use crate::error::{Result, SessionError};
use crate::jwt::{ParsedJwt, SigningKeyCache, is_dynamic_key_id, parse_without_verification};
use crate::querier::CoreQuerier;
use crate::recipe::{GetSessionInput, TokenInfo, VerifiedSession};
use crate::utils::now_ms;

pub(crate) const KEY_MODE_MISMATCH: &str =
    "The access token doesn't match the useDynamicAccessTokenSigningKey setting";
pub(crate) const ANTI_CSRF_UNDEFINED: &str = "Provided antiCsrfToken is undefined. If you do not want anti-csrf check for this API, please set doAntiCsrfCheck to false for this API";
pub(crate) const ANTI_CSRF_FAILED: &str = "anti-csrf check failed";
pub(crate) const CUSTOM_HEADER_CHECK_UNSUPPORTED: &str = "Since the anti-csrf mode is VIA_CUSTOM_HEADER getSession can't check the CSRF token. Please either use VIA_TOKEN or set antiCsrfCheck to false";

const VERIFY_PATH: &str = "/recipe/session/verify";

/// States a request's session goes through
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerificationState {
    /// No usable token on the request
    NoToken,
    /// A token was found and is being checked
    HasAccessToken,
    /// Signature, structure and expiry checked without the core
    LocallyVerified,
    /// The core must confirm the session
    NeedsCoreVerification,
    /// Session established
    Verified,
    /// Client should call the refresh endpoint
    TryRefresh,
    /// Client must log in again
    Unauthorised,
    /// Refresh token reuse detected
    TokenTheftDetected,
}

impl fmt::Display for VerificationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

pub(crate) struct Verifier<'a> {
    pub(crate) querier: &'a CoreQuerier,
    pub(crate) keys: &'a SigningKeyCache,
    pub(crate) config: &'a NormalisedConfig,
}

impl Verifier<'_> {
    pub(crate) async fn get_session(
        &self,
        access_token: &str,
        anti_csrf_token: Option<&str>,
        input: GetSessionInput,
    ) -> Result<VerifiedSession> {
        debug!(state = %VerificationState::HasAccessToken, "Verifying access token");

        let jwt = parse_without_verification(access_token).map_err(|e| {
            debug!(state = %VerificationState::TryRefresh, error = %e, "Access token could not be parsed");
            SessionError::try_refresh(e.to_string())
        })?;
        validate_access_token_structure(&jwt.payload, jwt.version)?;

        if !jwt.is_legacy() {
            let uses_dynamic_key = is_dynamic_key_id(jwt.kid.as_deref());
            if uses_dynamic_key != self.config.use_dynamic_access_token_signing_key {
                warn!(kid = ?jwt.kid, "Access token signing key mode does not match configuration");
                return Err(SessionError::try_refresh(KEY_MODE_MISMATCH));
            }
        }

        if input.anti_csrf_check && self.config.anti_csrf == AntiCsrfMode::ViaCustomHeader {
            return Err(SessionError::config(CUSTOM_HEADER_CHECK_UNSUPPORTED));
        }

        let via_token = self.config.anti_csrf == AntiCsrfMode::ViaToken;
        let info = match self
            .verify_locally(&jwt, via_token && input.anti_csrf_check)
            .await
        {
            Ok(info) => Some(info),
            Err(err) if err.is_try_refresh() && jwt.is_legacy() => {
                let extracted = AccessTokenInfo::extract(&jwt)?;
                let now = now_ms();
                let window = self.config.jwks_refresh_interval.as_millis() as u64;
                if extracted.expiry_time < now || extracted.time_created <= now.saturating_sub(window)
                {
                    debug!(
                        state = %VerificationState::TryRefresh,
                        error = %err,
                        "Legacy access token rejected"
                    );
                    return Err(err);
                }
                debug!(
                    session_handle = %extracted.session_handle,
                    "Legacy access token may predate a key update, asking the core"
                );
                None
            }
            Err(err) => {
                debug!(state = %VerificationState::TryRefresh, error = %err, "Local verification failed");
                return Err(err);
            }
        };

        if input.anti_csrf_check
            && via_token
            && let Some(info) = &info
        {
            match anti_csrf_token {
                None => {
                    warn!(session_handle = %info.session_handle, "Anti-CSRF token missing from request");
                    return Err(SessionError::try_refresh(ANTI_CSRF_UNDEFINED));
                }
                Some(provided) if info.anti_csrf_token.as_deref() != Some(provided) => {
                    warn!(session_handle = %info.session_handle, "Anti-CSRF token mismatch");
                    return Err(SessionError::try_refresh(ANTI_CSRF_FAILED));
                }
                Some(_) => {}
            }
        }

        if let Some(info) = info {
            debug!(state = %VerificationState::LocallyVerified, session_handle = %info.session_handle);
            if self.config.local_verification
                && !input.check_database
                && !self.config.access_token_blacklisting
                && info.parent_refresh_token_hash1.is_none()
            {
                debug!(
                    state = %VerificationState::Verified,
                    session_handle = %info.session_handle,
                    "Session verified locally"
                );
                return Ok(VerifiedSession {
                    session_handle: info.session_handle,
                    user_id: info.user_id,
                    recipe_user_id: info.recipe_user_id,
                    tenant_id: info.tenant_id,
                    access_token_payload: info.payload,
                    access_token: access_token.to_string(),
                    new_access_token: None,
                    expiry_time: info.expiry_time,
                    time_created: info.time_created,
                });
            }
        }

        self.verify_with_core(&jwt, access_token, anti_csrf_token, input)
            .await
    }

    async fn verify_locally(&self, jwt: &ParsedJwt, do_anti_csrf_check: bool) -> Result<AccessTokenInfo> {
        let signature_ok = match &jwt.kid {
            Some(kid) => match self.keys.get_key(kid).await? {
                Some(key) => jwt.verify_signature(&key).is_ok(),
                None => {
                    debug!(kid = %kid, "No signing key found for access token");
                    false
                }
            },
            None => self
                .keys
                .get_all_keys()
                .await?
                .iter()
                .any(|key| jwt.verify_signature(key).is_ok()),
        };
        if !signature_ok {
            return Err(SessionError::try_refresh("invalid access token signature"));
        }

        AccessTokenInfo::from_verified(jwt, do_anti_csrf_check)
    }

    async fn verify_with_core(
        &self,
        jwt: &ParsedJwt,
        access_token: &str,
        anti_csrf_token: Option<&str>,
        input: GetSessionInput,
    ) -> Result<VerifiedSession> {
        debug!(state = %VerificationState::NeedsCoreVerification, "Verifying session with core");

        let mut body = json!({
            "accessToken": access_token,
            "doAntiCsrfCheck": input.anti_csrf_check,
            "enableAntiCsrf": self.config.anti_csrf == AntiCsrfMode::ViaToken,
            "checkDatabase": input.check_database,
        });
        if let Some(token) = anti_csrf_token {
            body["antiCsrfToken"] = json!(token);
        }

        let response = self.querier.send_post(VERIFY_PATH, &body).await?;
        match status(&response) {
            "OK" => {
                let verified = verified_from_core(&response, jwt, access_token)?;
                debug!(
                    state = %VerificationState::Verified,
                    session_handle = %verified.session_handle,
                    new_token = verified.new_access_token.is_some(),
                    "Session verified by core"
                );
                Ok(verified)
            }
            "UNAUTHORISED" => {
                debug!(state = %VerificationState::Unauthorised, "Core rejected the session");
                Err(SessionError::unauthorised(
                    message(&response, "Session does not exist or has been revoked"),
                    true,
                ))
            }
            _ => {
                debug!(state = %VerificationState::TryRefresh, "Core asked for a refresh");
                Err(SessionError::try_refresh(message(
                    &response,
                    "Access token needs to be refreshed",
                )))
            }
        }
    }
}

pub(crate) fn status(response: &Value) -> &str {
    response
        .get("status")
        .and_then(Value::as_str)
        .unwrap_or_default()
}

pub(crate) fn message(response: &Value, fallback: &str) -> String {
    response
        .get("message")
        .and_then(Value::as_str)
        .unwrap_or(fallback)
        .to_string()
}

pub(crate) fn token_info(response: &Value, field: &str) -> Option<TokenInfo> {
    response
        .get(field)
        .filter(|token| !token.is_null())
        .and_then(|token| serde_json::from_value(token.clone()).ok())
}

fn verified_from_core(response: &Value, jwt: &ParsedJwt, access_token: &str) -> Result<VerifiedSession> {
    let new_access_token = token_info(response, "accessToken");
    let (info, raw) = match &new_access_token {
        Some(token) => {
            let parsed = parse_without_verification(&token.token)
                .map_err(|e| SessionError::invariant(format!("core issued an unparsable token: {e}")))?;
            (AccessTokenInfo::extract(&parsed)?, token.token.clone())
        }
        None => (AccessTokenInfo::extract(jwt)?, access_token.to_string()),
    };

    let session = response.get("session");
    let session_field = |key: &str| {
        session
            .and_then(|session| session.get(key))
            .and_then(Value::as_str)
            .map(str::to_string)
    };

    Ok(VerifiedSession {
        session_handle: session_field("handle").unwrap_or(info.session_handle),
        user_id: session_field("userId").unwrap_or(info.user_id),
        recipe_user_id: session_field("recipeUserId").unwrap_or(info.recipe_user_id),
        tenant_id: session_field("tenantId").unwrap_or(info.tenant_id),
        access_token_payload: info.payload,
        access_token: raw,
        expiry_time: new_access_token
            .as_ref()
            .map_or(info.expiry_time, |token| token.expiry),
        time_created: info.time_created,
        new_access_token,
    })
}
