use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map, Value, json};
use tracing::{debug, info, warn};

use super::{
    CreateSessionInput, CreatedSession, GetSessionInput, RegeneratedToken, SessionInformation,
    SessionRecipe, VerifiedSession,
};
use crate::access_token::{AccessTokenInfo, DEFAULT_TENANT_ID, json_number_as_u64};
use crate::claims::{self, ClaimsValidation, SessionClaim, SessionClaimValidator};
use crate::config::{AntiCsrfMode, NormalisedConfig};
use crate::error::{GeneralError, Result, SessionError};
use crate::jwt::{SigningKeyCache, parse_without_verification};
use crate::payload::AccessTokenPayload;
use crate::querier::CoreQuerier;
use crate::verification::{
    CUSTOM_HEADER_CHECK_UNSUPPORTED, Verifier, message, status, token_info,
};

const SESSION_PATH: &str = "/recipe/session";
const REFRESH_PATH: &str = "/recipe/session/refresh";
const REMOVE_PATH: &str = "/recipe/session/remove";
const USER_SESSIONS_PATH: &str = "/recipe/session/user";
const SESSION_DATA_PATH: &str = "/recipe/session/data";
const JWT_DATA_PATH: &str = "/recipe/jwt/data";
const REGENERATE_PATH: &str = "/recipe/session/regenerate";

/// Session recipe backed by the SuperTokens core
pub struct CoreSessionRecipe {
    querier: Arc<CoreQuerier>,
    keys: Arc<SigningKeyCache>,
    config: Arc<NormalisedConfig>,
}

impl fmt::Debug for CoreSessionRecipe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CoreSessionRecipe")
            .field("hosts", &self.querier.hosts())
            .field("anti_csrf", &self.config.anti_csrf)
            .finish_non_exhaustive()
    }
}

impl CoreSessionRecipe {
    /// Create the recipe over shared engine state
    pub fn new(
        querier: Arc<CoreQuerier>,
        keys: Arc<SigningKeyCache>,
        config: Arc<NormalisedConfig>,
    ) -> Self {
        Self {
            querier,
            keys,
            config,
        }
    }

    fn verifier(&self) -> Verifier<'_> {
        Verifier {
            querier: &self.querier,
            keys: &self.keys,
            config: &self.config,
        }
    }

    fn anti_csrf_enabled(&self, disable_anti_csrf: bool) -> bool {
        !disable_anti_csrf && self.config.anti_csrf == AntiCsrfMode::ViaToken
    }
}

fn tenant_path(tenant_id: &str, path: &str) -> String {
    if tenant_id.is_empty() || tenant_id == DEFAULT_TENANT_ID {
        path.to_string()
    } else {
        format!("/{tenant_id}{path}")
    }
}

fn unexpected(path: &str, response: &Value) -> SessionError {
    GeneralError::UnexpectedResponse {
        path: path.to_string(),
        message: format!("unknown status '{}'", status(response)),
    }
    .into()
}

fn missing_field(path: &str, field: &str) -> SessionError {
    GeneralError::UnexpectedResponse {
        path: path.to_string(),
        message: format!("missing field '{field}'"),
    }
    .into()
}

fn str_field(value: &Value, key: &str) -> Option<String> {
    value.get(key).and_then(Value::as_str).map(str::to_string)
}

fn object_field(value: &Value, keys: &[&str]) -> Map<String, Value> {
    keys.iter()
        .find_map(|key| value.get(*key).and_then(Value::as_object))
        .cloned()
        .unwrap_or_default()
}

/// Parse the `{session, accessToken, refreshToken, antiCsrfToken}` shape shared by create and refresh
fn created_session(path: &str, response: &Value) -> Result<CreatedSession> {
    let session = response
        .get("session")
        .ok_or_else(|| missing_field(path, "session"))?;
    let access_token =
        token_info(response, "accessToken").ok_or_else(|| missing_field(path, "accessToken"))?;
    let refresh_token =
        token_info(response, "refreshToken").ok_or_else(|| missing_field(path, "refreshToken"))?;

    let session_handle = str_field(session, "handle").ok_or_else(|| missing_field(path, "session.handle"))?;
    let user_id = str_field(session, "userId").ok_or_else(|| missing_field(path, "session.userId"))?;

    let access_token_payload = match parse_without_verification(&access_token.token)
        .ok()
        .and_then(|jwt| AccessTokenInfo::extract(&jwt).ok())
    {
        Some(info) => info.payload,
        None => AccessTokenPayload::from_token(object_field(
            session,
            &["userDataInJWT", "userDataInAccessToken"],
        )),
    };

    Ok(CreatedSession {
        recipe_user_id: str_field(session, "recipeUserId").unwrap_or_else(|| user_id.clone()),
        tenant_id: str_field(session, "tenantId").unwrap_or_else(|| DEFAULT_TENANT_ID.to_string()),
        session_handle,
        user_id,
        access_token_payload,
        access_token,
        refresh_token,
        anti_csrf_token: str_field(response, "antiCsrfToken"),
    })
}

#[async_trait]
impl SessionRecipe for CoreSessionRecipe {
    async fn create_new_session(&self, input: CreateSessionInput) -> Result<CreatedSession> {
        let path = tenant_path(&input.tenant_id, SESSION_PATH);
        let body = json!({
            "userId": input.user_id,
            "userDataInAccessToken": input.access_token_payload.into_value(),
            "userDataInDatabase": input.session_data_in_database,
            "useDynamicSigningKey": self.config.use_dynamic_access_token_signing_key,
            "enableAntiCsrf": self.anti_csrf_enabled(input.disable_anti_csrf),
        });

        let response = self.querier.send_post(&path, &body).await?;
        let created = created_session(&path, &response)?;
        info!(
            session_handle = %created.session_handle,
            user_id = %created.user_id,
            "Created new session"
        );
        Ok(created)
    }

    async fn get_session(
        &self,
        access_token: &str,
        anti_csrf_token: Option<&str>,
        input: GetSessionInput,
    ) -> Result<VerifiedSession> {
        self.verifier()
            .get_session(access_token, anti_csrf_token, input)
            .await
    }

    async fn refresh_session(
        &self,
        refresh_token: &str,
        anti_csrf_token: Option<&str>,
        disable_anti_csrf: bool,
    ) -> Result<CreatedSession> {
        if self.config.anti_csrf == AntiCsrfMode::ViaCustomHeader && !disable_anti_csrf {
            return Err(SessionError::unauthorised(CUSTOM_HEADER_CHECK_UNSUPPORTED, false));
        }

        let mut body = json!({
            "refreshToken": refresh_token,
            "enableAntiCsrf": self.anti_csrf_enabled(disable_anti_csrf),
            "useDynamicSigningKey": self.config.use_dynamic_access_token_signing_key,
        });
        if let Some(token) = anti_csrf_token {
            body["antiCsrfToken"] = json!(token);
        }

        let response = self.querier.send_post(REFRESH_PATH, &body).await?;
        match status(&response) {
            "OK" => {
                let created = created_session(REFRESH_PATH, &response)?;
                debug!(session_handle = %created.session_handle, "Refreshed session");
                Ok(created)
            }
            "UNAUTHORISED" => Err(SessionError::unauthorised(
                message(&response, "Refresh token is invalid or expired"),
                true,
            )),
            "TOKEN_THEFT_DETECTED" => {
                let session = response.get("session").cloned().unwrap_or(Value::Null);
                let session_handle = str_field(&session, "handle").unwrap_or_default();
                let user_id = str_field(&session, "userId").unwrap_or_default();
                warn!(
                    session_handle = %session_handle,
                    user_id = %user_id,
                    "Refresh token reuse detected"
                );
                Err(SessionError::TokenTheftDetected {
                    session_handle,
                    user_id,
                })
            }
            _ => Err(unexpected(REFRESH_PATH, &response)),
        }
    }

    async fn revoke_session(&self, session_handle: &str) -> Result<bool> {
        let response = self
            .querier
            .send_post(REMOVE_PATH, &json!({ "sessionHandles": [session_handle] }))
            .await?;
        let revoked = response
            .get("sessionHandlesRevoked")
            .and_then(Value::as_array)
            .is_some_and(|handles| handles.len() == 1);
        debug!(session_handle = %session_handle, revoked, "Revoke session");
        Ok(revoked)
    }

    async fn revoke_all_sessions_for_user(&self, user_id: &str) -> Result<Vec<String>> {
        let response = self
            .querier
            .send_post(REMOVE_PATH, &json!({ "userId": user_id }))
            .await?;
        let handles = string_list(&response, "sessionHandlesRevoked");
        debug!(user_id = %user_id, count = handles.len(), "Revoked all sessions for user");
        Ok(handles)
    }

    async fn get_all_session_handles_for_user(&self, user_id: &str) -> Result<Vec<String>> {
        let response = self
            .querier
            .send_get(USER_SESSIONS_PATH, &[("userId", user_id)])
            .await?;
        Ok(string_list(&response, "sessionHandles"))
    }

    async fn get_session_information(
        &self,
        session_handle: &str,
    ) -> Result<Option<SessionInformation>> {
        let response = self
            .querier
            .send_get(SESSION_PATH, &[("sessionHandle", session_handle)])
            .await?;
        match status(&response) {
            "OK" => {
                let user_id = str_field(&response, "userId")
                    .ok_or_else(|| missing_field(SESSION_PATH, "userId"))?;
                let claims = AccessTokenPayload::from_token(object_field(
                    &response,
                    &["userDataInJWT", "customClaimsInAccessTokenPayload"],
                ));
                Ok(Some(SessionInformation {
                    session_handle: str_field(&response, "sessionHandle")
                        .unwrap_or_else(|| session_handle.to_string()),
                    recipe_user_id: str_field(&response, "recipeUserId")
                        .unwrap_or_else(|| user_id.clone()),
                    user_id,
                    tenant_id: str_field(&response, "tenantId")
                        .unwrap_or_else(|| DEFAULT_TENANT_ID.to_string()),
                    session_data_in_database: response
                        .get("userDataInDatabase")
                        .or_else(|| response.get("sessionDataInDatabase"))
                        .cloned()
                        .unwrap_or(Value::Null),
                    expiry: response
                        .get("expiry")
                        .and_then(json_number_as_u64)
                        .unwrap_or_default(),
                    custom_claims_in_access_token_payload: AccessTokenPayload::from_token(
                        claims.user_payload(),
                    ),
                    time_created: response
                        .get("timeCreated")
                        .and_then(json_number_as_u64)
                        .unwrap_or_default(),
                }))
            }
            "UNAUTHORISED" => Ok(None),
            _ => Err(unexpected(SESSION_PATH, &response)),
        }
    }

    async fn update_session_data_in_database(
        &self,
        session_handle: &str,
        data: Value,
    ) -> Result<bool> {
        let response = self
            .querier
            .send_put(
                SESSION_DATA_PATH,
                &json!({ "sessionHandle": session_handle, "userDataInDatabase": data }),
            )
            .await?;
        match status(&response) {
            "OK" => Ok(true),
            "UNAUTHORISED" => Ok(false),
            _ => Err(unexpected(SESSION_DATA_PATH, &response)),
        }
    }

    async fn merge_into_access_token_payload(
        &self,
        session_handle: &str,
        update: &Map<String, Value>,
    ) -> Result<bool> {
        let Some(info) = self.get_session_information(session_handle).await? else {
            return Ok(false);
        };

        let mut payload = info.custom_claims_in_access_token_payload;
        payload.merge(update)?;

        let response = self
            .querier
            .send_put(
                JWT_DATA_PATH,
                &json!({ "sessionHandle": session_handle, "userDataInJWT": payload.into_value() }),
            )
            .await?;
        match status(&response) {
            "OK" => Ok(true),
            "UNAUTHORISED" => Ok(false),
            _ => Err(unexpected(JWT_DATA_PATH, &response)),
        }
    }

    async fn regenerate_access_token(
        &self,
        access_token: &str,
        new_payload: Option<&AccessTokenPayload>,
    ) -> Result<Option<RegeneratedToken>> {
        let mut body = json!({ "accessToken": access_token });
        if let Some(payload) = new_payload {
            body["userDataInJWT"] = Value::Object(payload.user_payload());
        }

        let response = self.querier.send_post(REGENERATE_PATH, &body).await?;
        match status(&response) {
            "OK" => {
                let session = response
                    .get("session")
                    .ok_or_else(|| missing_field(REGENERATE_PATH, "session"))?;
                let access_token = token_info(&response, "accessToken");
                let access_token_payload = match access_token
                    .as_ref()
                    .and_then(|token| parse_without_verification(&token.token).ok())
                    .and_then(|jwt| AccessTokenInfo::extract(&jwt).ok())
                {
                    Some(info) => info.payload,
                    None => AccessTokenPayload::from_token(object_field(
                        session,
                        &["userDataInJWT", "userDataInAccessToken"],
                    )),
                };
                Ok(Some(RegeneratedToken {
                    session_handle: str_field(session, "handle")
                        .ok_or_else(|| missing_field(REGENERATE_PATH, "session.handle"))?,
                    user_id: str_field(session, "userId")
                        .ok_or_else(|| missing_field(REGENERATE_PATH, "session.userId"))?,
                    access_token_payload,
                    access_token,
                }))
            }
            "UNAUTHORISED" => Ok(None),
            _ => Err(unexpected(REGENERATE_PATH, &response)),
        }
    }

    async fn validate_claims(
        &self,
        user_id: &str,
        tenant_id: &str,
        payload: &AccessTokenPayload,
        validators: &[SessionClaimValidator],
    ) -> Result<ClaimsValidation> {
        claims::validate_claims(user_id, tenant_id, payload, validators).await
    }

    async fn fetch_and_set_claim(
        &self,
        session_handle: &str,
        claim: &dyn SessionClaim,
    ) -> Result<bool> {
        let Some(info) = self.get_session_information(session_handle).await? else {
            return Ok(false);
        };
        let mut update = AccessTokenPayload::new();
        claim
            .build(&info.user_id, &info.tenant_id, &mut update)
            .await?;
        self.merge_into_access_token_payload(session_handle, update.as_map())
            .await
    }

    async fn set_claim_value(
        &self,
        session_handle: &str,
        claim: &dyn SessionClaim,
        value: Value,
    ) -> Result<bool> {
        let mut update = AccessTokenPayload::new();
        claim.add_to_payload(&mut update, value)?;
        self.merge_into_access_token_payload(session_handle, update.as_map())
            .await
    }

    async fn get_claim_value(
        &self,
        session_handle: &str,
        claim: &dyn SessionClaim,
    ) -> Result<Option<Value>> {
        Ok(self
            .get_session_information(session_handle)
            .await?
            .and_then(|info| claim.get_value_from_payload(&info.custom_claims_in_access_token_payload)))
    }

    async fn remove_claim(&self, session_handle: &str, claim: &dyn SessionClaim) -> Result<bool> {
        let mut update = AccessTokenPayload::new();
        claim.remove_from_payload_by_merge(&mut update)?;
        self.merge_into_access_token_payload(session_handle, update.as_map())
            .await
    }
}

fn string_list(response: &Value, field: &str) -> Vec<String> {
    response
        .get(field)
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}
