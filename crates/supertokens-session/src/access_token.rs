//! Access token structure and field extraction
//!
//! Version 3 and later tokens are flat: `sub`, `exp` and `iat` (seconds),
//! `sessionHandle`, `refreshTokenHash1`, plus `tId` from version 4 on. Custom
//! claims sit next to them. Version 2 tokens nest user data under `userData`
//! and carry `expiryTime`/`timeCreated` in milliseconds.
//!
//! Only mandatory fields are validated. `parentRefreshTokenHash1` and
//! `antiCsrfToken` are optional; a value of the wrong type reads as absent.

use serde_json::{Map, Value};

use crate::error::{Result, SessionError};
use crate::jwt::ParsedJwt;
use crate::payload::AccessTokenPayload;
use crate::utils::now_ms;

/// Tenant used when the token names none
pub const DEFAULT_TENANT_ID: &str = "public";

const STRUCTURE_CHANGED: &str =
    "Access token does not contain all the information. Maybe the structure has changed?";

/// Fields of a verified access token
#[derive(Debug, Clone, PartialEq)]
pub struct AccessTokenInfo {
    /// Structural version
    pub version: u32,
    /// Signing key id, absent on legacy tokens
    pub kid: Option<String>,
    /// Session handle issued by the core
    pub session_handle: String,
    /// Session owner
    pub user_id: String,
    /// Recipe user id (`rsub`), defaults to the user id
    pub recipe_user_id: String,
    /// Tenant of the session
    pub tenant_id: String,
    /// Hash of the refresh token this access token belongs to
    pub refresh_token_hash1: String,
    /// Hash of the previous refresh token while a rotation is unconfirmed
    pub parent_refresh_token_hash1: Option<String>,
    /// Anti-CSRF token minted with the session
    pub anti_csrf_token: Option<String>,
    /// Expiry (ms epoch)
    pub expiry_time: u64,
    /// Issue time (ms epoch)
    pub time_created: u64,
    /// Payload as exposed to the application
    pub payload: AccessTokenPayload,
}

/// Convert a JSON number to unsigned milliseconds, tolerating float encodings
pub fn json_number_as_u64(value: &Value) -> Option<u64> {
    if let Some(int) = value.as_u64() {
        return Some(int);
    }
    value
        .as_f64()
        .filter(|float| float.is_finite() && *float >= 0.0)
        .map(|float| float.round() as u64)
}

fn is_string(payload: &Map<String, Value>, key: &str) -> bool {
    payload.get(key).is_some_and(Value::is_string)
}

fn is_number(payload: &Map<String, Value>, key: &str) -> bool {
    payload.get(key).is_some_and(Value::is_number)
}

fn string_field(payload: &Map<String, Value>, key: &str) -> Option<String> {
    payload.get(key).and_then(Value::as_str).map(str::to_string)
}

/// Check that a payload carries every mandatory field for its version
///
/// # Errors
///
/// [`SessionError::TryRefreshToken`] when a field is missing or mistyped.
pub fn validate_access_token_structure(payload: &Map<String, Value>, version: u32) -> Result<()> {
    let valid = if version >= 3 {
        is_string(payload, "sub")
            && is_number(payload, "exp")
            && is_number(payload, "iat")
            && is_string(payload, "sessionHandle")
            && is_string(payload, "refreshTokenHash1")
            && (version < 4 || is_string(payload, "tId"))
    } else {
        is_string(payload, "sessionHandle")
            && is_string(payload, "userId")
            && is_string(payload, "refreshTokenHash1")
            && payload.get("userData").is_some_and(|data| !data.is_null())
            && is_number(payload, "expiryTime")
            && is_number(payload, "timeCreated")
    };

    if valid {
        Ok(())
    } else {
        Err(SessionError::try_refresh(STRUCTURE_CHANGED))
    }
}

impl AccessTokenInfo {
    /// Extract fields from a token whose signature has already been checked
    ///
    /// # Errors
    ///
    /// [`SessionError::TryRefreshToken`] when the structure is invalid, the
    /// anti-CSRF token is required but absent, or the token has expired.
    pub fn from_verified(jwt: &ParsedJwt, do_anti_csrf_check: bool) -> Result<Self> {
        let info = Self::extract(jwt)?;

        if do_anti_csrf_check && info.anti_csrf_token.is_none() {
            return Err(SessionError::try_refresh(
                "Access token does not contain the anti-csrf token.",
            ));
        }
        if info.expiry_time < now_ms() {
            return Err(SessionError::try_refresh("Access token expired"));
        }

        Ok(info)
    }

    /// Extract fields without checking expiry or anti-CSRF presence
    ///
    /// # Errors
    ///
    /// [`SessionError::TryRefreshToken`] when the structure is invalid.
    pub fn extract(jwt: &ParsedJwt) -> Result<Self> {
        let payload = &jwt.payload;
        validate_access_token_structure(payload, jwt.version)?;

        let missing = || SessionError::try_refresh(STRUCTURE_CHANGED);
        let millis = |key: &str, scale: u64| {
            payload
                .get(key)
                .and_then(json_number_as_u64)
                .map(|value| value.saturating_mul(scale))
                .ok_or_else(missing)
        };

        let info = if jwt.version >= 3 {
            let user_id = string_field(payload, "sub").ok_or_else(missing)?;
            Self {
                version: jwt.version,
                kid: jwt.kid.clone(),
                session_handle: string_field(payload, "sessionHandle").ok_or_else(missing)?,
                recipe_user_id: string_field(payload, "rsub").unwrap_or_else(|| user_id.clone()),
                user_id,
                tenant_id: string_field(payload, "tId")
                    .unwrap_or_else(|| DEFAULT_TENANT_ID.to_string()),
                refresh_token_hash1: string_field(payload, "refreshTokenHash1")
                    .ok_or_else(missing)?,
                parent_refresh_token_hash1: string_field(payload, "parentRefreshTokenHash1"),
                anti_csrf_token: string_field(payload, "antiCsrfToken"),
                expiry_time: millis("exp", 1000)?,
                time_created: millis("iat", 1000)?,
                payload: AccessTokenPayload::from_token(payload.clone()),
            }
        } else {
            let user_id = string_field(payload, "userId").ok_or_else(missing)?;
            let user_data = match payload.get("userData") {
                Some(Value::Object(map)) => map.clone(),
                _ => Map::new(),
            };
            Self {
                version: jwt.version,
                kid: None,
                session_handle: string_field(payload, "sessionHandle").ok_or_else(missing)?,
                recipe_user_id: user_id.clone(),
                user_id,
                tenant_id: DEFAULT_TENANT_ID.to_string(),
                refresh_token_hash1: string_field(payload, "refreshTokenHash1")
                    .ok_or_else(missing)?,
                parent_refresh_token_hash1: string_field(payload, "parentRefreshTokenHash1"),
                anti_csrf_token: string_field(payload, "antiCsrfToken"),
                expiry_time: millis("expiryTime", 1)?,
                time_created: millis("timeCreated", 1)?,
                payload: AccessTokenPayload::from_token(user_data),
            }
        };

        Ok(info)
    }

    /// True when the key id names a rotating signing key
    pub fn uses_dynamic_key(&self) -> bool {
        crate::jwt::is_dynamic_key_id(self.kid.as_deref())
    }
}
