//! Token transfer between this server and the frontend
//!
//! Tokens arrive either as cookies (`sAccessToken`, `sRefreshToken`) or in an
//! `Authorization: Bearer` header, and leave either as cookies or as
//! `st-access-token` / `st-refresh-token` headers. Every response that changes
//! the access token also carries a `front-token` header the frontend can read
//! without touching the httpOnly cookie.
//!
//! Changes to the outgoing response are collected in a [`PendingResponse`] and
//! applied once the handler has produced its response.

use std::fmt;
use std::sync::Arc;

use axum_extra::extract::CookieJar;
use axum_extra::extract::cookie::{Cookie, SameSite};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use http::header::{ACCESS_CONTROL_EXPOSE_HEADERS, AUTHORIZATION, SET_COOKIE};
use http::{HeaderMap, HeaderName, HeaderValue, Method};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use time::{Duration, OffsetDateTime};

use crate::config::{CookieSameSite, NormalisedConfig, TokenTransferMethod};
use crate::error::{GeneralError, Result};
use crate::payload::AccessTokenPayload;
use crate::recipe::{CreatedSession, TokenInfo};

/// Access token cookie
pub const ACCESS_TOKEN_COOKIE: &str = "sAccessToken";
/// Refresh token cookie
pub const REFRESH_TOKEN_COOKIE: &str = "sRefreshToken";
/// Cookie set by old frontend SDKs; its presence marks a pre-header-flow session
pub const LEGACY_ID_REFRESH_TOKEN_COOKIE: &str = "sIdRefreshToken";

/// Frontend-readable session summary
pub const FRONT_TOKEN_HEADER: &str = "front-token";
/// Anti-CSRF token, both directions
pub const ANTI_CSRF_HEADER: &str = "anti-csrf";
/// Legacy id-refresh header, only ever written as `remove`
pub const ID_REFRESH_TOKEN_HEADER: &str = "id-refresh-token";
/// Outgoing access token in header mode
pub const ACCESS_TOKEN_HEADER: &str = "st-access-token";
/// Outgoing refresh token in header mode
pub const REFRESH_TOKEN_HEADER: &str = "st-refresh-token";
/// Transfer method requested by the frontend
pub const AUTH_MODE_HEADER: &str = "st-auth-mode";
/// Recipe id header, also the custom-header anti-CSRF signal
pub const RID_HEADER: &str = "rid";

const REMOVE: &str = "remove";
const HUNDRED_YEARS: Duration = Duration::days(36_500);

/// A concrete way a token travelled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransferMethod {
    /// Cookies
    Cookie,
    /// Authorization / `st-*` headers
    Header,
}

/// Every concrete method, in the order tokens are looked up
pub const AVAILABLE_TRANSFER_METHODS: [TransferMethod; 2] =
    [TransferMethod::Cookie, TransferMethod::Header];

impl TransferMethod {
    /// Whether the configured method allows this one
    pub fn allowed_by(self, configured: TokenTransferMethod) -> bool {
        matches!(
            (configured, self),
            (TokenTransferMethod::Any, _)
                | (TokenTransferMethod::Cookie, TransferMethod::Cookie)
                | (TokenTransferMethod::Header, TransferMethod::Header)
        )
    }
}

impl fmt::Display for TransferMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Cookie => "cookie",
            Self::Header => "header",
        })
    }
}

/// Which session token
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenType {
    /// Access token
    Access,
    /// Refresh token
    Refresh,
}

impl TokenType {
    fn cookie_name(self) -> &'static str {
        match self {
            Self::Access => ACCESS_TOKEN_COOKIE,
            Self::Refresh => REFRESH_TOKEN_COOKIE,
        }
    }

    fn header_name(self) -> &'static str {
        match self {
            Self::Access => ACCESS_TOKEN_HEADER,
            Self::Refresh => REFRESH_TOKEN_HEADER,
        }
    }
}

/// The parts of an incoming request the session engine reads
#[derive(Debug, Clone, Copy)]
pub struct SessionRequest<'a> {
    /// Request method
    pub method: &'a Method,
    /// Request headers
    pub headers: &'a HeaderMap,
}

impl<'a> SessionRequest<'a> {
    /// Borrow a method and header map
    pub fn new(method: &'a Method, headers: &'a HeaderMap) -> Self {
        Self { method, headers }
    }

    fn header(&self, name: &str) -> Option<&'a str> {
        self.headers
            .get(name)
            .and_then(|value| value.to_str().ok())
            .map(str::trim)
    }

    fn cookie(&self, name: &str) -> Option<String> {
        CookieJar::from_headers(self.headers)
            .get(name)
            .map(|cookie| cookie.value().to_string())
            .filter(|value| !value.is_empty())
    }

    /// A token sent with the given method, if any
    pub fn token(&self, token_type: TokenType, method: TransferMethod) -> Option<String> {
        match method {
            TransferMethod::Cookie => self.cookie(token_type.cookie_name()),
            TransferMethod::Header => self.bearer_token(),
        }
    }

    fn bearer_token(&self) -> Option<String> {
        let value = self.header(AUTHORIZATION.as_str())?;
        let (scheme, token) = value.split_once(' ')?;
        let token = token.trim();
        (scheme.eq_ignore_ascii_case("bearer") && !token.is_empty()).then(|| token.to_string())
    }

    /// Value of the `anti-csrf` header
    pub fn anti_csrf_token(&self) -> Option<String> {
        self.header(ANTI_CSRF_HEADER)
            .filter(|value| !value.is_empty())
            .map(str::to_string)
    }

    /// Whether a non-empty `rid` header is present
    pub fn has_rid_header(&self) -> bool {
        self.header(RID_HEADER).is_some_and(|rid| !rid.is_empty())
    }

    /// Whether the legacy `sIdRefreshToken` cookie is present
    pub fn has_legacy_id_refresh_token(&self) -> bool {
        self.cookie(LEGACY_ID_REFRESH_TOKEN_COOKIE).is_some()
    }

    /// Transfer method requested through `st-auth-mode`
    pub fn auth_mode(&self) -> Option<TransferMethod> {
        match self.header(AUTH_MODE_HEADER)?.to_ascii_lowercase().as_str() {
            "cookie" => Some(TransferMethod::Cookie),
            "header" => Some(TransferMethod::Header),
            _ => None,
        }
    }
}

impl<'a> From<&'a http::request::Parts> for SessionRequest<'a> {
    fn from(parts: &'a http::request::Parts) -> Self {
        Self::new(&parts.method, &parts.headers)
    }
}

impl<'a, B> From<&'a http::Request<B>> for SessionRequest<'a> {
    fn from(request: &'a http::Request<B>) -> Self {
        Self::new(request.method(), request.headers())
    }
}

/// Method used to send tokens of a newly created session
///
/// A fixed configuration wins; otherwise the frontend's `st-auth-mode`, then header.
pub fn output_transfer_method(
    config: &NormalisedConfig,
    request: &SessionRequest<'_>,
) -> TransferMethod {
    match config.token_transfer_method {
        TokenTransferMethod::Cookie => TransferMethod::Cookie,
        TokenTransferMethod::Header => TransferMethod::Header,
        TokenTransferMethod::Any => request.auth_mode().unwrap_or(TransferMethod::Header),
    }
}

/// JSON carried (base64 encoded) in the `front-token` header
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrontToken {
    /// User id
    pub uid: String,
    /// Access token expiry (ms epoch)
    pub ate: u64,
    /// Access token payload
    pub up: AccessTokenPayload,
}

impl FrontToken {
    /// Encode as standard base64 JSON
    ///
    /// # Errors
    ///
    /// Fails only if the payload cannot be serialized.
    pub fn encode(&self) -> Result<String> {
        Ok(STANDARD.encode(serde_json::to_vec(self)?))
    }

    /// Decode a `front-token` header value
    pub fn decode(value: &str) -> Option<Self> {
        let bytes = STANDARD.decode(value.trim()).ok()?;
        serde_json::from_slice(&bytes).ok()
    }
}

#[derive(Debug, Default)]
struct Mutations {
    cookies: Vec<(String, String, HeaderValue)>,
    headers: Vec<(HeaderName, HeaderValue)>,
    exposed: Vec<String>,
}

/// Response changes queued by session operations
///
/// Cloning shares the buffer, so a [`SessionContainer`](crate::SessionContainer)
/// and the middleware that owns the response see the same changes. A later
/// write of the same cookie (name and path) or header replaces the earlier one.
#[derive(Clone, Default)]
pub struct PendingResponse {
    inner: Arc<Mutex<Mutations>>,
}

impl fmt::Debug for PendingResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("PendingResponse")
            .field("cookies", &inner.cookies.len())
            .field("headers", &inner.headers.len())
            .field("exposed", &inner.exposed)
            .finish()
    }
}

fn header_value(value: &str) -> Result<HeaderValue> {
    HeaderValue::from_str(value).map_err(|e| GeneralError::Header(format!("{value:?}: {e}")).into())
}

impl PendingResponse {
    /// Empty buffer
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a `Set-Cookie`
    ///
    /// # Errors
    ///
    /// Fails when the rendered cookie is not a valid header value.
    pub fn set_cookie(&self, cookie: &Cookie<'_>) -> Result<()> {
        let name = cookie.name().to_string();
        let path = cookie.path().unwrap_or("/").to_string();
        let value = header_value(&cookie.to_string())?;

        let mut inner = self.inner.lock();
        inner.cookies.retain(|(n, p, _)| !(*n == name && *p == path));
        inner.cookies.push((name, path, value));
        Ok(())
    }

    /// Queue a header, optionally listing it in `Access-Control-Expose-Headers`
    ///
    /// # Errors
    ///
    /// Fails when `value` is not a valid header value.
    pub fn set_header(&self, name: &'static str, value: &str, expose: bool) -> Result<()> {
        let value = header_value(value)?;
        let name = HeaderName::from_static(name);

        let mut inner = self.inner.lock();
        inner.headers.retain(|(n, _)| *n != name);
        inner.headers.push((name.clone(), value));
        if expose && !inner.exposed.iter().any(|h| h == name.as_str()) {
            inner.exposed.push(name.as_str().to_string());
        }
        Ok(())
    }

    /// Drop a queued header
    pub fn remove_header(&self, name: &str) {
        let mut inner = self.inner.lock();
        inner.headers.retain(|(n, _)| n.as_str() != name);
        inner.exposed.retain(|h| h != name);
    }

    /// Value of a queued header
    pub fn header(&self, name: &str) -> Option<String> {
        self.inner
            .lock()
            .headers
            .iter()
            .rev()
            .find(|(n, _)| n.as_str() == name)
            .and_then(|(_, value)| value.to_str().ok())
            .map(str::to_string)
    }

    /// Queued `Set-Cookie` values, in order
    pub fn cookies(&self) -> Vec<String> {
        self.inner
            .lock()
            .cookies
            .iter()
            .filter_map(|(_, _, value)| value.to_str().ok())
            .map(str::to_string)
            .collect()
    }

    /// True when nothing is queued
    pub fn is_empty(&self) -> bool {
        let inner = self.inner.lock();
        inner.cookies.is_empty() && inner.headers.is_empty()
    }

    /// Write the queued changes into response headers
    ///
    /// Exposed header names are merged with any `Access-Control-Expose-Headers`
    /// already present, without duplicates.
    pub fn apply_to(&self, headers: &mut HeaderMap) {
        let inner = self.inner.lock();
        for (_, _, cookie) in &inner.cookies {
            headers.append(SET_COOKIE, cookie.clone());
        }
        for (name, value) in &inner.headers {
            headers.insert(name.clone(), value.clone());
        }
        if inner.exposed.is_empty() {
            return;
        }

        let mut exposed: Vec<String> = headers
            .get_all(ACCESS_CONTROL_EXPOSE_HEADERS)
            .iter()
            .filter_map(|value| value.to_str().ok())
            .flat_map(|value| value.split(','))
            .map(|name| name.trim().to_string())
            .filter(|name| !name.is_empty())
            .collect();
        for name in &inner.exposed {
            if !exposed.iter().any(|existing| existing.eq_ignore_ascii_case(name)) {
                exposed.push(name.clone());
            }
        }
        if let Ok(value) = HeaderValue::from_str(&exposed.join(", ")) {
            headers.insert(ACCESS_CONTROL_EXPOSE_HEADERS, value);
        }
    }
}

fn same_site(value: CookieSameSite) -> SameSite {
    match value {
        CookieSameSite::Strict => SameSite::Strict,
        CookieSameSite::Lax => SameSite::Lax,
        CookieSameSite::None => SameSite::None,
    }
}

fn session_cookie(
    config: &NormalisedConfig,
    name: &'static str,
    value: &str,
    path: &str,
    expires: OffsetDateTime,
) -> Cookie<'static> {
    let mut builder = Cookie::build((name, value.to_string()))
        .http_only(true)
        .secure(config.cookie_secure)
        .same_site(same_site(config.cookie_same_site))
        .path(path.to_string())
        .expires(expires);
    if let Some(domain) = &config.cookie_domain {
        builder = builder.domain(domain.clone());
    }
    if expires == OffsetDateTime::UNIX_EPOCH {
        builder = builder.max_age(Duration::ZERO);
    }
    builder.build()
}

fn token_path(config: &NormalisedConfig, token_type: TokenType) -> &str {
    match token_type {
        TokenType::Access => "/",
        TokenType::Refresh => &config.refresh_token_path,
    }
}

pub(crate) fn expiry_from_millis(expiry_ms: u64) -> Result<OffsetDateTime> {
    let nanos = i128::from(expiry_ms) * 1_000_000;
    OffsetDateTime::from_unix_timestamp_nanos(nanos)
        .map_err(|e| GeneralError::Header(format!("cookie expiry {expiry_ms}: {e}")).into())
}

/// Write a token with the given method
///
/// # Errors
///
/// Fails when the token cannot be encoded as a header value.
pub fn set_token(
    config: &NormalisedConfig,
    response: &PendingResponse,
    token_type: TokenType,
    value: &str,
    expires: OffsetDateTime,
    method: TransferMethod,
) -> Result<()> {
    match method {
        TransferMethod::Cookie => response.set_cookie(&session_cookie(
            config,
            token_type.cookie_name(),
            value,
            token_path(config, token_type),
            expires,
        )),
        TransferMethod::Header => response.set_header(token_type.header_name(), value, true),
    }
}

/// Write the access token and a matching `front-token`
///
/// The access token cookie outlives the token itself so the frontend can tell
/// an expired session (refresh) from a missing one (log in).
///
/// # Errors
///
/// Fails when a value cannot be encoded.
pub fn attach_access_token(
    config: &NormalisedConfig,
    response: &PendingResponse,
    user_id: &str,
    access_token: &TokenInfo,
    payload: &AccessTokenPayload,
    method: TransferMethod,
) -> Result<()> {
    let front_token = FrontToken {
        uid: user_id.to_string(),
        ate: access_token.expiry,
        up: payload.clone(),
    }
    .encode()?;
    response.set_header(FRONT_TOKEN_HEADER, &front_token, true)?;
    set_token(
        config,
        response,
        TokenType::Access,
        &access_token.token,
        OffsetDateTime::now_utc() + HUNDRED_YEARS,
        method,
    )
}

/// Write every token of a created or refreshed session
///
/// # Errors
///
/// Fails when a value cannot be encoded.
pub fn attach_created_session(
    config: &NormalisedConfig,
    response: &PendingResponse,
    session: &CreatedSession,
    method: TransferMethod,
) -> Result<()> {
    attach_access_token(
        config,
        response,
        &session.user_id,
        &session.access_token,
        &session.access_token_payload,
        method,
    )?;
    set_token(
        config,
        response,
        TokenType::Refresh,
        &session.refresh_token.token,
        expiry_from_millis(session.refresh_token.expiry)?,
        method,
    )?;
    if let Some(anti_csrf) = &session.anti_csrf_token {
        response.set_header(ANTI_CSRF_HEADER, anti_csrf, true)?;
    }
    Ok(())
}

/// Expire both tokens sent with `method` and tell the frontend the session is gone
///
/// # Errors
///
/// Fails when a value cannot be encoded.
pub fn clear_session(
    config: &NormalisedConfig,
    response: &PendingResponse,
    method: TransferMethod,
) -> Result<()> {
    for token_type in [TokenType::Access, TokenType::Refresh] {
        set_token(config, response, token_type, "", OffsetDateTime::UNIX_EPOCH, method)?;
    }
    if method == TransferMethod::Cookie {
        clear_legacy_id_refresh_token(config, response)?;
    }
    response.remove_header(ANTI_CSRF_HEADER);
    response.set_header(FRONT_TOKEN_HEADER, REMOVE, true)?;
    response.set_header(ID_REFRESH_TOKEN_HEADER, REMOVE, true)
}

/// [`clear_session`] for every transfer method
///
/// Tokens may already have been queued on the response with either method, so
/// both are overwritten.
///
/// # Errors
///
/// Fails when a value cannot be encoded.
pub fn clear_session_from_all_methods(
    config: &NormalisedConfig,
    response: &PendingResponse,
) -> Result<()> {
    for method in AVAILABLE_TRANSFER_METHODS {
        clear_session(config, response, method)?;
    }
    Ok(())
}

/// Expire the legacy `sIdRefreshToken` cookie
///
/// # Errors
///
/// Fails when the cookie cannot be encoded.
pub fn clear_legacy_id_refresh_token(
    config: &NormalisedConfig,
    response: &PendingResponse,
) -> Result<()> {
    response.set_cookie(&session_cookie(
        config,
        LEGACY_ID_REFRESH_TOKEN_COOKIE,
        "",
        "/",
        OffsetDateTime::UNIX_EPOCH,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SessionConfig;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn config() -> NormalisedConfig {
        SessionConfig::new("http://localhost:3567", "http://localhost:3001", "http://localhost:3000")
            .normalise()
            .unwrap()
    }

    fn headers(pairs: &[(&'static str, &str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.append(*name, HeaderValue::from_str(value).unwrap());
        }
        map
    }

    #[test]
    fn test_reads_tokens_by_method() {
        let map = headers(&[
            ("cookie", "sAccessToken=from-cookie; sRefreshToken=refresh"),
            ("authorization", "Bearer from-header"),
        ]);
        let request = SessionRequest::new(&Method::GET, &map);
        assert_eq!(
            request.token(TokenType::Access, TransferMethod::Cookie).as_deref(),
            Some("from-cookie")
        );
        assert_eq!(
            request.token(TokenType::Refresh, TransferMethod::Cookie).as_deref(),
            Some("refresh")
        );
        assert_eq!(
            request.token(TokenType::Access, TransferMethod::Header).as_deref(),
            Some("from-header")
        );
    }

    #[test]
    fn test_bearer_parsing() {
        for (value, expected) in [
            ("bearer abc", Some("abc")),
            ("Bearer   abc  ", Some("abc")),
            ("Basic abc", None),
            ("Bearer", None),
            ("Bearer ", None),
        ] {
            let map = headers(&[("authorization", value)]);
            let request = SessionRequest::new(&Method::GET, &map);
            assert_eq!(request.bearer_token().as_deref(), expected, "{value}");
        }
    }

    #[test]
    fn test_output_method_follows_auth_mode() {
        let mut config = config();
        let cookie_mode = headers(&[("st-auth-mode", "COOKIE")]);
        let none = HeaderMap::new();

        assert_eq!(
            output_transfer_method(&config, &SessionRequest::new(&Method::POST, &cookie_mode)),
            TransferMethod::Cookie
        );
        assert_eq!(
            output_transfer_method(&config, &SessionRequest::new(&Method::POST, &none)),
            TransferMethod::Header
        );

        config.token_transfer_method = TokenTransferMethod::Header;
        assert_eq!(
            output_transfer_method(&config, &SessionRequest::new(&Method::POST, &cookie_mode)),
            TransferMethod::Header
        );
    }

    #[test]
    fn test_front_token_encoding() {
        let mut up = AccessTokenPayload::new();
        up.insert("theme", json!("dark")).unwrap();
        let token = FrontToken {
            uid: "user".into(),
            ate: 42,
            up,
        };
        let encoded = token.encode().unwrap();
        let raw: serde_json::Value =
            serde_json::from_slice(&STANDARD.decode(&encoded).unwrap()).unwrap();
        assert_eq!(raw, json!({"uid": "user", "ate": 42, "up": {"theme": "dark"}}));
        assert_eq!(FrontToken::decode(&encoded), Some(token));
    }

    #[test]
    fn test_clear_session_cookies_and_headers() {
        let config = config();
        let response = PendingResponse::new();
        response.set_header(ANTI_CSRF_HEADER, "csrf", true).unwrap();
        clear_session(&config, &response, TransferMethod::Cookie).unwrap();

        let cookies = response.cookies();
        assert_eq!(cookies.len(), 3);
        for cookie in &cookies {
            assert!(cookie.contains("Expires=Thu, 01 Jan 1970 00:00:00 GMT"), "{cookie}");
            assert!(cookie.contains("Max-Age=0"), "{cookie}");
        }
        assert!(cookies.iter().any(|c| {
            c.starts_with("sRefreshToken=;") && c.contains("Path=/auth/session/refresh")
        }));
        assert_eq!(response.header(FRONT_TOKEN_HEADER).as_deref(), Some("remove"));
        assert_eq!(response.header(ID_REFRESH_TOKEN_HEADER).as_deref(), Some("remove"));
        assert_eq!(response.header(ANTI_CSRF_HEADER), None);
    }

    #[test]
    fn test_clear_header_mode_writes_empty_tokens() {
        let response = PendingResponse::new();
        clear_session(&config(), &response, TransferMethod::Header).unwrap();
        assert_eq!(response.header(ACCESS_TOKEN_HEADER).as_deref(), Some(""));
        assert_eq!(response.header(REFRESH_TOKEN_HEADER).as_deref(), Some(""));
        assert!(response.cookies().is_empty());
    }

    #[test]
    fn test_later_cookie_replaces_earlier() {
        let config = config();
        let response = PendingResponse::new();
        let future = OffsetDateTime::now_utc() + Duration::days(1);
        set_token(&config, &response, TokenType::Access, "a", future, TransferMethod::Cookie).unwrap();
        set_token(&config, &response, TokenType::Access, "b", future, TransferMethod::Cookie).unwrap();
        let cookies = response.cookies();
        assert_eq!(cookies.len(), 1);
        assert!(cookies[0].starts_with("sAccessToken=b;"));
    }

    #[test]
    fn test_expose_headers_deduplicated() {
        let response = PendingResponse::new();
        response.set_header(FRONT_TOKEN_HEADER, "x", true).unwrap();
        response.set_header(FRONT_TOKEN_HEADER, "y", true).unwrap();
        response.set_header(ANTI_CSRF_HEADER, "z", true).unwrap();

        let mut map = headers(&[("access-control-expose-headers", "x-request-id, front-token")]);
        response.apply_to(&mut map);
        assert_eq!(
            map.get(ACCESS_CONTROL_EXPOSE_HEADERS).unwrap(),
            "x-request-id, front-token, anti-csrf"
        );
        assert_eq!(map.get(FRONT_TOKEN_HEADER).unwrap(), "y");
    }

    #[test]
    fn test_allowed_by() {
        assert!(TransferMethod::Cookie.allowed_by(TokenTransferMethod::Any));
        assert!(TransferMethod::Header.allowed_by(TokenTransferMethod::Header));
        assert!(!TransferMethod::Cookie.allowed_by(TokenTransferMethod::Header));
    }
}
