//! Session engine configuration
//!
//! [`SessionConfig`] is what applications write (by hand, from a file via serde,
//! or from `SUPERTOKENS_*` environment variables). [`SessionEngine::new`] turns
//! it into a [`NormalisedConfig`] where every optional knob has been resolved
//! against the app's domains.
//!
//! [`SessionEngine::new`]: crate::SessionEngine::new

use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;
use std::time::Duration;

use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::{Result, SessionError};

/// How tokens travel between the frontend and this server
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TokenTransferMethod {
    /// `sAccessToken` / `sRefreshToken` cookies
    Cookie,
    /// `Authorization: Bearer` in, `st-access-token` / `st-refresh-token` out
    Header,
    /// Accept either; the output method follows the `st-auth-mode` request header
    #[default]
    Any,
}

/// Anti-CSRF protection applied to cookie based sessions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AntiCsrfMode {
    /// An anti-csrf token embedded in the access token must be echoed in the `anti-csrf` header
    ViaToken,
    /// The request must carry a non-empty `rid` header
    ViaCustomHeader,
    /// No anti-CSRF check
    None,
}

/// `SameSite` attribute of session cookies
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CookieSameSite {
    /// `SameSite=Strict`
    Strict,
    /// `SameSite=Lax`
    Lax,
    /// `SameSite=None` (requires `Secure`)
    None,
}

/// Domains and paths of the application using the SDK
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppInfo {
    /// Display name of the app
    #[serde(default = "default_app_name")]
    pub app_name: String,
    /// Origin serving the API, e.g. `https://api.example.com`
    pub api_domain: String,
    /// Origin serving the website, e.g. `https://example.com`
    pub website_domain: String,
    /// Path prefix of the SDK routes
    #[serde(default = "default_api_base_path")]
    pub api_base_path: String,
}

/// Configuration of the session engine
#[derive(Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionConfig {
    /// Core location(s); multiple hosts are separated by `;`
    pub connection_uri: String,
    /// API key sent to the core as the `api-key` header
    #[serde(
        default,
        serialize_with = "serialize_optional_secret",
        deserialize_with = "deserialize_optional_secret"
    )]
    pub api_key: Option<SecretString>,
    /// Application domains
    pub app_info: AppInfo,
    /// Cookie domain ("session scope"); host-only cookies when absent
    #[serde(default)]
    pub cookie_domain: Option<String>,
    /// Force the `Secure` cookie attribute; derived from the API scheme when absent
    #[serde(default)]
    pub cookie_secure: Option<bool>,
    /// Force the `SameSite` attribute; derived from the domains when absent
    #[serde(default)]
    pub cookie_same_site: Option<CookieSameSite>,
    /// Anti-CSRF mode; derived from `SameSite` when absent
    #[serde(default)]
    pub anti_csrf: Option<AntiCsrfMode>,
    /// Allowed token transfer method
    #[serde(default)]
    pub token_transfer_method: TokenTransferMethod,
    /// Sign new access tokens with rotating (`d-`) keys instead of the static (`s-`) key
    #[serde(default = "default_true")]
    pub use_dynamic_access_token_signing_key: bool,
    /// Verify access tokens locally when possible instead of asking the core every time
    #[serde(default = "default_true")]
    pub local_verification: bool,
    /// The core blacklists revoked access tokens, so every verification must reach it
    #[serde(default)]
    pub access_token_blacklisting: bool,
    /// How long fetched signing keys stay fresh
    #[serde(default = "default_jwks_refresh_interval_secs")]
    pub jwks_refresh_interval_secs: u64,
    /// Retries granted to each core call that is rate limited (HTTP 429)
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Timeout of a single core request
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    /// Status used for unauthorised / try-refresh / token-theft responses
    #[serde(default = "default_session_expired_status_code")]
    pub session_expired_status_code: u16,
    /// Status used for invalid claim responses
    #[serde(default = "default_invalid_claim_status_code")]
    pub invalid_claim_status_code: u16,
}

impl fmt::Debug for SessionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionConfig")
            .field("connection_uri", &self.connection_uri)
            .field("api_key", &self.api_key.as_ref().map(|_| "[REDACTED]"))
            .field("app_info", &self.app_info)
            .field("cookie_domain", &self.cookie_domain)
            .field("cookie_secure", &self.cookie_secure)
            .field("cookie_same_site", &self.cookie_same_site)
            .field("anti_csrf", &self.anti_csrf)
            .field("token_transfer_method", &self.token_transfer_method)
            .field(
                "use_dynamic_access_token_signing_key",
                &self.use_dynamic_access_token_signing_key,
            )
            .field("local_verification", &self.local_verification)
            .field("access_token_blacklisting", &self.access_token_blacklisting)
            .field("jwks_refresh_interval_secs", &self.jwks_refresh_interval_secs)
            .field("max_retries", &self.max_retries)
            .finish_non_exhaustive()
    }
}

fn serialize_optional_secret<S>(
    secret: &Option<SecretString>,
    serializer: S,
) -> std::result::Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    match secret {
        Some(secret) => serializer.serialize_some(secret.expose_secret()),
        None => serializer.serialize_none(),
    }
}

fn deserialize_optional_secret<'de, D>(
    deserializer: D,
) -> std::result::Result<Option<SecretString>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let s: Option<String> = Deserialize::deserialize(deserializer)?;
    Ok(s.map(SecretString::new))
}

fn default_app_name() -> String {
    "app".to_string()
}

fn default_api_base_path() -> String {
    "/auth".to_string()
}

fn default_true() -> bool {
    true
}

fn default_jwks_refresh_interval_secs() -> u64 {
    60
}

fn default_max_retries() -> u32 {
    5
}

fn default_request_timeout_secs() -> u64 {
    10
}

fn default_session_expired_status_code() -> u16 {
    401
}

fn default_invalid_claim_status_code() -> u16 {
    403
}

impl SessionConfig {
    /// Create a configuration with defaults for everything but the core and app domains
    pub fn new(
        connection_uri: impl Into<String>,
        api_domain: impl Into<String>,
        website_domain: impl Into<String>,
    ) -> Self {
        Self {
            connection_uri: connection_uri.into(),
            api_key: None,
            app_info: AppInfo {
                app_name: default_app_name(),
                api_domain: api_domain.into(),
                website_domain: website_domain.into(),
                api_base_path: default_api_base_path(),
            },
            cookie_domain: None,
            cookie_secure: None,
            cookie_same_site: None,
            anti_csrf: None,
            token_transfer_method: TokenTransferMethod::Any,
            use_dynamic_access_token_signing_key: true,
            local_verification: true,
            access_token_blacklisting: false,
            jwks_refresh_interval_secs: default_jwks_refresh_interval_secs(),
            max_retries: default_max_retries(),
            request_timeout_secs: default_request_timeout_secs(),
            session_expired_status_code: default_session_expired_status_code(),
            invalid_claim_status_code: default_invalid_claim_status_code(),
        }
    }

    /// Load configuration from `SUPERTOKENS_*` environment variables
    ///
    /// # Errors
    ///
    /// Returns a configuration error when a required variable is missing or a
    /// value cannot be parsed.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through an arbitrary variable lookup
    ///
    /// Required: `SUPERTOKENS_CONNECTION_URI`, `SUPERTOKENS_API_DOMAIN`,
    /// `SUPERTOKENS_WEBSITE_DOMAIN`.
    ///
    /// # Errors
    ///
    /// Returns a configuration error when a required variable is missing or a
    /// value cannot be parsed.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let required = |key: &str| {
            lookup(key).ok_or_else(|| SessionError::config(format!("{key} is not set")))
        };

        let mut config = Self::new(
            required("SUPERTOKENS_CONNECTION_URI")?,
            required("SUPERTOKENS_API_DOMAIN")?,
            required("SUPERTOKENS_WEBSITE_DOMAIN")?,
        );

        config.api_key = lookup("SUPERTOKENS_API_KEY").map(SecretString::new);
        if let Some(name) = lookup("SUPERTOKENS_APP_NAME") {
            config.app_info.app_name = name;
        }
        if let Some(path) = lookup("SUPERTOKENS_API_BASE_PATH") {
            config.app_info.api_base_path = path;
        }
        config.cookie_domain = lookup("SUPERTOKENS_COOKIE_DOMAIN");
        config.cookie_secure = parse_var(&lookup, "SUPERTOKENS_COOKIE_SECURE")?;
        config.cookie_same_site = parse_var(&lookup, "SUPERTOKENS_COOKIE_SAME_SITE")?;
        config.anti_csrf = parse_var(&lookup, "SUPERTOKENS_ANTI_CSRF")?;
        if let Some(method) = parse_var(&lookup, "SUPERTOKENS_TOKEN_TRANSFER_METHOD")? {
            config.token_transfer_method = method;
        }
        if let Some(dynamic) = parse_var(&lookup, "SUPERTOKENS_USE_DYNAMIC_SIGNING_KEY")? {
            config.use_dynamic_access_token_signing_key = dynamic;
        }
        if let Some(local) = parse_var(&lookup, "SUPERTOKENS_LOCAL_VERIFICATION")? {
            config.local_verification = local;
        }
        if let Some(secs) = parse_var(&lookup, "SUPERTOKENS_JWKS_REFRESH_INTERVAL_SECS")? {
            config.jwks_refresh_interval_secs = secs;
        }
        if let Some(retries) = parse_var(&lookup, "SUPERTOKENS_MAX_RETRIES")? {
            config.max_retries = retries;
        }

        Ok(config)
    }

    /// Builder method: set the core API key
    #[must_use]
    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(SecretString::new(api_key.into()));
        self
    }

    /// Builder method: set the SDK route prefix
    #[must_use]
    pub fn with_api_base_path(mut self, path: impl Into<String>) -> Self {
        self.app_info.api_base_path = path.into();
        self
    }

    /// Builder method: set the cookie domain
    #[must_use]
    pub fn with_cookie_domain(mut self, domain: impl Into<String>) -> Self {
        self.cookie_domain = Some(domain.into());
        self
    }

    /// Builder method: force the `Secure` attribute
    #[must_use]
    pub fn with_cookie_secure(mut self, secure: bool) -> Self {
        self.cookie_secure = Some(secure);
        self
    }

    /// Builder method: force the `SameSite` attribute
    #[must_use]
    pub fn with_cookie_same_site(mut self, same_site: CookieSameSite) -> Self {
        self.cookie_same_site = Some(same_site);
        self
    }

    /// Builder method: set the anti-CSRF mode
    #[must_use]
    pub fn with_anti_csrf(mut self, mode: AntiCsrfMode) -> Self {
        self.anti_csrf = Some(mode);
        self
    }

    /// Builder method: restrict the token transfer method
    #[must_use]
    pub fn with_token_transfer_method(mut self, method: TokenTransferMethod) -> Self {
        self.token_transfer_method = method;
        self
    }

    /// Builder method: choose between dynamic (`d-`) and static (`s-`) signing keys
    #[must_use]
    pub fn with_dynamic_signing_key(mut self, dynamic: bool) -> Self {
        self.use_dynamic_access_token_signing_key = dynamic;
        self
    }

    /// Builder method: toggle local access token verification
    #[must_use]
    pub fn with_local_verification(mut self, enabled: bool) -> Self {
        self.local_verification = enabled;
        self
    }

    /// Builder method: declare that the core blacklists access tokens
    #[must_use]
    pub fn with_access_token_blacklisting(mut self, enabled: bool) -> Self {
        self.access_token_blacklisting = enabled;
        self
    }

    /// Builder method: set the signing key refresh interval
    #[must_use]
    pub fn with_jwks_refresh_interval(mut self, interval: Duration) -> Self {
        self.jwks_refresh_interval_secs = interval.as_secs();
        self
    }

    /// Builder method: set the per-call rate-limit retry budget
    #[must_use]
    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    /// Resolve defaults that depend on the app domains and validate the result
    ///
    /// # Errors
    ///
    /// Returns a configuration error for unparsable domains, an invalid cookie
    /// domain, or an empty connection URI.
    pub fn normalise(&self) -> Result<NormalisedConfig> {
        if self.connection_uri.trim().is_empty() {
            return Err(SessionError::config("connectionURI must not be empty"));
        }

        let api_domain = normalise_domain(&self.app_info.api_domain)?;
        let website_domain = normalise_domain(&self.app_info.website_domain)?;
        let api_base_path = normalise_base_path(&self.app_info.api_base_path);

        let cookie_domain = self
            .cookie_domain
            .as_deref()
            .map(normalise_session_scope)
            .transpose()?;

        let cookie_same_site = self
            .cookie_same_site
            .unwrap_or_else(|| default_same_site(&api_domain, &website_domain));
        let cookie_secure = self
            .cookie_secure
            .unwrap_or_else(|| api_domain.scheme() == "https");
        let anti_csrf = self.anti_csrf.unwrap_or(match cookie_same_site {
            CookieSameSite::None => AntiCsrfMode::ViaCustomHeader,
            _ => AntiCsrfMode::None,
        });

        let refresh_token_path = format!("{api_base_path}/session/refresh");

        Ok(NormalisedConfig {
            app_name: self.app_info.app_name.clone(),
            api_domain,
            website_domain,
            api_base_path,
            refresh_token_path,
            cookie_domain,
            cookie_secure,
            cookie_same_site,
            anti_csrf,
            token_transfer_method: self.token_transfer_method,
            use_dynamic_access_token_signing_key: self.use_dynamic_access_token_signing_key,
            local_verification: self.local_verification,
            access_token_blacklisting: self.access_token_blacklisting,
            jwks_refresh_interval: Duration::from_secs(self.jwks_refresh_interval_secs),
            session_expired_status_code: self.session_expired_status_code,
            invalid_claim_status_code: self.invalid_claim_status_code,
        })
    }
}

fn parse_var<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
) -> Result<Option<T>> {
    lookup(key)
        .map(|raw| {
            raw.trim()
                .parse::<T>()
                .map_err(|_| SessionError::config(format!("{key} has an invalid value: {raw}")))
        })
        .transpose()
}

/// Fully resolved configuration used at runtime
#[derive(Debug, Clone)]
pub struct NormalisedConfig {
    /// Display name of the app
    pub app_name: String,
    /// API origin
    pub api_domain: Url,
    /// Website origin
    pub website_domain: Url,
    /// SDK route prefix, without trailing slash (may be empty)
    pub api_base_path: String,
    /// Cookie path of the refresh token
    pub refresh_token_path: String,
    /// Normalised cookie domain
    pub cookie_domain: Option<String>,
    /// `Secure` cookie attribute
    pub cookie_secure: bool,
    /// `SameSite` cookie attribute
    pub cookie_same_site: CookieSameSite,
    /// Anti-CSRF mode
    pub anti_csrf: AntiCsrfMode,
    /// Allowed token transfer method
    pub token_transfer_method: TokenTransferMethod,
    /// Dynamic vs static signing keys
    pub use_dynamic_access_token_signing_key: bool,
    /// Local verification fast path toggle
    pub local_verification: bool,
    /// Core-side access token blacklisting
    pub access_token_blacklisting: bool,
    /// Signing key freshness window
    pub jwks_refresh_interval: Duration,
    /// Status for session-expired style responses
    pub session_expired_status_code: u16,
    /// Status for invalid claim responses
    pub invalid_claim_status_code: u16,
}

impl NormalisedConfig {
    /// True when the API is served from localhost or a bare IP address
    pub fn api_is_local(&self) -> bool {
        self.api_domain
            .host_str()
            .is_some_and(|host| host == "localhost" || is_ip_address(host))
    }

    /// True when the website is served from localhost or a bare IP address
    pub fn website_is_local(&self) -> bool {
        self.website_domain
            .host_str()
            .is_some_and(|host| host == "localhost" || is_ip_address(host))
    }

    /// Issuer advertised in the OpenID discovery document
    pub fn issuer(&self) -> String {
        format!(
            "{}{}",
            self.api_domain.as_str().trim_end_matches('/'),
            self.api_base_path
        )
    }
}

/// Normalise a cookie domain ("session scope")
///
/// Scheme, port, path, query and fragment are stripped and the host is
/// lowercased. A leading `.` in the input is kept, except for `localhost` and
/// IP addresses which can never carry one.
///
/// # Errors
///
/// Returns a configuration error when no host can be parsed from the input.
pub fn normalise_session_scope(scope: &str) -> Result<String> {
    let trimmed = scope.trim().to_lowercase();
    let had_leading_dot = trimmed.starts_with('.');
    let host = parse_host(trimmed.trim_start_matches('.'))
        .ok_or_else(|| SessionError::config("Please provide a valid sessionScope"))?;
    let host = host.trim_start_matches('.').to_string();

    if host == "localhost" || is_ip_address(&host) {
        return Ok(host);
    }
    if had_leading_dot {
        return Ok(format!(".{host}"));
    }
    Ok(host)
}

/// Normalise a route prefix: leading slash, no trailing slash, `/` becomes empty
pub fn normalise_base_path(path: &str) -> String {
    let trimmed = path.trim().trim_end_matches('/');
    if trimmed.is_empty() {
        return String::new();
    }
    if trimmed.starts_with('/') {
        trimmed.to_string()
    } else {
        format!("/{trimmed}")
    }
}

fn normalise_domain(domain: &str) -> Result<Url> {
    let trimmed = domain.trim().to_lowercase();
    let with_scheme = if trimmed.starts_with("http://") || trimmed.starts_with("https://") {
        trimmed
    } else {
        format!("http://{trimmed}")
    };
    let mut url = Url::parse(&with_scheme)
        .map_err(|e| SessionError::config(format!("invalid domain '{domain}': {e}")))?;
    if url.host_str().is_none() {
        return Err(SessionError::config(format!("invalid domain '{domain}'")));
    }
    url.set_path("");
    url.set_query(None);
    url.set_fragment(None);
    Ok(url)
}

fn parse_host(input: &str) -> Option<String> {
    let with_scheme = if input.starts_with("http://") || input.starts_with("https://") {
        input.to_string()
    } else {
        format!("http://{input}")
    };
    let url = Url::parse(&with_scheme).ok()?;
    let host = url.host_str()?;
    if host.is_empty() {
        return None;
    }
    Some(host.trim_start_matches('[').trim_end_matches(']').to_string())
}

fn is_ip_address(host: &str) -> bool {
    host.trim_start_matches('[')
        .trim_end_matches(']')
        .parse::<IpAddr>()
        .is_ok()
}

fn top_level_domain(url: &Url) -> String {
    let host = url.host_str().unwrap_or_default();
    if host == "localhost" || is_ip_address(host) {
        return host.to_string();
    }
    let labels: Vec<&str> = host.split('.').collect();
    if labels.len() <= 2 {
        return host.to_string();
    }
    labels[labels.len() - 2..].join(".")
}

fn default_same_site(api_domain: &Url, website_domain: &Url) -> CookieSameSite {
    if api_domain.scheme() != website_domain.scheme()
        || top_level_domain(api_domain) != top_level_domain(website_domain)
    {
        CookieSameSite::None
    } else {
        CookieSameSite::Lax
    }
}

impl FromStr for TokenTransferMethod {
    type Err = SessionError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "cookie" => Ok(Self::Cookie),
            "header" => Ok(Self::Header),
            "any" => Ok(Self::Any),
            other => Err(SessionError::config(format!(
                "unknown token transfer method '{other}'"
            ))),
        }
    }
}

impl fmt::Display for TokenTransferMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Cookie => "cookie",
            Self::Header => "header",
            Self::Any => "any",
        })
    }
}

impl FromStr for AntiCsrfMode {
    type Err = SessionError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_uppercase().as_str() {
            "VIA_TOKEN" => Ok(Self::ViaToken),
            "VIA_CUSTOM_HEADER" => Ok(Self::ViaCustomHeader),
            "NONE" => Ok(Self::None),
            other => Err(SessionError::config(format!("unknown anti-csrf mode '{other}'"))),
        }
    }
}

impl FromStr for CookieSameSite {
    type Err = SessionError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "strict" => Ok(Self::Strict),
            "lax" => Ok(Self::Lax),
            "none" => Ok(Self::None),
            other => Err(SessionError::config(format!("unknown SameSite value '{other}'"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_normalise_session_scope() {
        let cases = [
            ("api.example.com", "api.example.com"),
            ("http://api.example.com", "api.example.com"),
            ("https://api.example.com", "api.example.com"),
            ("http://api.example.com?hello=1", "api.example.com"),
            ("http://api.example.com/hello", "api.example.com"),
            ("http://api.example.com/", "api.example.com"),
            ("http://api.example.com:8080", "api.example.com"),
            ("http://api.example.com#random2", "api.example.com"),
            ("api.example.com/", "api.example.com"),
            ("api.example.com#random", "api.example.com"),
            ("api.example.com/?hello=1&bye=2", "api.example.com"),
            ("  API.Example.com  ", "api.example.com"),
            (".example.com", ".example.com"),
            (".api.example.com", ".api.example.com"),
            ("https://sub.api.example.com", "sub.api.example.com"),
            ("localhost", "localhost"),
            ("localhost:8080", "localhost"),
            ("localhost.org", "localhost.org"),
            (".localhost", "localhost"),
            ("127.0.0.1", "127.0.0.1"),
            ("http://127.0.0.1:3000/path", "127.0.0.1"),
        ];

        for (input, expected) in cases {
            assert_eq!(
                normalise_session_scope(input).unwrap(),
                expected,
                "input: {input}"
            );
        }
    }

    #[test]
    fn test_normalise_session_scope_rejects_empty() {
        assert!(normalise_session_scope("").is_err());
        assert!(normalise_session_scope("http://").is_err());
    }

    #[test]
    fn test_normalise_base_path() {
        assert_eq!(normalise_base_path("/auth"), "/auth");
        assert_eq!(normalise_base_path("auth/"), "/auth");
        assert_eq!(normalise_base_path("/"), "");
        assert_eq!(normalise_base_path(""), "");
        assert_eq!(normalise_base_path("/custom/path/"), "/custom/path");
    }

    #[test]
    fn test_same_site_defaults() {
        let config = SessionConfig::new(
            "http://localhost:3567",
            "https://api.example.com",
            "https://example.com",
        );
        let normalised = config.normalise().unwrap();
        assert_eq!(normalised.cookie_same_site, CookieSameSite::Lax);
        assert!(normalised.cookie_secure);
        assert_eq!(normalised.anti_csrf, AntiCsrfMode::None);
        assert_eq!(normalised.refresh_token_path, "/auth/session/refresh");

        let config = SessionConfig::new(
            "http://localhost:3567",
            "https://api.other.com",
            "https://example.com",
        );
        let normalised = config.normalise().unwrap();
        assert_eq!(normalised.cookie_same_site, CookieSameSite::None);
        assert_eq!(normalised.anti_csrf, AntiCsrfMode::ViaCustomHeader);
    }

    #[test]
    fn test_explicit_settings_win() {
        let config = SessionConfig::new("http://core", "http://localhost:3001", "http://localhost:3000")
            .with_cookie_same_site(CookieSameSite::Strict)
            .with_cookie_secure(true)
            .with_anti_csrf(AntiCsrfMode::ViaToken)
            .with_cookie_domain(".Example.com")
            .with_api_base_path("/");
        let normalised = config.normalise().unwrap();
        assert_eq!(normalised.cookie_same_site, CookieSameSite::Strict);
        assert!(normalised.cookie_secure);
        assert_eq!(normalised.anti_csrf, AntiCsrfMode::ViaToken);
        assert_eq!(normalised.cookie_domain.as_deref(), Some(".example.com"));
        assert_eq!(normalised.refresh_token_path, "/session/refresh");
        assert!(normalised.api_is_local());
    }

    #[test]
    fn test_from_lookup() {
        let vars: HashMap<&str, &str> = [
            ("SUPERTOKENS_CONNECTION_URI", "http://localhost:3567"),
            ("SUPERTOKENS_API_DOMAIN", "http://localhost:3001"),
            ("SUPERTOKENS_WEBSITE_DOMAIN", "http://localhost:3000"),
            ("SUPERTOKENS_API_KEY", "secret"),
            ("SUPERTOKENS_TOKEN_TRANSFER_METHOD", "header"),
            ("SUPERTOKENS_USE_DYNAMIC_SIGNING_KEY", "false"),
            ("SUPERTOKENS_ANTI_CSRF", "via_token"),
        ]
        .into_iter()
        .collect();

        let config = SessionConfig::from_lookup(|k| vars.get(k).map(ToString::to_string)).unwrap();
        assert_eq!(config.token_transfer_method, TokenTransferMethod::Header);
        assert!(!config.use_dynamic_access_token_signing_key);
        assert_eq!(config.anti_csrf, Some(AntiCsrfMode::ViaToken));
        assert_eq!(
            config.api_key.as_ref().map(|k| k.expose_secret().as_str()),
            Some("secret")
        );
    }

    #[test]
    fn test_from_lookup_missing_required() {
        let err = SessionConfig::from_lookup(|_| None).unwrap_err();
        assert!(err.to_string().contains("SUPERTOKENS_CONNECTION_URI"));
    }

    #[test]
    fn test_from_lookup_invalid_value() {
        let err = SessionConfig::from_lookup(|k| match k {
            "SUPERTOKENS_CONNECTION_URI" => Some("http://core".into()),
            "SUPERTOKENS_API_DOMAIN" => Some("http://api".into()),
            "SUPERTOKENS_WEBSITE_DOMAIN" => Some("http://web".into()),
            "SUPERTOKENS_COOKIE_SECURE" => Some("maybe".into()),
            _ => None,
        })
        .unwrap_err();
        assert!(err.to_string().contains("SUPERTOKENS_COOKIE_SECURE"));
    }

    #[test]
    fn test_debug_redacts_api_key() {
        let config = SessionConfig::new("http://core", "http://api", "http://web").with_api_key("hunter2");
        let debug = format!("{config:?}");
        assert!(!debug.contains("hunter2"));
        assert!(debug.contains("REDACTED"));
    }

    #[test]
    fn test_deserialize_with_defaults() {
        let config: SessionConfig = serde_json::from_value(serde_json::json!({
            "connectionUri": "http://localhost:3567",
            "appInfo": {
                "apiDomain": "http://localhost:3001",
                "websiteDomain": "http://localhost:3000"
            }
        }))
        .unwrap();
        assert_eq!(config.app_info.api_base_path, "/auth");
        assert!(config.use_dynamic_access_token_signing_key);
        assert!(config.local_verification);
        assert_eq!(config.max_retries, 5);
    }
}
