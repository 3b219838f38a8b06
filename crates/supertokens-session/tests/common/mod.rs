//! Common test utilities for integration tests
//!
//! A `wiremock` server stands in for the SuperTokens core. Tokens are signed
//! with the fixed RSA keys under `tests/fixtures`, so the engine verifies them
//! exactly as it verifies tokens minted by a real core.

#![allow(dead_code)]

use std::time::{SystemTime, UNIX_EPOCH};

use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use jsonwebtoken::{Algorithm, EncodingKey};
use serde_json::{Value, json};
use supertokens_session::SessionConfig;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const PUBLIC_KEYS: &str = include_str!("../fixtures/public_keys.json");

/// Legacy (version 2) access token header, as the core stamped it
pub const LEGACY_HEADER: &str = "eyJhbGciOiJSUzI1NiIsInR5cCI6IkpXVCIsInZlcnNpb24iOiIyIn0=";

/// A signing key with its public JWK
pub struct TestKey {
    pub kid: String,
    encoding: EncodingKey,
    jwk: Value,
}

impl TestKey {
    /// Load fixture key `name` (`a`, `b` or `c`) under the given key id
    pub fn load(name: &str, kid: &str) -> Self {
        let pem = match name {
            "a" => include_bytes!("../fixtures/key_a.pem").as_slice(),
            "b" => include_bytes!("../fixtures/key_b.pem").as_slice(),
            "c" => include_bytes!("../fixtures/key_c.pem").as_slice(),
            other => panic!("no fixture key named {other}"),
        };
        let keys: Value = serde_json::from_str(PUBLIC_KEYS).expect("fixture JWKs");
        let mut jwk = keys[name].clone();
        jwk["kid"] = json!(kid);

        Self {
            kid: kid.to_string(),
            encoding: EncodingKey::from_rsa_pem(pem).expect("fixture PEM"),
            jwk,
        }
    }

    /// The public half as a JWK
    pub fn jwk(&self) -> Value {
        self.jwk.clone()
    }

    fn sign_input(&self, input: &str) -> String {
        let signature = jsonwebtoken::crypto::sign(input.as_bytes(), &self.encoding, Algorithm::RS256)
            .expect("RS256 signing");
        format!("{input}.{signature}")
    }

    /// Version 4 access token
    pub fn sign(&self, claims: &Value) -> String {
        self.sign_versioned(claims, "4")
    }

    /// Version 3+ access token with an explicit header version
    pub fn sign_versioned(&self, claims: &Value, version: &str) -> String {
        let header = json!({"alg": "RS256", "typ": "JWT", "version": version, "kid": self.kid});
        let input = format!("{}.{}", segment(&header), segment(claims));
        self.sign_input(&input)
    }

    /// Version 2 access token with the fixed legacy header
    pub fn sign_legacy(&self, claims: &Value) -> String {
        let input = format!("{LEGACY_HEADER}.{}", segment(claims));
        self.sign_input(&input)
    }
}

fn segment(value: &Value) -> String {
    URL_SAFE_NO_PAD.encode(serde_json::to_vec(value).expect("json"))
}

pub fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("clock")
        .as_secs()
}

pub fn now_ms() -> u64 {
    now_secs() * 1000
}

/// Claims of a valid version 4 access token
pub fn access_claims(user_id: &str, session_handle: &str) -> Value {
    let now = now_secs();
    json!({
        "sub": user_id,
        "iat": now,
        "exp": now + 3600,
        "sessionHandle": session_handle,
        "refreshTokenHash1": format!("rt-hash-{session_handle}"),
        "tId": "public",
        "antiCsrfToken": null,
    })
}

/// Core body for session creation and refresh
pub fn session_body(
    session_handle: &str,
    user_id: &str,
    access_token: &str,
    refresh_token: &str,
) -> Value {
    let now = now_ms();
    json!({
        "status": "OK",
        "session": {
            "handle": session_handle,
            "userId": user_id,
            "tenantId": "public",
            "userDataInJWT": {},
        },
        "accessToken": {"token": access_token, "expiry": now + 3_600_000, "createdTime": now},
        "refreshToken": {"token": refresh_token, "expiry": now + 8_640_000_000, "createdTime": now},
    })
}

/// Mock SuperTokens core
pub struct MockCore {
    pub server: MockServer,
}

impl MockCore {
    /// Start a core that speaks CDI 5.0
    pub async fn start() -> Self {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/apiversion"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"versions": ["5.0"]})))
            .mount(&server)
            .await;
        Self { server }
    }

    pub fn uri(&self) -> String {
        self.server.uri()
    }

    /// Serve these keys from the JWKS endpoint
    pub async fn mount_jwks(&self, keys: &[&TestKey]) {
        let keys: Vec<Value> = keys.iter().map(|key| key.jwk()).collect();
        Mock::given(method("GET"))
            .and(path("/recipe/jwt/jwks.json"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "keys": keys })))
            .mount(&self.server)
            .await;
    }

    /// Answer `method path` with a JSON body
    pub async fn mount_json(&self, http_method: &str, route: &str, body: Value) {
        Mock::given(method(http_method))
            .and(path(route))
            .respond_with(ResponseTemplate::new(200).set_body_json(body))
            .mount(&self.server)
            .await;
    }

    /// Requests the core received on `route`
    pub async fn requests_to(&self, route: &str) -> Vec<wiremock::Request> {
        self.server
            .received_requests()
            .await
            .unwrap_or_default()
            .into_iter()
            .filter(|request| request.url.path() == route)
            .collect()
    }
}

/// Configuration for a same-site local deployment in front of `core`
pub fn test_config(core: &MockCore) -> SessionConfig {
    SessionConfig::new(core.uri(), "http://localhost:3001", "http://localhost:3000")
}
