//! Access token verification against a mock core
//!
//! Covers the local fast path, the fallbacks to core verification, signing
//! key mode checks, anti-CSRF policies and legacy (version 2) tokens.

mod common;

use common::{MockCore, TestKey, access_claims, now_ms, session_body, test_config};
use http::{HeaderMap, Method, header::AUTHORIZATION};
use pretty_assertions::assert_eq;
use serde_json::json;
use supertokens_session::{
    AntiCsrfMode, PendingResponse, SessionContainer, SessionEngine, SessionError, SessionRequest,
    TransferMethod, VerifySessionOptions,
};

const VERIFY_PATH: &str = "/recipe/session/verify";
const REFRESH_PATH: &str = "/recipe/session/refresh";

fn bearer(token: &str) -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(AUTHORIZATION, format!("Bearer {token}").parse().unwrap());
    headers
}

fn with_cookie(mut headers: HeaderMap, cookie: &str) -> HeaderMap {
    headers.insert(http::header::COOKIE, cookie.parse().unwrap());
    headers
}

fn with_header(mut headers: HeaderMap, name: &'static str, value: &str) -> HeaderMap {
    headers.insert(name, value.parse().unwrap());
    headers
}

async fn verify_request(
    engine: &SessionEngine,
    method: Method,
    headers: &HeaderMap,
) -> Result<Option<SessionContainer>, SessionError> {
    let request = SessionRequest::new(&method, headers);
    engine
        .get_session(&request, &PendingResponse::new(), &VerifySessionOptions::default())
        .await
}

async fn verify(
    engine: &SessionEngine,
    token: &str,
) -> (Result<Option<SessionContainer>, SessionError>, PendingResponse) {
    let headers = bearer(token);
    let request = SessionRequest::new(&Method::GET, &headers);
    let response = PendingResponse::new();
    let result = engine
        .get_session(&request, &response, &VerifySessionOptions::default())
        .await;
    (result, response)
}

#[tokio::test]
async fn test_valid_token_is_verified_locally() {
    let core = MockCore::start().await;
    let key = TestKey::load("a", "d-1");
    core.mount_jwks(&[&key]).await;
    let engine = SessionEngine::new(test_config(&core)).unwrap();

    let mut claims = access_claims("user-1", "handle-1");
    claims["role"] = json!("admin");
    let token = key.sign(&claims);

    let (result, response) = verify(&engine, &token).await;
    let session = result.unwrap().expect("session");

    assert_eq!(session.get_handle(), "handle-1");
    assert_eq!(session.get_user_id(), "user-1");
    assert_eq!(session.get_tenant_id(), "public");
    assert_eq!(session.get_access_token(), token);
    assert_eq!(session.get_access_token_payload().get("role"), Some(&json!("admin")));
    assert!(response.is_empty());
    assert!(core.requests_to(VERIFY_PATH).await.is_empty());
}

#[tokio::test]
async fn test_signing_key_mode_mismatch() {
    let core = MockCore::start().await;
    let key = TestKey::load("a", "d-1");
    core.mount_jwks(&[&key]).await;
    let engine =
        SessionEngine::new(test_config(&core).with_dynamic_signing_key(false)).unwrap();

    let token = key.sign(&access_claims("user-1", "handle-1"));
    let err = verify(&engine, &token).await.0.unwrap_err();

    assert!(err.is_try_refresh());
    assert_eq!(
        err.to_string(),
        "The access token doesn't match the useDynamicAccessTokenSigningKey setting"
    );
}

#[tokio::test]
async fn test_wrong_signature_asks_for_refresh() {
    let core = MockCore::start().await;
    let published = TestKey::load("a", "d-1");
    let forged = TestKey::load("b", "d-1");
    core.mount_jwks(&[&published]).await;
    let engine = SessionEngine::new(test_config(&core)).unwrap();

    let token = forged.sign(&access_claims("user-1", "handle-1"));
    let err = verify(&engine, &token).await.0.unwrap_err();

    assert!(err.is_try_refresh());
    assert!(core.requests_to(VERIFY_PATH).await.is_empty());
}

#[tokio::test]
async fn test_expired_token_asks_for_refresh() {
    let core = MockCore::start().await;
    let key = TestKey::load("a", "d-1");
    core.mount_jwks(&[&key]).await;
    let engine = SessionEngine::new(test_config(&core)).unwrap();

    let mut claims = access_claims("user-1", "handle-1");
    claims["exp"] = json!(common::now_secs() - 10);
    let err = verify(&engine, &key.sign(&claims)).await.0.unwrap_err();

    assert!(err.is_try_refresh());
    assert_eq!(err.to_string(), "Access token expired");
}

#[tokio::test]
async fn test_disabled_local_verification_asks_core() {
    let core = MockCore::start().await;
    let key = TestKey::load("a", "d-1");
    core.mount_jwks(&[&key]).await;
    core.mount_json(
        "POST",
        VERIFY_PATH,
        json!({
            "status": "OK",
            "session": {"handle": "handle-1", "userId": "user-1", "tenantId": "public"}
        }),
    )
    .await;
    let engine =
        SessionEngine::new(test_config(&core).with_local_verification(false)).unwrap();

    let token = key.sign(&access_claims("user-1", "handle-1"));
    let (result, response) = verify(&engine, &token).await;

    assert_eq!(result.unwrap().expect("session").get_handle(), "handle-1");
    assert!(response.is_empty());

    let requests = core.requests_to(VERIFY_PATH).await;
    assert_eq!(requests.len(), 1);
    let body: serde_json::Value = serde_json::from_slice(&requests[0].body).unwrap();
    assert_eq!(body["accessToken"], json!(token));
    assert_eq!(body["doAntiCsrfCheck"], json!(false));
    assert_eq!(requests[0].headers.get("rid").unwrap(), "session");
    assert_eq!(requests[0].headers.get("cdi-version").unwrap(), "5.0");
}

#[tokio::test]
async fn test_unconfirmed_rotation_reaches_core_and_reattaches_new_token() {
    let core = MockCore::start().await;
    let key = TestKey::load("a", "d-1");
    core.mount_jwks(&[&key]).await;

    let mut old_claims = access_claims("user-1", "handle-1");
    old_claims["parentRefreshTokenHash1"] = json!("parent-hash");
    let old_token = key.sign(&old_claims);
    let new_token = key.sign(&access_claims("user-1", "handle-1"));

    let now = now_ms();
    core.mount_json(
        "POST",
        VERIFY_PATH,
        json!({
            "status": "OK",
            "session": {"handle": "handle-1", "userId": "user-1", "tenantId": "public"},
            "accessToken": {"token": new_token, "expiry": now + 3_600_000, "createdTime": now}
        }),
    )
    .await;
    let engine = SessionEngine::new(test_config(&core)).unwrap();

    let (result, response) = verify(&engine, &old_token).await;
    let session = result.unwrap().expect("session");

    assert_eq!(session.get_access_token(), new_token);
    assert_eq!(response.header("st-access-token"), Some(new_token));
    assert!(response.header("front-token").is_some());
}

#[tokio::test]
async fn test_core_unauthorised_clears_tokens() {
    let core = MockCore::start().await;
    let key = TestKey::load("a", "d-1");
    core.mount_jwks(&[&key]).await;
    core.mount_json(
        "POST",
        VERIFY_PATH,
        json!({"status": "UNAUTHORISED", "message": "Session has been revoked"}),
    )
    .await;
    let engine = SessionEngine::new(
        test_config(&core).with_access_token_blacklisting(true),
    )
    .unwrap();

    let token = key.sign(&access_claims("user-1", "handle-1"));
    let err = verify(&engine, &token).await.0.unwrap_err();

    assert!(err.is_unauthorised());
    assert!(err.should_clear_tokens());
    assert_eq!(err.to_string(), "Session has been revoked");
}

#[tokio::test]
async fn test_core_try_refresh_status() {
    let core = MockCore::start().await;
    let key = TestKey::load("a", "d-1");
    core.mount_jwks(&[&key]).await;
    core.mount_json(
        "POST",
        VERIFY_PATH,
        json!({"status": "TRY_REFRESH_TOKEN", "message": "stale"}),
    )
    .await;
    let engine = SessionEngine::new(test_config(&core)).unwrap();

    let headers = bearer(&key.sign(&access_claims("user-1", "handle-1")));
    let request = SessionRequest::new(&Method::GET, &headers);
    let err = engine
        .get_session(
            &request,
            &PendingResponse::new(),
            &VerifySessionOptions::default().with_check_database(true),
        )
        .await
        .unwrap_err();

    assert!(err.is_try_refresh());
}

#[tokio::test]
async fn test_legacy_token_verified_against_published_keys() {
    let core = MockCore::start().await;
    let key = TestKey::load("a", "s-legacy");
    core.mount_jwks(&[&key]).await;
    let engine = SessionEngine::new(test_config(&core)).unwrap();

    let now = now_ms();
    let token = key.sign_legacy(&json!({
        "sessionHandle": "legacy-handle",
        "userId": "user-1",
        "refreshTokenHash1": "rt",
        "userData": {"plan": "pro"},
        "expiryTime": now + 3_600_000,
        "timeCreated": now - 120_000,
    }));

    let session = verify(&engine, &token).await.0.unwrap().expect("session");
    assert_eq!(session.get_handle(), "legacy-handle");
    assert_eq!(session.get_access_token_payload().get("plan"), Some(&json!("pro")));
}

#[tokio::test]
async fn test_legacy_refresh_yields_v4_token() {
    let core = MockCore::start().await;
    let legacy_key = TestKey::load("a", "s-legacy");
    let dynamic_key = TestKey::load("b", "d-2");
    core.mount_jwks(&[&legacy_key, &dynamic_key]).await;

    let new_token = dynamic_key.sign(&access_claims("user-1", "legacy-handle"));
    core.mount_json(
        "POST",
        "/recipe/session/refresh",
        session_body("legacy-handle", "user-1", &new_token, "rt-2"),
    )
    .await;
    let engine = SessionEngine::new(test_config(&core)).unwrap();

    let mut headers = HeaderMap::new();
    headers.insert(
        http::header::COOKIE,
        "sRefreshToken=rt-1; sIdRefreshToken=legacy".parse().unwrap(),
    );
    let request = SessionRequest::new(&Method::POST, &headers);
    let response = PendingResponse::new();
    let session = engine.refresh_session(&request, &response).await.unwrap();

    let parsed = supertokens_session::jwt::parse_without_verification(&session.get_access_token())
        .unwrap();
    assert_eq!(parsed.version, 4);
    assert!(parsed.kid.unwrap().starts_with("d-"));

    let cookies = response.cookies();
    assert!(cookies.iter().any(|c| c.starts_with("sAccessToken=")));
    assert!(cookies.iter().any(|c| c.starts_with("sRefreshToken=rt-2")));
    assert!(cookies.iter().any(|c| c.starts_with("sIdRefreshToken=;")));
}

#[tokio::test]
async fn test_malformed_header_token_falls_back_to_cookie() {
    let core = MockCore::start().await;
    let key = TestKey::load("a", "d-1");
    core.mount_jwks(&[&key]).await;
    let engine = SessionEngine::new(test_config(&core)).unwrap();

    let mut broken = access_claims("user-1", "handle-0");
    broken.as_object_mut().unwrap().remove("sessionHandle");
    let header_token = key.sign(&broken);
    let cookie_token = key.sign(&access_claims("user-1", "handle-1"));

    let headers = with_cookie(bearer(&header_token), &format!("sAccessToken={cookie_token}"));
    let session = verify_request(&engine, Method::GET, &headers)
        .await
        .unwrap()
        .expect("session from cookie");

    assert_eq!(session.get_handle(), "handle-1");
    assert_eq!(session.transfer_method(), TransferMethod::Cookie);
}

#[tokio::test]
async fn test_malformed_token_alone_counts_as_no_session() {
    let core = MockCore::start().await;
    let key = TestKey::load("a", "d-1");
    core.mount_jwks(&[&key]).await;
    let engine = SessionEngine::new(test_config(&core)).unwrap();

    let mut broken = access_claims("user-1", "handle-1");
    broken.as_object_mut().unwrap().remove("refreshTokenHash1");

    let err = verify(&engine, &key.sign(&broken)).await.0.unwrap_err();
    assert!(err.is_unauthorised());
    assert!(!err.should_clear_tokens());
}

fn csrf_token_session(key: &TestKey) -> String {
    let mut claims = access_claims("user-1", "handle-1");
    claims["antiCsrfToken"] = json!("csrf-1");
    format!("sAccessToken={}", key.sign(&claims))
}

#[tokio::test]
async fn test_via_token_anti_csrf_on_cookie_sessions() {
    let core = MockCore::start().await;
    let key = TestKey::load("a", "d-1");
    core.mount_jwks(&[&key]).await;
    let engine =
        SessionEngine::new(test_config(&core).with_anti_csrf(AntiCsrfMode::ViaToken)).unwrap();
    let cookie = csrf_token_session(&key);

    let missing = verify_request(&engine, Method::POST, &with_cookie(HeaderMap::new(), &cookie))
        .await
        .unwrap_err();
    assert!(missing.is_try_refresh());
    assert!(missing.to_string().starts_with("Provided antiCsrfToken is undefined"));

    let headers = with_header(with_cookie(HeaderMap::new(), &cookie), "anti-csrf", "wrong");
    let mismatch = verify_request(&engine, Method::POST, &headers)
        .await
        .unwrap_err();
    assert!(mismatch.is_try_refresh());
    assert_eq!(mismatch.to_string(), "anti-csrf check failed");

    let headers = with_header(with_cookie(HeaderMap::new(), &cookie), "anti-csrf", "csrf-1");
    let session = verify_request(&engine, Method::POST, &headers)
        .await
        .unwrap()
        .expect("session");
    assert_eq!(session.get_handle(), "handle-1");
    assert!(core.requests_to(VERIFY_PATH).await.is_empty());
}

#[tokio::test]
async fn test_anti_csrf_skipped_for_get_and_header_transport() {
    let core = MockCore::start().await;
    let key = TestKey::load("a", "d-1");
    core.mount_jwks(&[&key]).await;
    let engine =
        SessionEngine::new(test_config(&core).with_anti_csrf(AntiCsrfMode::ViaToken)).unwrap();

    let cookie = csrf_token_session(&key);
    let get = verify_request(&engine, Method::GET, &with_cookie(HeaderMap::new(), &cookie))
        .await
        .unwrap();
    assert!(get.is_some());

    let mut claims = access_claims("user-1", "handle-1");
    claims["antiCsrfToken"] = json!("csrf-1");
    let post = verify_request(&engine, Method::POST, &bearer(&key.sign(&claims)))
        .await
        .unwrap()
        .expect("session");
    assert_eq!(post.transfer_method(), TransferMethod::Header);
}

#[tokio::test]
async fn test_custom_header_anti_csrf_requires_rid() {
    let core = MockCore::start().await;
    let key = TestKey::load("a", "d-1");
    core.mount_jwks(&[&key]).await;
    let engine = SessionEngine::new(
        test_config(&core).with_anti_csrf(AntiCsrfMode::ViaCustomHeader),
    )
    .unwrap();
    let cookie = format!(
        "sAccessToken={}",
        key.sign(&access_claims("user-1", "handle-1"))
    );

    let err = verify_request(&engine, Method::POST, &with_cookie(HeaderMap::new(), &cookie))
        .await
        .unwrap_err();
    assert!(err.is_try_refresh());
    assert!(err.to_string().starts_with("anti-csrf check failed"));

    let headers = with_header(with_cookie(HeaderMap::new(), &cookie), "rid", "session");
    let session = verify_request(&engine, Method::POST, &headers)
        .await
        .unwrap()
        .expect("session");
    assert_eq!(session.get_handle(), "handle-1");
}

#[tokio::test]
async fn test_custom_header_anti_csrf_blocks_refresh_without_rid() {
    let core = MockCore::start().await;
    let engine = SessionEngine::new(
        test_config(&core).with_anti_csrf(AntiCsrfMode::ViaCustomHeader),
    )
    .unwrap();

    let headers = with_cookie(HeaderMap::new(), "sRefreshToken=rt-1");
    let request = SessionRequest::new(&Method::POST, &headers);
    let err = engine
        .refresh_session(&request, &PendingResponse::new())
        .await
        .unwrap_err();

    assert!(err.is_unauthorised());
    assert!(!err.should_clear_tokens());
    assert_eq!(
        err.to_string(),
        "anti-csrf check failed. Please pass 'rid: \"session\"' header in the request."
    );
    assert!(core.requests_to(REFRESH_PATH).await.is_empty());
}

#[tokio::test]
async fn test_static_signing_key_mode_reaches_core_and_verifies() {
    let core = MockCore::start().await;
    let static_key = TestKey::load("a", "s-1");
    core.mount_jwks(&[&static_key]).await;

    let new_token = static_key.sign(&access_claims("user-1", "legacy-handle"));
    core.mount_json(
        "POST",
        REFRESH_PATH,
        session_body("legacy-handle", "user-1", &new_token, "rt-2"),
    )
    .await;
    core.mount_json(
        "POST",
        "/recipe/session",
        session_body("handle-9", "user-1", &new_token, "rt-9"),
    )
    .await;
    let engine =
        SessionEngine::new(test_config(&core).with_dynamic_signing_key(false)).unwrap();

    let headers = with_cookie(HeaderMap::new(), "sRefreshToken=rt-1; sIdRefreshToken=legacy");
    let request = SessionRequest::new(&Method::POST, &headers);
    let session = engine
        .refresh_session(&request, &PendingResponse::new())
        .await
        .unwrap();

    let parsed =
        supertokens_session::jwt::parse_without_verification(&session.get_access_token())
            .unwrap();
    assert_eq!(parsed.version, 4);
    assert!(parsed.kid.unwrap().starts_with("s-"));

    let refresh = core.requests_to(REFRESH_PATH).await;
    let body: serde_json::Value = serde_json::from_slice(&refresh[0].body).unwrap();
    assert_eq!(body["useDynamicSigningKey"], json!(false));

    let verified = verify(&engine, &session.get_access_token())
        .await
        .0
        .unwrap()
        .expect("session");
    assert_eq!(verified.get_handle(), "legacy-handle");

    let no_headers = HeaderMap::new();
    engine
        .create_new_session(
            &SessionRequest::new(&Method::POST, &no_headers),
            &PendingResponse::new(),
            "public",
            "user-1",
            serde_json::Map::new(),
            serde_json::Value::Null,
        )
        .await
        .unwrap();
    let create = core.requests_to("/recipe/session").await;
    let body: serde_json::Value = serde_json::from_slice(&create[0].body).unwrap();
    assert_eq!(body["useDynamicSigningKey"], json!(false));
}
