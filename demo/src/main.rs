//! Demo API server backed by a SuperTokens core
//!
//! ```text
//! cargo run -p supertokens-session-demo -- --core http://localhost:3567
//!
//! curl -i -X POST localhost:3001/login -H 'content-type: application/json' -d '{"userId":"alice"}'
//! curl -i localhost:3001/me -H 'authorization: Bearer <st-access-token>'
//! curl -i -X POST localhost:3001/auth/session/refresh -H 'authorization: Bearer <st-refresh-token>'
//! ```

use std::net::SocketAddr;

use anyhow::Context;
use axum::extract::State;
use axum::http::{HeaderMap, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use clap::Parser;
use serde::Deserialize;
use serde_json::{Map, Value, json};
use supertokens_session::tower::VerifySessionLayer;
use supertokens_session::{
    PendingResponse, SessionConfig, SessionContainer, SessionEngine, SessionRequest, api,
};
use tracing::info;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, fmt};

#[derive(Parser, Debug)]
#[command(name = "supertokens-session-demo", version, about = "Session-protected demo API")]
struct Args {
    /// SuperTokens core URI; separate several hosts with `;`
    #[arg(long, env = "SUPERTOKENS_CONNECTION_URI", default_value = "http://localhost:3567")]
    core: String,

    /// Core API key
    #[arg(long, env = "SUPERTOKENS_API_KEY", hide_env_values = true)]
    api_key: Option<String>,

    /// Public origin of this API
    #[arg(long, env = "SUPERTOKENS_API_DOMAIN", default_value = "http://localhost:3001")]
    api_domain: String,

    /// Origin of the website calling this API
    #[arg(long, env = "SUPERTOKENS_WEBSITE_DOMAIN", default_value = "http://localhost:3000")]
    website_domain: String,

    /// Address to listen on
    #[arg(long, default_value = "127.0.0.1:3001")]
    listen: SocketAddr,

    /// Emit JSON logs
    #[arg(long)]
    json_logs: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LoginRequest {
    user_id: String,
    #[serde(default = "default_tenant")]
    tenant_id: String,
    #[serde(default)]
    payload: Map<String, Value>,
}

fn default_tenant() -> String {
    "public".to_string()
}

fn init_logging(json_logs: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,supertokens_session=debug"));
    let subscriber = tracing_subscriber::registry().with(filter);
    if json_logs {
        subscriber.with(fmt::layer().json()).init();
    } else {
        subscriber.with(fmt::layer()).init();
    }
}

async fn login(
    State(engine): State<SessionEngine>,
    method: Method,
    headers: HeaderMap,
    Json(body): Json<LoginRequest>,
) -> Response {
    let pending = PendingResponse::new();
    let created = engine
        .create_new_session(
            &SessionRequest::new(&method, &headers),
            &pending,
            &body.tenant_id,
            &body.user_id,
            body.payload,
            Value::Null,
        )
        .await;

    match created {
        Ok(session) => api::respond(
            &pending,
            Json(json!({ "status": "OK", "sessionHandle": session.get_handle() })),
        ),
        Err(e) => engine.handle_error(e, &pending).await,
    }
}

async fn me(session: SessionContainer) -> Json<Value> {
    Json(json!({
        "userId": session.get_user_id(),
        "tenantId": session.get_tenant_id(),
        "sessionHandle": session.get_handle(),
        "accessTokenPayload": session.get_access_token_payload(),
    }))
}

/// Mark the session as visited; the regenerated token reaches the client through the middleware
async fn visit(session: SessionContainer) -> Response {
    let mut update = Map::new();
    update.insert("visited".to_string(), json!(true));
    match session.merge_into_access_token_payload(&update).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "message": e.to_string() })),
        )
            .into_response(),
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
    }
    info!("Shutting down");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_logging(args.json_logs);

    let mut config = SessionConfig::new(&args.core, &args.api_domain, &args.website_domain);
    if let Some(key) = &args.api_key {
        config = config.with_api_key(key);
    }
    let engine = SessionEngine::new(config).context("invalid session configuration")?;

    let protected = Router::new()
        .route("/me", get(me))
        .route("/me/visit", post(visit))
        .layer(VerifySessionLayer::new(engine.clone()));

    let app = Router::new()
        .route("/login", post(login))
        .with_state(engine.clone())
        .merge(protected)
        .merge(api::router(engine));

    let listener = tokio::net::TcpListener::bind(args.listen)
        .await
        .with_context(|| format!("failed to bind {}", args.listen))?;
    info!(address = %args.listen, "Demo API listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;
    Ok(())
}
