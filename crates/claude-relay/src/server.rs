//! Actix Web HTTP server.
//!
//! Exposes Anthropic-compatible endpoints:
//! - `POST /v1/messages`
//! - `GET /health`

use crate::{
    config::ProxyConfig,
    delivery::{self, Orchestrator},
    error::ProxyError,
    openai::ChatCompletion,
    pool::{CredentialPool, PoolStats},
    streaming, translation,
    types::MessagesRequest,
};
use actix_cors::Cors;
use actix_web::{web, App, HttpRequest, HttpResponse, HttpServer};
use anyhow::{Context, Result};
use futures::StreamExt;
use serde::Serialize;
use std::sync::Arc;
use subtle::ConstantTimeEq;
use tracing::{debug, error, info};

/// Inbound request bodies above this size are rejected.
const MAX_BODY_BYTES: usize = 32 * 1024 * 1024;

#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Orchestrator,
    pub auth_token: Option<Arc<str>>,
}

impl AppState {
    pub fn new(orchestrator: Orchestrator, auth_token: Option<String>) -> Self {
        Self {
            orchestrator,
            auth_token: auth_token.map(Arc::from),
        }
    }

    /// Build the state (client, pool, orchestrator) described by `config`.
    pub fn from_config(config: &ProxyConfig) -> Result<Self> {
        let client = delivery::upstream_client(config.request_timeout())
            .context("failed to build reqwest client")?;
        let pool = Arc::new(
            CredentialPool::new(config.api_keys.iter().cloned())
                .context("failed to build credential pool")?,
        );
        let orchestrator = Orchestrator::new(client, pool, config.upstream_base_url.clone());
        Ok(Self::new(orchestrator, config.auth_token.clone()))
    }
}

pub async fn serve(config: ProxyConfig) -> Result<()> {
    let addr = config.bind_addr();
    let state = web::Data::new(AppState::from_config(&config)?);
    info!(
        addr = %addr,
        upstream = %config.upstream_base_url,
        credentials = config.api_keys.len(),
        auth = config.auth_token.is_some(),
        "claude-relay listening"
    );

    HttpServer::new(move || {
        App::new()
            .wrap(Cors::permissive())
            .configure(|cfg| configure(cfg, state.clone()))
    })
    .bind(&addr)
    .with_context(|| format!("failed to bind {}", addr))?
    .run()
    .await
    .context("server error")?;

    Ok(())
}

/// Register routes, shared state and the body size limit.
pub fn configure(cfg: &mut web::ServiceConfig, state: web::Data<AppState>) {
    cfg.app_data(state)
        .app_data(web::PayloadConfig::new(MAX_BODY_BYTES))
        .route("/health", web::get().to(health_check))
        .route("/v1/messages", web::post().to(handle_messages))
        .default_service(web::to(not_found));
}

async fn not_found() -> HttpResponse {
    HttpResponse::NotFound()
        .content_type("text/plain; charset=utf-8")
        .body("Not Found")
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    timestamp: String,
    credentials: PoolStats,
}

async fn health_check(state: web::Data<AppState>) -> HttpResponse {
    HttpResponse::Ok().json(HealthResponse {
        status: "ok",
        timestamp: chrono::Utc::now().to_rfc3339(),
        credentials: state.orchestrator.pool().stats(),
    })
}

/// Check the caller against the configured token, if any.
///
/// Accepts `Authorization: Bearer <token>` or `x-api-key: <token>`.
fn authorize(req: &HttpRequest, expected: Option<&str>) -> Result<(), ProxyError> {
    let Some(expected) = expected else {
        return Ok(());
    };

    let headers = req.headers();
    let bearer = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));
    let api_key = headers.get("x-api-key").and_then(|v| v.to_str().ok());

    match bearer.or(api_key) {
        Some(token) if token.as_bytes().ct_eq(expected.as_bytes()).into() => Ok(()),
        Some(_) => Err(ProxyError::Unauthorized("invalid authentication token")),
        None => Err(ProxyError::Unauthorized("missing authentication token")),
    }
}

async fn handle_messages(
    state: web::Data<AppState>,
    req_http: HttpRequest,
    body: web::Bytes,
) -> Result<HttpResponse, ProxyError> {
    // The gate runs before the body is even parsed.
    authorize(&req_http, state.auth_token.as_deref())?;

    let req: MessagesRequest = serde_json::from_slice(&body)
        .map_err(|e| ProxyError::InvalidRequest(format!("invalid request body: {}", e)))?;
    let outgoing = translation::convert_request(&req);
    debug!(
        original_model = %req.model,
        upstream_model = %outgoing.model,
        stream = outgoing.stream,
        messages = outgoing.messages.len(),
        "translated request"
    );

    let upstream = state.orchestrator.send(&outgoing).await?;

    if outgoing.stream {
        let frames = streaming::reframe(upstream.bytes_stream()).map(Ok::<_, actix_web::Error>);
        return Ok(HttpResponse::Ok()
            .content_type("text/event-stream")
            .insert_header(("cache-control", "no-cache"))
            .streaming(frames));
    }

    let completion: ChatCompletion = upstream.json().await.map_err(|e| {
        error!(error = %e, "failed to decode upstream response");
        ProxyError::UpstreamDecode(e.to_string())
    })?;

    let out = translation::convert_response(completion).map_err(|e| {
        error!(error = %e, "response translation error");
        ProxyError::from(e)
    })?;
    Ok(HttpResponse::Ok().json(out))
}

#[cfg(test)]
mod tests {
    use super::*;
    use actix_web::test::TestRequest;

    #[test]
    fn test_authorize_without_token_allows_everyone() {
        let req = TestRequest::default().to_http_request();
        assert!(authorize(&req, None).is_ok());
    }

    #[test]
    fn test_authorize_accepts_bearer_and_api_key() {
        let bearer = TestRequest::default()
            .insert_header(("authorization", "Bearer s3cret"))
            .to_http_request();
        assert!(authorize(&bearer, Some("s3cret")).is_ok());

        let api_key = TestRequest::default()
            .insert_header(("x-api-key", "s3cret"))
            .to_http_request();
        assert!(authorize(&api_key, Some("s3cret")).is_ok());
    }

    #[test]
    fn test_authorize_rejects_prefix_and_extension_of_token() {
        for presented in ["s3cre", "s3cret2", "", "S3CRET"] {
            let req = TestRequest::default()
                .insert_header(("x-api-key", presented))
                .to_http_request();
            assert!(
                matches!(authorize(&req, Some("s3cret")), Err(ProxyError::Unauthorized(_))),
                "token {:?}",
                presented
            );
        }
    }

    #[test]
    fn test_authorize_rejects_wrong_or_missing() {
        let wrong = TestRequest::default()
            .insert_header(("authorization", "Bearer nope"))
            .to_http_request();
        assert!(matches!(
            authorize(&wrong, Some("s3cret")),
            Err(ProxyError::Unauthorized(_))
        ));

        let missing = TestRequest::default().to_http_request();
        assert!(matches!(
            authorize(&missing, Some("s3cret")),
            Err(ProxyError::Unauthorized(_))
        ));
    }
}
