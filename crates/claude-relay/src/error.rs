//! Error types and the JSON error envelope returned to callers.

use actix_web::http::{header, StatusCode};
use actix_web::{HttpResponse, ResponseError};
use serde::Serialize;
use thiserror::Error;

/// Startup configuration problems.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("no upstream credentials configured (set UPSTREAM_API_KEYS)")]
    NoCredentials,

    #[error("invalid value for {name}: {value:?}")]
    InvalidValue { name: &'static str, value: String },
}

/// Failures while turning an upstream response into an Anthropic response.
#[derive(Debug, Error)]
pub enum TranslationError {
    #[error("upstream response has no choices")]
    MissingChoice,

    #[error("tool call {id} has malformed arguments: {source}")]
    MalformedToolArguments {
        id: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Terminal outcome of the delivery loop when no attempt succeeded.
#[derive(Debug, Error)]
pub enum DeliveryError {
    /// The last attempt got a non-2xx answer; it is handed back verbatim.
    #[error("upstream returned HTTP {status}")]
    Upstream {
        status: u16,
        content_type: Option<String>,
        body: bytes::Bytes,
    },

    /// The last attempt never got an answer.
    #[error("upstream request failed: {0}")]
    Network(#[from] reqwest::Error),
}

/// Everything a request handler can fail with.
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("{0}")]
    InvalidRequest(String),

    #[error("{0}")]
    Unauthorized(&'static str),

    #[error(transparent)]
    Translation(#[from] TranslationError),

    #[error(transparent)]
    Delivery(#[from] DeliveryError),

    #[error("invalid upstream response: {0}")]
    UpstreamDecode(String),
}

impl ProxyError {
    /// Machine-readable tag placed in `error.type`.
    pub fn kind(&self) -> &'static str {
        match self {
            ProxyError::InvalidRequest(_) => "invalid_request_error",
            ProxyError::Unauthorized(_) => "authentication_error",
            ProxyError::Translation(_) => "translation_error",
            ProxyError::Delivery(_) | ProxyError::UpstreamDecode(_) => "proxy_error",
        }
    }
}

#[derive(Debug, Serialize)]
struct ErrorEnvelope<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    error: ErrorBody<'a>,
}

#[derive(Debug, Serialize)]
struct ErrorBody<'a> {
    #[serde(rename = "type")]
    kind: &'a str,
    message: String,
}

/// Build `{"type":"error","error":{"type":..,"message":..}}`.
pub fn error_envelope(kind: &str, message: impl Into<String>) -> serde_json::Value {
    serde_json::to_value(ErrorEnvelope {
        kind: "error",
        error: ErrorBody {
            kind,
            message: message.into(),
        },
    })
    .unwrap_or_default()
}

impl ResponseError for ProxyError {
    fn status_code(&self) -> StatusCode {
        match self {
            ProxyError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            ProxyError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            ProxyError::Delivery(DeliveryError::Upstream { status, .. }) => {
                StatusCode::from_u16(*status).unwrap_or(StatusCode::BAD_GATEWAY)
            }
            ProxyError::Translation(_)
            | ProxyError::Delivery(DeliveryError::Network(_))
            | ProxyError::UpstreamDecode(_) => StatusCode::BAD_GATEWAY,
        }
    }

    fn error_response(&self) -> HttpResponse {
        // Exhausted HTTP failures go back exactly as the upstream sent them.
        if let ProxyError::Delivery(DeliveryError::Upstream {
            content_type, body, ..
        }) = self
        {
            let mut resp = HttpResponse::build(self.status_code());
            if let Some(ct) = content_type {
                resp.insert_header((header::CONTENT_TYPE, ct.as_str()));
            }
            return resp.body(body.clone());
        }

        HttpResponse::build(self.status_code()).json(error_envelope(self.kind(), self.to_string()))
    }
}
