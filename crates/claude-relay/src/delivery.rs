//! Upstream delivery with credential rotation.
//!
//! Each attempt takes a fresh credential from the pool. Authorization
//! failures (401/403) and network errors quarantine the credential; other
//! HTTP failures are retried without blaming it. Between attempts the loop
//! sleeps `attempt × backoff_unit`.

use crate::config::{CONNECT_TIMEOUT, MAX_ATTEMPTS};
use crate::error::DeliveryError;
use crate::openai::ChatCompletionRequest;
use crate::pool::{Credential, CredentialPool};
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE};
use reqwest::{Client, Response, StatusCode};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, info, warn};

/// Base delay unit between attempts; attempt `n` waits `n` units.
pub const DEFAULT_BACKOFF_UNIT: Duration = Duration::from_secs(1);

/// Build the upstream HTTP client.
///
/// `idle_timeout` bounds each read rather than the whole exchange, so a
/// streamed answer may run as long as the upstream keeps producing bytes.
pub fn upstream_client(idle_timeout: Duration) -> reqwest::Result<Client> {
    Client::builder()
        .connect_timeout(CONNECT_TIMEOUT)
        .read_timeout(idle_timeout)
        .build()
}

/// How a single attempt ended.
enum Attempt {
    Success(Response),
    Failed(DeliveryError),
}

#[derive(Debug, Clone)]
pub struct Orchestrator {
    client: Client,
    pool: Arc<CredentialPool>,
    upstream_url: String,
    max_attempts: u32,
    backoff_unit: Duration,
}

impl Orchestrator {
    pub fn new(client: Client, pool: Arc<CredentialPool>, upstream_url: impl Into<String>) -> Self {
        Self {
            client,
            pool,
            upstream_url: upstream_url.into(),
            max_attempts: MAX_ATTEMPTS,
            backoff_unit: DEFAULT_BACKOFF_UNIT,
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    pub fn with_backoff_unit(mut self, unit: Duration) -> Self {
        self.backoff_unit = unit;
        self
    }

    pub fn pool(&self) -> &Arc<CredentialPool> {
        &self.pool
    }

    /// Send `body` upstream, rotating credentials until one attempt succeeds.
    ///
    /// On success the response body is left unread so streamed answers can be
    /// consumed incrementally.
    pub async fn send(&self, body: &ChatCompletionRequest) -> Result<Response, DeliveryError> {
        let mut attempt = 1;

        loop {
            let credential = self.pool.select();
            debug!(
                attempt,
                max_attempts = self.max_attempts,
                model = %body.model,
                stream = body.stream,
                "sending upstream request"
            );

            let err = match self.attempt(&credential, body).await {
                Attempt::Success(resp) => {
                    if attempt > 1 {
                        info!(attempt, "upstream request succeeded after retry");
                    }
                    return Ok(resp);
                }
                Attempt::Failed(err) => err,
            };

            if attempt >= self.max_attempts {
                warn!(
                    attempt,
                    max_attempts = self.max_attempts,
                    error = %err,
                    "max upstream attempts reached, giving up"
                );
                return Err(err);
            }

            let delay = self.backoff_unit * attempt;
            warn!(
                attempt,
                max_attempts = self.max_attempts,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "upstream attempt failed, retrying with another credential"
            );
            sleep(delay).await;
            attempt += 1;
        }
    }

    async fn attempt(&self, credential: &Credential, body: &ChatCompletionRequest) -> Attempt {
        let result = self
            .client
            .post(&self.upstream_url)
            .header(AUTHORIZATION, format!("Bearer {}", credential.expose()))
            .json(body)
            .send()
            .await;

        let resp = match result {
            Ok(resp) => resp,
            Err(e) => {
                self.pool.mark_failed(credential, &e.to_string());
                return Attempt::Failed(DeliveryError::Network(e));
            }
        };

        let status = resp.status();
        if status.is_success() {
            return Attempt::Success(resp);
        }

        if matches!(status, StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN) {
            self.pool
                .mark_failed(credential, &format!("HTTP {}", status.as_u16()));
        }

        let content_type = resp
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        // A body we fail to read is still an HTTP failure with this status.
        let body = resp.bytes().await.unwrap_or_default();

        Attempt::Failed(DeliveryError::Upstream {
            status: status.as_u16(),
            content_type,
            body,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::openai::{ChatMessage, ChatRole};
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn body() -> ChatCompletionRequest {
        ChatCompletionRequest {
            model: "anthropic/claude-3.5-haiku".to_string(),
            messages: vec![ChatMessage {
                role: ChatRole::User,
                content: "hi".to_string(),
            }],
            max_tokens: 4096,
            temperature: 0.7,
            stream: false,
            top_p: None,
            stop: None,
            tools: None,
            tool_choice: None,
        }
    }

    fn orchestrator(server: &MockServer, keys: &[&str]) -> Orchestrator {
        let pool = Arc::new(CredentialPool::new(keys.iter().copied()).unwrap());
        Orchestrator::new(Client::new(), pool, format!("{}/v1/chat/completions", server.uri()))
            .with_backoff_unit(Duration::from_millis(5))
    }

    #[tokio::test]
    async fn test_success_first_attempt() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .and(header("authorization", "Bearer k1"))
            .respond_with(ResponseTemplate::new(200).set_body_string("{}"))
            .expect(1)
            .mount(&server)
            .await;

        let orch = orchestrator(&server, &["k1"]);
        let resp = orch.send(&body()).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_unauthorized_quarantines_and_rotates() {
        let server = MockServer::start().await;
        Mock::given(header("authorization", "Bearer bad"))
            .respond_with(ResponseTemplate::new(401).set_body_string("nope"))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(header("authorization", "Bearer good"))
            .respond_with(ResponseTemplate::new(200).set_body_string("{}"))
            .expect(1)
            .mount(&server)
            .await;

        let orch = orchestrator(&server, &["bad", "good"]);
        let resp = orch.send(&body()).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(orch.pool().stats().failed, 1);
    }

    #[tokio::test]
    async fn test_server_errors_do_not_quarantine() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(500)
                    .set_body_raw(r#"{"error":"upstream down"}"#, "application/json"),
            )
            .expect(3)
            .mount(&server)
            .await;

        let orch = orchestrator(&server, &["k1", "k2"]);
        let err = orch.send(&body()).await.unwrap_err();
        match err {
            DeliveryError::Upstream {
                status,
                content_type,
                body,
            } => {
                assert_eq!(status, 500);
                assert_eq!(content_type.as_deref(), Some("application/json"));
                assert_eq!(&body[..], br#"{"error":"upstream down"}"#);
            }
            other => panic!("unexpected error: {:?}", other),
        }
        assert_eq!(orch.pool().stats().failed, 0);
    }

    #[tokio::test]
    async fn test_forbidden_marks_every_credential_tried() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(403))
            .expect(2)
            .mount(&server)
            .await;

        let orch = orchestrator(&server, &["a", "b", "c"]).with_max_attempts(2);
        let err = orch.send(&body()).await.unwrap_err();
        assert!(matches!(err, DeliveryError::Upstream { status: 403, .. }));
        assert_eq!(orch.pool().stats().failed, 2);
    }

    #[tokio::test]
    async fn test_network_error_marks_and_propagates() {
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let url = format!("http://127.0.0.1:{}/v1/chat/completions", port);
        let pool = Arc::new(CredentialPool::new(["k1", "k2"]).unwrap());
        let orch = Orchestrator::new(Client::new(), pool, url)
            .with_backoff_unit(Duration::from_millis(1));

        let err = orch.send(&body()).await.unwrap_err();
        assert!(matches!(err, DeliveryError::Network(_)));
        assert!(orch.pool().stats().failed >= 1);
    }

    #[tokio::test]
    async fn test_slow_stream_outlives_idle_timeout() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 4096];
            let _ = sock.read(&mut buf).await;
            sock.write_all(
                b"HTTP/1.1 200 OK\r\ncontent-type: text/event-stream\r\ntransfer-encoding: chunked\r\n\r\n",
            )
            .await
            .unwrap();
            for _ in 0..4 {
                sleep(Duration::from_millis(150)).await;
                sock.write_all(b"5\r\nhello\r\n").await.unwrap();
            }
            sock.write_all(b"0\r\n\r\n").await.unwrap();
        });

        // The whole body takes ~600ms; no single gap comes close to 400ms.
        let client = upstream_client(Duration::from_millis(400)).unwrap();
        let resp = client
            .get(format!("http://{}/", addr))
            .send()
            .await
            .unwrap();
        let body = resp.bytes().await.unwrap();
        assert_eq!(&body[..], b"hellohellohellohello");
    }

    #[tokio::test]
    async fn test_silent_upstream_hits_idle_timeout() {
        use tokio::io::AsyncReadExt;

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 4096];
            let _ = sock.read(&mut buf).await;
            sleep(Duration::from_secs(5)).await;
        });

        let client = upstream_client(Duration::from_millis(100)).unwrap();
        let err = client
            .get(format!("http://{}/", addr))
            .send()
            .await
            .unwrap_err();
        assert!(err.is_timeout());
    }

    #[tokio::test]
    async fn test_backoff_grows_linearly() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(502))
            .mount(&server)
            .await;

        let orch = orchestrator(&server, &["k1"]).with_backoff_unit(Duration::from_millis(40));
        let started = std::time::Instant::now();
        let _ = orch.send(&body()).await;
        // 1×40ms + 2×40ms between three attempts.
        assert!(started.elapsed() >= Duration::from_millis(120));
    }
}
