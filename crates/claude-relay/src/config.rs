//! Configuration from environment variables.
//!
//! **Environment variables:**
//! - `HOST`: bind address (default: 0.0.0.0)
//! - `PORT`: server port (default: 8787)
//! - `UPSTREAM_BASE_URL`: full URL of the OpenAI-compatible `chat/completions` endpoint
//! - `UPSTREAM_API_KEYS`: comma-separated upstream credentials (required)
//! - `AUTH_TOKEN`: when set, callers must present it as a bearer token
//! - `REQUEST_TIMEOUT_SECS`: longest upstream silence before a request or stream is
//!   abandoned (default: 120). Long streams that keep sending are never cut.

use crate::error::ConfigError;
use std::env;
use std::time::Duration;

pub const DEFAULT_HOST: &str = "0.0.0.0";
pub const DEFAULT_PORT: u16 = 8787;
pub const DEFAULT_UPSTREAM_BASE_URL: &str = "https://openrouter.ai/api/v1/chat/completions";
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 120;

/// Upper bound on establishing the upstream connection.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Attempts per inbound request before the last failure is surfaced.
pub const MAX_ATTEMPTS: u32 = 3;

/// How long a quarantined credential stays out of rotation.
pub const RECOVERY_WINDOW: Duration = Duration::from_secs(60);

#[derive(Clone)]
pub struct ProxyConfig {
    pub host: String,
    pub port: u16,
    pub upstream_base_url: String,
    pub api_keys: Vec<String>,
    pub auth_token: Option<String>,
    pub request_timeout_secs: u64,
}

// Keys and the auth token stay out of logs.
impl std::fmt::Debug for ProxyConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxyConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("upstream_base_url", &self.upstream_base_url)
            .field("api_keys", &format_args!("[{} redacted]", self.api_keys.len()))
            .field("auth_token", &self.auth_token.as_ref().map(|_| "[redacted]"))
            .field("request_timeout_secs", &self.request_timeout_secs)
            .finish()
    }
}

impl ProxyConfig {
    /// Read the configuration from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Build the configuration from an arbitrary variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let port = match lookup("PORT") {
            Some(raw) => raw.trim().parse().map_err(|_| ConfigError::InvalidValue {
                name: "PORT",
                value: raw,
            })?,
            None => DEFAULT_PORT,
        };

        let request_timeout_secs = match lookup("REQUEST_TIMEOUT_SECS") {
            Some(raw) => raw.trim().parse().map_err(|_| ConfigError::InvalidValue {
                name: "REQUEST_TIMEOUT_SECS",
                value: raw,
            })?,
            None => DEFAULT_REQUEST_TIMEOUT_SECS,
        };

        let api_keys = lookup("UPSTREAM_API_KEYS")
            .map(|raw| parse_key_list(&raw))
            .unwrap_or_default();
        if api_keys.is_empty() {
            return Err(ConfigError::NoCredentials);
        }

        Ok(Self {
            host: lookup("HOST").unwrap_or_else(|| DEFAULT_HOST.to_string()),
            port,
            upstream_base_url: lookup("UPSTREAM_BASE_URL")
                .unwrap_or_else(|| DEFAULT_UPSTREAM_BASE_URL.to_string()),
            api_keys,
            auth_token: lookup("AUTH_TOKEN").filter(|t| !t.trim().is_empty()),
            request_timeout_secs,
        })
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

fn parse_key_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|k| !k.is_empty())
        .map(str::to_string)
        .collect()
}
