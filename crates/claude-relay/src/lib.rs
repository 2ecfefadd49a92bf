//! claude-relay - Anthropic Messages API gateway over OpenAI-compatible upstreams.
//!
//! Claude clients speak Anthropic's `/v1/messages` API. This crate exposes a
//! compatible HTTP surface and forwards each request to an OpenAI-style
//! `chat/completions` endpoint, rotating through a pool of upstream keys.
//!
//! Pipeline:
//! - [`translation::convert_request`] rewrites the request into the upstream dialect.
//! - [`delivery::Orchestrator`] picks a key from the [`pool::CredentialPool`],
//!   calls upstream and retries with another key on failure.
//! - [`translation::convert_response`] or [`streaming::reframe`] turns the
//!   answer back into Anthropic semantics.

pub mod config;
pub mod delivery;
pub mod error;
pub mod openai;
pub mod pool;
pub mod server;
pub mod streaming;
pub mod translation;
pub mod types;

pub use config::ProxyConfig;
pub use delivery::Orchestrator;
pub use error::{ConfigError, DeliveryError, ProxyError, TranslationError};
pub use pool::{Credential, CredentialPool, PoolStats};
pub use server::serve;
