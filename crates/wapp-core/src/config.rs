// ── Runtime connection configuration ──
//
// These types describe *how* to reach the service and how the stream
// behaves. They carry the session token and tuning knobs, but never touch
// disk: the CLI builds a `RuntimeConfig` and hands it in.

use std::path::PathBuf;
use std::time::Duration;

use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use url::Url;

use wapp_api::ReconnectConfig;

use crate::error::CoreError;

/// Default service base URL.
pub const DEFAULT_BASE_URL: &str = "https://wappsto.com/services";

/// Stream endpoint, relative to the base URL.
const STREAM_PATH: &str = "2.0/websocket/open";

/// How strictly caller arguments and inbound payloads are checked.
#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Validation {
    /// No argument checks.
    None,
    /// Reject arguments that cannot produce a valid request.
    #[default]
    Normal,
    /// Also drop inbound update and create payloads that are not objects.
    Strict,
}

/// TLS verification strategy.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum TlsVerification {
    /// System CA store.
    #[default]
    SystemDefaults,
    /// Custom CA certificate file.
    CustomCa(PathBuf),
    /// Skip verification (local test backends).
    DangerAcceptInvalid,
}

/// Configuration for one runtime.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Service base URL for REST calls (e.g. `https://wappsto.com/services`).
    pub base_url: Url,
    /// WebSocket endpoint.
    pub stream_url: Url,
    /// Session token sent as `X-Session`.
    pub session: Option<SecretString>,
    pub tls: TlsVerification,
    /// Backoff and reconnect budget for the stream.
    pub reconnect: ReconnectConfig,
    /// Deadline for requests issued over the stream and for HTTP calls.
    pub request_timeout: Duration,
    /// Ask the service for verbose responses.
    pub verbose: bool,
    pub validation: Validation,
}

impl RuntimeConfig {
    /// Build a config for `base_url`, deriving the stream URL from it.
    pub fn new(base_url: Url) -> Result<Self, CoreError> {
        let stream_url = stream_url_for(&base_url)?;
        Ok(Self {
            base_url,
            stream_url,
            session: None,
            tls: TlsVerification::default(),
            reconnect: ReconnectConfig::default(),
            request_timeout: Duration::from_secs(30),
            verbose: false,
            validation: Validation::default(),
        })
    }

    /// Config for the public service.
    pub fn service_default() -> Result<Self, CoreError> {
        let base = Url::parse(DEFAULT_BASE_URL).map_err(|e| CoreError::Config {
            message: format!("invalid default base URL: {e}"),
        })?;
        Self::new(base)
    }

    pub fn with_session(mut self, session: SecretString) -> Self {
        self.session = Some(session);
        self
    }

    /// Number of failed reconnects tolerated before the stream closes.
    pub fn with_reconnect_count(mut self, count: u32) -> Self {
        self.reconnect.max_retries = count;
        self
    }
}

/// Derive the stream URL from a REST base URL.
///
/// `https://host/services` becomes `wss://host/services/2.0/websocket/open`;
/// plain `http` maps to `ws`.
pub fn stream_url_for(base: &Url) -> Result<Url, CoreError> {
    let scheme = match base.scheme() {
        "https" => "wss",
        "http" => "ws",
        other => other,
    };
    let rest = base
        .as_str()
        .strip_prefix(base.scheme())
        .unwrap_or_default()
        .trim_end_matches('/');

    Url::parse(&format!("{scheme}{rest}/{STREAM_PATH}")).map_err(|e| CoreError::Config {
        message: format!("cannot derive stream URL from {base}: {e}"),
    })
}
