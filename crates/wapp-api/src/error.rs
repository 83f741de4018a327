use thiserror::Error;

/// Top-level error type for the `wapp-api` crate.
///
/// Covers every failure mode of the wire layer: HTTP transport, REST
/// error bodies, frame decoding, and the WebSocket connection lifecycle.
/// `wapp-core` maps these into runtime-level errors.
#[derive(Debug, Error)]
pub enum Error {
    // ── Transport ───────────────────────────────────────────────────
    /// HTTP transport error (connection refused, DNS failure, etc.)
    #[error("HTTP transport error: {0}")]
    Transport(#[from] reqwest::Error),

    /// URL parsing error.
    #[error("Invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    /// TLS setup or HTTP client construction failed.
    #[error("TLS error: {0}")]
    Tls(String),

    // ── REST ────────────────────────────────────────────────────────
    /// Structured error body returned by the REST service.
    ///
    /// The service answers failures with `{"code": N, "message": "..."}`.
    /// `code` is the service-specific code (e.g. `400008` when consent is
    /// required), distinct from the HTTP status.
    #[error("API error (HTTP {status}): {message}")]
    Api {
        status: u16,
        code: Option<i64>,
        message: String,
    },

    /// JSON deserialization failed, with the raw body for debugging.
    #[error("Deserialization error: {message}")]
    Deserialization { message: String, body: String },

    // ── Stream ──────────────────────────────────────────────────────
    /// WebSocket connection (or handshake) failed.
    #[error("WebSocket connection failed: {0}")]
    WebSocketConnect(String),

    /// WebSocket closed unexpectedly.
    #[error("WebSocket closed (code {code}): {reason}")]
    WebSocketClosed { code: u16, reason: String },

    /// A frame was sent while the connection was not in `Connected` state.
    #[error("Not connected to the stream")]
    NotConnected,

    /// Reconnection limit reached; the connection is permanently closed.
    #[error("Stream connection closed after {attempts} failed reconnect attempts")]
    ReconnectExhausted { attempts: u32 },

    /// An inbound frame could not be decoded.
    #[error("Malformed frame: {0}")]
    MalformedFrame(String),
}

impl Error {
    /// Returns `true` if this is a transient error worth retrying.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Transport(e) => e.is_timeout() || e.is_connect(),
            Self::WebSocketConnect(_) | Self::NotConnected => true,
            _ => false,
        }
    }

    /// Returns `true` if this is a "not found" error.
    pub fn is_not_found(&self) -> bool {
        match self {
            Self::Transport(e) => e.status() == Some(reqwest::StatusCode::NOT_FOUND),
            Self::Api { status: 404, .. } => true,
            _ => false,
        }
    }

    /// Extract the service error code, if available.
    pub fn api_code(&self) -> Option<i64> {
        match self {
            Self::Api { code, .. } => *code,
            _ => None,
        }
    }
}
