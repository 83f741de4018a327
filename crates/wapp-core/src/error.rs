// ── Core error types ──
//
// User-facing errors from wapp-core. Consumers never see raw HTTP or
// socket failures; the `From<wapp_api::Error>` impl translates wire-level
// errors into runtime-level variants.

use thiserror::Error;

/// Unified error type for the core crate.
#[derive(Debug, Error)]
pub enum CoreError {
    // ── Connection errors ────────────────────────────────────────────
    #[error("Cannot connect to stream at {url}: {reason}")]
    ConnectionFailed { url: String, reason: String },

    #[error("Not connected to the stream")]
    NotConnected,

    #[error("Stream connection closed after {attempts} failed reconnect attempts")]
    ReconnectExhausted { attempts: u32 },

    // ── Request errors ───────────────────────────────────────────────
    #[error("Request timed out after {timeout_ms}ms")]
    RequestTimeout { timeout_ms: u64 },

    #[error("Request rejected by server (code {code}): {message}")]
    RequestRejected { code: i64, message: String },

    #[error("Validation failed: {message}")]
    ValidationFailed { message: String },

    // ── Routing errors ───────────────────────────────────────────────
    #[error("Malformed frame: {0}")]
    MalformedFrame(String),

    #[error("No object registered at path {path}")]
    NoMatchingObject { path: String },

    // ── API errors (wrapped, not exposed raw) ────────────────────────
    #[error("API error: {message}")]
    Api {
        message: String,
        /// Service-specific error code (e.g. `400008`).
        code: Option<i64>,
        /// HTTP status code (if applicable).
        status: Option<u16>,
    },

    // ── Configuration errors ─────────────────────────────────────────
    #[error("Configuration error: {message}")]
    Config { message: String },

    // ── Internal errors ──────────────────────────────────────────────
    #[error("Internal error: {0}")]
    Internal(String),
}

impl CoreError {
    /// Service error code carried by an API failure.
    pub fn api_code(&self) -> Option<i64> {
        match self {
            Self::Api { code, .. } => *code,
            _ => None,
        }
    }
}

// ── Conversion from wire-level errors ────────────────────────────────

impl From<wapp_api::Error> for CoreError {
    fn from(err: wapp_api::Error) -> Self {
        match err {
            wapp_api::Error::Transport(ref e) => {
                if e.is_connect() || e.is_timeout() {
                    CoreError::ConnectionFailed {
                        url: e
                            .url()
                            .map_or_else(|| "<unknown>".into(), ToString::to_string),
                        reason: e.to_string(),
                    }
                } else {
                    CoreError::Api {
                        message: e.to_string(),
                        code: None,
                        status: e.status().map(|s| s.as_u16()),
                    }
                }
            }
            wapp_api::Error::InvalidUrl(e) => CoreError::Config {
                message: format!("Invalid URL: {e}"),
            },
            wapp_api::Error::Tls(msg) => CoreError::ConnectionFailed {
                url: String::new(),
                reason: format!("TLS error: {msg}"),
            },
            wapp_api::Error::Api {
                status,
                code,
                message,
            } => CoreError::Api {
                message,
                code,
                status: Some(status),
            },
            wapp_api::Error::Deserialization { message, body: _ } => {
                CoreError::Internal(format!("Deserialization error: {message}"))
            }
            wapp_api::Error::WebSocketConnect(reason) => CoreError::ConnectionFailed {
                url: String::new(),
                reason: format!("WebSocket connection failed: {reason}"),
            },
            wapp_api::Error::WebSocketClosed { code, reason } => CoreError::ConnectionFailed {
                url: String::new(),
                reason: format!("WebSocket closed (code {code}): {reason}"),
            },
            wapp_api::Error::NotConnected => CoreError::NotConnected,
            wapp_api::Error::ReconnectExhausted { attempts } => {
                CoreError::ReconnectExhausted { attempts }
            }
            wapp_api::Error::MalformedFrame(msg) => CoreError::MalformedFrame(msg),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn api_error_keeps_service_code() {
        let err = CoreError::from(wapp_api::Error::Api {
            status: 400,
            code: Some(400_013),
            message: "consent".into(),
        });
        assert_eq!(err.api_code(), Some(400_013));
        assert!(matches!(err, CoreError::Api { status: Some(400), .. }));
    }

    #[test]
    fn stream_errors_map_one_to_one() {
        assert!(matches!(
            CoreError::from(wapp_api::Error::NotConnected),
            CoreError::NotConnected
        ));
        assert!(matches!(
            CoreError::from(wapp_api::Error::ReconnectExhausted { attempts: 10 }),
            CoreError::ReconnectExhausted { attempts: 10 }
        ));
    }
}
