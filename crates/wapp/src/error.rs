//! CLI error types with miette diagnostics.
//!
//! Maps `CoreError` and `ConfigError` variants into user-facing errors
//! with actionable help text.

use miette::Diagnostic;
use thiserror::Error;

use wapp_config::ConfigError;
use wapp_core::CoreError;

/// Process exit codes.
pub mod exit_code {
    pub const GENERAL: i32 = 1;
    pub const USAGE: i32 = 2;
    pub const AUTH: i32 = 3;
    pub const NOT_FOUND: i32 = 4;
    pub const PERMISSION: i32 = 5;
    pub const CONFLICT: i32 = 6;
    pub const CONNECTION: i32 = 7;
    pub const TIMEOUT: i32 = 8;
}

#[derive(Debug, Error, Diagnostic)]
pub enum CliError {
    // ── Connection ───────────────────────────────────────────────────
    #[error("Could not connect to the stream at {url}")]
    #[diagnostic(
        code(wapp::connection_failed),
        help(
            "Check the host and your network.\n\
             Reason: {reason}"
        )
    )]
    ConnectionFailed { url: String, reason: String },

    #[error("Stream connection lost after {attempts} reconnect attempts")]
    #[diagnostic(
        code(wapp::connection_lost),
        help("Raise the budget with --reconnect-count or check the service status.")
    )]
    ConnectionLost { attempts: u32 },

    // ── Authentication ───────────────────────────────────────────────
    #[error("Authentication failed: {message}")]
    #[diagnostic(
        code(wapp::auth_failed),
        help("The session may have expired. Store a new one with: wapp config set-session")
    )]
    AuthFailed { message: String },

    #[error("No session configured for profile '{profile}'")]
    #[diagnostic(
        code(wapp::no_session),
        help(
            "Pass --session, set WAPP_SESSION, or store one with:\n  \
             wapp config set-session --profile {profile}"
        )
    )]
    NoSession { profile: String },

    #[error("Access denied: {message}")]
    #[diagnostic(code(wapp::permission_denied))]
    PermissionDenied { message: String },

    // ── Resources ────────────────────────────────────────────────────
    #[error("'{path}' not found")]
    #[diagnostic(code(wapp::not_found))]
    NotFound { path: String },

    #[error("Conflict: {message}")]
    #[diagnostic(code(wapp::conflict))]
    Conflict { message: String },

    // ── API ──────────────────────────────────────────────────────────
    #[error("API error ({code}): {message}")]
    #[diagnostic(code(wapp::api_error))]
    ApiError { code: String, message: String },

    // ── Validation ───────────────────────────────────────────────────
    #[error("Invalid value for {field}: {reason}")]
    #[diagnostic(code(wapp::validation))]
    Validation { field: String, reason: String },

    // ── Configuration ────────────────────────────────────────────────
    #[error("Profile '{name}' not found in configuration")]
    #[diagnostic(
        code(wapp::profile_not_found),
        help(
            "Available profiles: {available}\n\
             Create one with: wapp config set host <url> --profile {name}"
        )
    )]
    ProfileNotFound { name: String, available: String },

    #[error("Configuration error: {message}")]
    #[diagnostic(code(wapp::config))]
    Config { message: String },

    // ── Timeout ──────────────────────────────────────────────────────
    #[error("Timed out after {millis}ms")]
    #[diagnostic(
        code(wapp::timeout),
        help("Increase the limit with --timeout (or --wait for permission requests).")
    )]
    Timeout { millis: u64 },

    // ── IO / Serialization ───────────────────────────────────────────
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("Invalid JSON: {0}")]
    #[diagnostic(code(wapp::json))]
    Json(#[from] serde_json::Error),
}

impl CliError {
    /// Map this error to an exit code for process termination.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::ConnectionFailed { .. } | Self::ConnectionLost { .. } => exit_code::CONNECTION,
            Self::AuthFailed { .. } | Self::NoSession { .. } => exit_code::AUTH,
            Self::PermissionDenied { .. } => exit_code::PERMISSION,
            Self::NotFound { .. } | Self::ProfileNotFound { .. } => exit_code::NOT_FOUND,
            Self::Conflict { .. } => exit_code::CONFLICT,
            Self::Timeout { .. } => exit_code::TIMEOUT,
            Self::Validation { .. } | Self::Json(_) => exit_code::USAGE,
            Self::ApiError { .. } | Self::Config { .. } | Self::Io(_) => exit_code::GENERAL,
        }
    }
}

// ── CoreError → CliError mapping ─────────────────────────────────────

impl From<CoreError> for CliError {
    fn from(err: CoreError) -> Self {
        match err {
            CoreError::ConnectionFailed { url, reason } => CliError::ConnectionFailed { url, reason },

            CoreError::NotConnected => CliError::ConnectionFailed {
                url: "(disconnected)".into(),
                reason: "the stream is not connected".into(),
            },

            CoreError::ReconnectExhausted { attempts } => CliError::ConnectionLost { attempts },

            CoreError::RequestTimeout { timeout_ms } => CliError::Timeout { millis: timeout_ms },

            CoreError::RequestRejected { code, message } => CliError::ApiError {
                code: code.to_string(),
                message,
            },

            CoreError::ValidationFailed { message } => CliError::Validation {
                field: "input".into(),
                reason: message,
            },

            CoreError::NoMatchingObject { path } => CliError::NotFound { path },

            CoreError::Api {
                message,
                code,
                status,
            } => match status {
                Some(401) => CliError::AuthFailed { message },
                Some(403) => CliError::PermissionDenied { message },
                Some(404) => CliError::NotFound { path: message },
                Some(409) => CliError::Conflict { message },
                _ => CliError::ApiError {
                    code: code.map_or_else(|| "unknown".into(), |c| c.to_string()),
                    message,
                },
            },

            CoreError::Config { message } => CliError::Config { message },

            CoreError::MalformedFrame(message) => CliError::ApiError {
                code: "malformed_frame".into(),
                message,
            },

            CoreError::Internal(message) => CliError::ApiError {
                code: "internal".into(),
                message,
            },
        }
    }
}

// ── ConfigError → CliError mapping ───────────────────────────────────

impl From<ConfigError> for CliError {
    fn from(err: ConfigError) -> Self {
        match err {
            ConfigError::Validation { field, reason } => CliError::Validation { field, reason },
            ConfigError::NoSession { profile } => CliError::NoSession { profile },
            ConfigError::UnknownProfile { name, available } => {
                CliError::ProfileNotFound { name, available }
            }
            ConfigError::Io(e) => CliError::Io(e),
            other => CliError::Config {
                message: other.to_string(),
            },
        }
    }
}
