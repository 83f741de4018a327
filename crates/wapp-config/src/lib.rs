//! Shared configuration for wapp tools.
//!
//! TOML profiles, session resolution (env + keyring + plaintext), and
//! translation to `wapp_core::RuntimeConfig`. Core never reads files; it
//! receives the `RuntimeConfig` built here.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use directories::ProjectDirs;
use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use wapp_core::{DEFAULT_BASE_URL, RuntimeConfig, TlsVerification, Validation};

/// Keyring service name sessions are stored under.
pub const KEYRING_SERVICE: &str = "wapp";

/// Prefix for environment overrides. Nested keys use `__`, e.g.
/// `WAPP_DEFAULTS__TIMEOUT=60`.
pub const ENV_PREFIX: &str = "WAPP_";

// ── Error ───────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid {field}: {reason}")]
    Validation { field: String, reason: String },

    #[error("no session configured for profile '{profile}'")]
    NoSession { profile: String },

    #[error("profile '{name}' not found (available: {available})")]
    UnknownProfile { name: String, available: String },

    #[error("failed to serialize config: {0}")]
    Serialization(#[from] toml::ser::Error),

    #[error("config loading failed: {0}")]
    Figment(Box<figment::Error>),

    #[error("keyring error: {0}")]
    Keyring(#[from] keyring::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<figment::Error> for ConfigError {
    fn from(err: figment::Error) -> Self {
        Self::Figment(Box::new(err))
    }
}

// ── TOML config structs ─────────────────────────────────────────────

/// Top-level TOML configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    /// Default profile name.
    pub default_profile: Option<String>,

    /// Global defaults.
    #[serde(default)]
    pub defaults: Defaults,

    /// Named service profiles.
    #[serde(default)]
    pub profiles: HashMap<String, Profile>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            default_profile: Some("default".into()),
            defaults: Defaults::default(),
            profiles: HashMap::new(),
        }
    }
}

impl Config {
    /// Look up a profile by name.
    pub fn profile(&self, name: &str) -> Result<&Profile, ConfigError> {
        self.profiles
            .get(name)
            .ok_or_else(|| ConfigError::UnknownProfile {
                name: name.into(),
                available: self.available_profiles(),
            })
    }

    /// Comma-separated profile names, sorted, or `(none)`.
    pub fn available_profiles(&self) -> String {
        let mut names: Vec<&str> = self.profiles.keys().map(String::as_str).collect();
        if names.is_empty() {
            return "(none)".into();
        }
        names.sort_unstable();
        names.join(", ")
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Defaults {
    /// Request timeout in seconds.
    #[serde(default = "default_timeout")]
    pub timeout: u64,

    /// Failed reconnects tolerated before the stream closes.
    #[serde(default = "default_reconnect_count")]
    pub reconnect_count: u32,

    #[serde(default)]
    pub verbose: bool,

    #[serde(default)]
    pub validation: Validation,
}

impl Default for Defaults {
    fn default() -> Self {
        Self {
            timeout: default_timeout(),
            reconnect_count: default_reconnect_count(),
            verbose: false,
            validation: Validation::default(),
        }
    }
}

fn default_timeout() -> u64 {
    30
}
fn default_reconnect_count() -> u32 {
    10
}

/// A named service profile.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Profile {
    /// Service base URL (e.g., "https://wappsto.com/services").
    #[serde(default = "default_host")]
    pub host: String,

    /// Stream URL override; derived from `host` when unset.
    pub stream_url: Option<String>,

    /// Session token (plaintext; prefer keyring or env var).
    pub session: Option<String>,

    /// Environment variable name containing the session token.
    pub session_env: Option<String>,

    /// Path to custom CA certificate.
    pub ca_cert: Option<PathBuf>,

    /// Accept invalid TLS certificates.
    pub insecure: Option<bool>,

    /// Override timeout.
    pub timeout: Option<u64>,

    /// Override reconnect budget.
    pub reconnect_count: Option<u32>,

    /// Override verbose responses.
    pub verbose: Option<bool>,

    /// Override validation level.
    pub validation: Option<Validation>,
}

fn default_host() -> String {
    DEFAULT_BASE_URL.into()
}

// ── Config file path ────────────────────────────────────────────────

/// Resolve the config file path via XDG / platform conventions.
pub fn config_path() -> PathBuf {
    ProjectDirs::from("com", "wapp", "wapp").map_or_else(
        || {
            let mut p = dirs_fallback();
            p.push("config.toml");
            p
        },
        |dirs| dirs.config_dir().join("config.toml"),
    )
}

fn dirs_fallback() -> PathBuf {
    let mut p = PathBuf::from(std::env::var("HOME").unwrap_or_else(|_| ".".into()));
    p.push(".config");
    p.push("wapp");
    p
}

// ── Config loading ──────────────────────────────────────────────────

/// Load the full Config from the canonical file + environment.
pub fn load_config() -> Result<Config, ConfigError> {
    load_config_from(&config_path())
}

/// Load the full Config from `path` + environment.
///
/// A missing file is not an error; defaults and environment still apply.
pub fn load_config_from(path: &Path) -> Result<Config, ConfigError> {
    let figment = Figment::new()
        .merge(Serialized::defaults(Config::default()))
        .merge(Toml::file(path))
        .merge(Env::prefixed(ENV_PREFIX).split("__"));

    let config: Config = figment.extract()?;
    Ok(config)
}

/// Load config, returning a default if loading fails.
pub fn load_config_or_default() -> Config {
    load_config().unwrap_or_default()
}

// ── Config saving ───────────────────────────────────────────────────

/// Serialize config to TOML and write to the canonical config path.
pub fn save_config(cfg: &Config) -> Result<(), ConfigError> {
    save_config_to(cfg, &config_path())
}

/// Serialize config to TOML and write it to `path`.
pub fn save_config_to(cfg: &Config, path: &Path) -> Result<(), ConfigError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let toml_str = toml::to_string_pretty(cfg)?;
    std::fs::write(path, toml_str)?;
    Ok(())
}

// ── Profile resolution ──────────────────────────────────────────────

/// The profile to use: the requested one, else the configured default,
/// else `default`.
pub fn active_profile_name(config: &Config, requested: Option<&str>) -> String {
    requested
        .map(str::to_owned)
        .or_else(|| config.default_profile.clone())
        .unwrap_or_else(|| "default".into())
}

fn keyring_entry(profile_name: &str) -> Result<keyring::Entry, ConfigError> {
    Ok(keyring::Entry::new(
        KEYRING_SERVICE,
        &format!("{profile_name}/session"),
    )?)
}

/// Resolve a session token from the credential chain.
pub fn resolve_session(profile: &Profile, profile_name: &str) -> Result<SecretString, ConfigError> {
    // 1. Profile's session_env → env var lookup
    if let Some(ref env_name) = profile.session_env {
        if let Ok(val) = std::env::var(env_name) {
            return Ok(SecretString::from(val));
        }
    }

    // 2. System keyring
    if let Ok(entry) = keyring_entry(profile_name) {
        if let Ok(secret) = entry.get_password() {
            return Ok(SecretString::from(secret));
        }
    }

    // 3. Plaintext in config
    if let Some(ref session) = profile.session {
        return Ok(SecretString::from(session.clone()));
    }

    Err(ConfigError::NoSession {
        profile: profile_name.into(),
    })
}

/// Store a session token for `profile_name` in the system keyring.
pub fn store_session(profile_name: &str, session: &str) -> Result<(), ConfigError> {
    keyring_entry(profile_name)?.set_password(session)?;
    Ok(())
}

fn parse_url(field: &str, raw: &str) -> Result<url::Url, ConfigError> {
    raw.parse().map_err(|e| ConfigError::Validation {
        field: field.into(),
        reason: format!("invalid URL '{raw}': {e}"),
    })
}

/// Build a `RuntimeConfig` from a profile and the global defaults,
/// including its session.
///
/// Profile values win over `[defaults]`. No CLI flag overrides; the CLI
/// applies those on the returned value.
pub fn profile_to_runtime_config(
    config: &Config,
    profile_name: &str,
) -> Result<RuntimeConfig, ConfigError> {
    let profile = config.profile(profile_name)?;
    let mut runtime = profile_settings(config, profile)?;
    runtime.session = Some(resolve_session(profile, profile_name)?);
    Ok(runtime)
}

/// Like [`profile_to_runtime_config`] but leaves the session unset, for
/// callers that take the session from elsewhere.
pub fn profile_to_runtime_config_without_session(
    config: &Config,
    profile_name: &str,
) -> Result<RuntimeConfig, ConfigError> {
    profile_settings(config, config.profile(profile_name)?)
}

/// Base URL from `host` with `[defaults]` applied. Used when no profile
/// exists and everything comes from flags.
pub fn defaults_to_runtime_config(config: &Config, host: &str) -> Result<RuntimeConfig, ConfigError> {
    profile_settings(
        config,
        &Profile {
            host: host.into(),
            ..Profile::default()
        },
    )
}

fn profile_settings(config: &Config, profile: &Profile) -> Result<RuntimeConfig, ConfigError> {
    let defaults = &config.defaults;

    let base_url = parse_url("host", &profile.host)?;
    let mut runtime = RuntimeConfig::new(base_url).map_err(|e| ConfigError::Validation {
        field: "host".into(),
        reason: e.to_string(),
    })?;

    if let Some(ref stream_url) = profile.stream_url {
        runtime.stream_url = parse_url("stream_url", stream_url)?;
    }

    runtime.tls = if profile.insecure.unwrap_or(false) {
        TlsVerification::DangerAcceptInvalid
    } else if let Some(ref ca_path) = profile.ca_cert {
        TlsVerification::CustomCa(ca_path.clone())
    } else {
        TlsVerification::SystemDefaults
    };

    runtime.request_timeout = Duration::from_secs(profile.timeout.unwrap_or(defaults.timeout));
    runtime.reconnect.max_retries = profile.reconnect_count.unwrap_or(defaults.reconnect_count);
    runtime.verbose = profile.verbose.unwrap_or(defaults.verbose);
    runtime.validation = profile.validation.unwrap_or(defaults.validation);

    Ok(runtime)
}
