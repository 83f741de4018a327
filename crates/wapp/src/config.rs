//! Resolve the `RuntimeConfig` for a command: config file and profile
//! first, then flag overrides.

use std::time::Duration;

use secrecy::SecretString;

use wapp_config::Config;
use wapp_core::{DEFAULT_BASE_URL, RuntimeConfig, TlsVerification, stream_url_for};

use crate::cli::GlobalOpts;
use crate::error::CliError;

/// Build a `RuntimeConfig` from the config file, profile, and CLI overrides.
pub fn build_runtime_config(global: &GlobalOpts) -> Result<RuntimeConfig, CliError> {
    let cfg = wapp_config::load_config_or_default();
    resolve(&cfg, global)
}

fn resolve(cfg: &Config, global: &GlobalOpts) -> Result<RuntimeConfig, CliError> {
    let profile_name = wapp_config::active_profile_name(cfg, global.profile.as_deref());
    let has_profile = cfg.profiles.contains_key(&profile_name);

    // A named profile that does not exist is a mistake, not a fallback.
    if global.profile.is_some() && !has_profile {
        return Err(CliError::ProfileNotFound {
            name: profile_name,
            available: cfg.available_profiles(),
        });
    }

    let mut runtime = match (has_profile, &global.session) {
        (true, Some(_)) => {
            wapp_config::profile_to_runtime_config_without_session(cfg, &profile_name)?
        }
        (true, None) => wapp_config::profile_to_runtime_config(cfg, &profile_name)?,
        (false, _) => {
            let host = global.host.as_deref().unwrap_or(DEFAULT_BASE_URL);
            wapp_config::defaults_to_runtime_config(cfg, host)?
        }
    };

    apply_overrides(&mut runtime, global)?;

    if runtime.session.is_none() {
        return Err(CliError::NoSession {
            profile: profile_name,
        });
    }
    Ok(runtime)
}

fn apply_overrides(runtime: &mut RuntimeConfig, global: &GlobalOpts) -> Result<(), CliError> {
    if let Some(ref host) = global.host {
        runtime.base_url = parse_url("host", host)?;
        runtime.stream_url = stream_url_for(&runtime.base_url)?;
    }
    if let Some(ref stream_url) = global.stream_url {
        runtime.stream_url = parse_url("stream-url", stream_url)?;
    }
    if let Some(ref session) = global.session {
        runtime.session = Some(SecretString::from(session.clone()));
    }
    if let Some(count) = global.reconnect_count {
        runtime.reconnect.max_retries = count;
    }
    if let Some(validation) = global.validation {
        runtime.validation = validation;
    }
    if let Some(secs) = global.timeout {
        runtime.request_timeout = Duration::from_secs(secs);
    }
    if global.insecure {
        runtime.tls = TlsVerification::DangerAcceptInvalid;
    }
    Ok(())
}

fn parse_url(field: &str, raw: &str) -> Result<url::Url, CliError> {
    raw.parse().map_err(|e| CliError::Validation {
        field: field.into(),
        reason: format!("invalid URL '{raw}': {e}"),
    })
}
