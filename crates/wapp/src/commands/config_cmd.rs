//! Config subcommand handlers.

use std::io::BufRead;

use wapp_config::{Config, Profile};

use crate::cli::{ConfigArgs, ConfigCommand, GlobalOpts};
use crate::error::CliError;
use crate::output;

// ── Helpers ─────────────────────────────────────────────────────────

fn invalid(field: &str, reason: &str) -> CliError {
    CliError::Validation {
        field: field.into(),
        reason: reason.into(),
    }
}

fn parse_flag(field: &str, value: &str) -> Result<bool, CliError> {
    value
        .parse()
        .map_err(|_| invalid(field, "must be 'true' or 'false'"))
}

/// Apply `key = value` to a profile.
fn set_profile_key(profile: &mut Profile, key: &str, value: String) -> Result<(), CliError> {
    match key {
        "host" => {
            url::Url::parse(&value).map_err(|e| invalid("host", &format!("invalid URL: {e}")))?;
            profile.host = value;
        }
        "stream_url" | "stream-url" => {
            url::Url::parse(&value)
                .map_err(|e| invalid("stream_url", &format!("invalid URL: {e}")))?;
            profile.stream_url = Some(value);
        }
        "session" => profile.session = Some(value),
        "session_env" | "session-env" => profile.session_env = Some(value),
        "ca_cert" | "ca-cert" => profile.ca_cert = Some(value.into()),
        "insecure" => profile.insecure = Some(parse_flag("insecure", &value)?),
        "verbose" => profile.verbose = Some(parse_flag("verbose", &value)?),
        "timeout" => {
            profile.timeout = Some(
                value
                    .parse()
                    .map_err(|_| invalid("timeout", "must be a number (seconds)"))?,
            );
        }
        "reconnect_count" | "reconnect-count" => {
            profile.reconnect_count = Some(
                value
                    .parse()
                    .map_err(|_| invalid("reconnect_count", "must be a non-negative number"))?,
            );
        }
        "validation" => {
            profile.validation = Some(
                value
                    .parse()
                    .map_err(|_| invalid("validation", "must be none, normal, or strict"))?,
            );
        }
        other => {
            return Err(invalid(
                other,
                &format!(
                    "unknown config key '{other}'. Valid keys: host, stream_url, session, \
                     session_env, ca_cert, insecure, verbose, timeout, reconnect_count, validation"
                ),
            ));
        }
    }
    Ok(())
}

/// Render config as TOML with plaintext sessions masked.
fn render_redacted(cfg: &Config) -> Result<String, CliError> {
    let mut shown = cfg.clone();
    for profile in shown.profiles.values_mut() {
        if profile.session.is_some() {
            profile.session = Some("********".into());
        }
    }
    toml::to_string_pretty(&shown).map_err(|e| CliError::Config {
        message: format!("failed to serialize config: {e}"),
    })
}

// ── Handler ─────────────────────────────────────────────────────────

pub fn handle(args: ConfigArgs, global: &GlobalOpts) -> Result<(), CliError> {
    match args.command {
        ConfigCommand::Show => {
            let cfg = wapp_config::load_config()?;
            if !global.quiet {
                print!("{}", render_redacted(&cfg)?);
            }
            Ok(())
        }

        ConfigCommand::Path => {
            println!("{}", wapp_config::config_path().display());
            Ok(())
        }

        ConfigCommand::Set { key, value } => {
            let mut cfg = wapp_config::load_config_or_default();
            let profile_name = wapp_config::active_profile_name(&cfg, global.profile.as_deref());

            let profile = cfg.profiles.entry(profile_name.clone()).or_insert_with(|| Profile {
                host: wapp_core::DEFAULT_BASE_URL.into(),
                ..Profile::default()
            });
            set_profile_key(profile, &key, value)?;

            wapp_config::save_config(&cfg)?;
            output::success(&format!("Set {key} on profile '{profile_name}'"));
            Ok(())
        }

        ConfigCommand::Profiles => {
            let cfg = wapp_config::load_config_or_default();
            let default = cfg.default_profile.as_deref().unwrap_or("default");
            if cfg.profiles.is_empty() {
                eprintln!("No profiles configured. Run: wapp config set host <url>");
                return Ok(());
            }
            let mut names: Vec<&String> = cfg.profiles.keys().collect();
            names.sort();
            for name in names {
                let marker = if name == default { " *" } else { "" };
                println!("{name}{marker}");
            }
            Ok(())
        }

        ConfigCommand::Use { name } => {
            let mut cfg = wapp_config::load_config_or_default();
            cfg.profile(&name)?;
            cfg.default_profile = Some(name.clone());
            wapp_config::save_config(&cfg)?;
            output::success(&format!("Default profile set to '{name}'"));
            Ok(())
        }

        ConfigCommand::SetSession { profile } => {
            let cfg = wapp_config::load_config_or_default();
            let profile_name = profile
                .unwrap_or_else(|| wapp_config::active_profile_name(&cfg, global.profile.as_deref()));

            output::status("Session token (one line on stdin):", global.quiet);
            let mut line = String::new();
            std::io::stdin().lock().read_line(&mut line)?;
            let session = line.trim();
            if session.is_empty() {
                return Err(invalid("session", "value cannot be empty"));
            }

            wapp_config::store_session(&profile_name, session)?;
            output::success(&format!(
                "Session stored in system keyring for profile '{profile_name}'"
            ));
            Ok(())
        }
    }
}
