//! Clap derive structures for the `wapp` CLI.

use clap::{Args, Parser, Subcommand};

use wapp_core::{ModelKind, Quantity, Validation};

// ── Top-Level CLI ────────────────────────────────────────────────────

/// wapp -- stream-synchronized client for the Wappsto service
#[derive(Debug, Parser)]
#[command(
    name = "wapp",
    version,
    about = "Talk to the Wappsto service over its event stream",
    long_about = "Opens one WebSocket stream per invocation and uses it to listen for\n\
        server-pushed events, issue stream requests, and wait for permission\n\
        grants and OAuth connections.",
    propagate_version = true,
    subcommand_required = true,
    arg_required_else_help = true
)]
pub struct Cli {
    #[command(flatten)]
    pub global: GlobalOpts,

    #[command(subcommand)]
    pub command: Command,
}

// ── Global Options ───────────────────────────────────────────────────

#[derive(Debug, Args)]
pub struct GlobalOpts {
    /// Service profile to use
    #[arg(long, short = 'p', env = "WAPP_PROFILE", global = true)]
    pub profile: Option<String>,

    /// Service base URL (overrides profile)
    #[arg(long, short = 'H', env = "WAPP_HOST", global = true)]
    pub host: Option<String>,

    /// Stream URL (derived from the host when unset)
    #[arg(long, global = true)]
    pub stream_url: Option<String>,

    /// Session token
    #[arg(long, env = "WAPP_SESSION", global = true, hide_env_values = true)]
    pub session: Option<String>,

    /// Failed reconnects tolerated before giving up
    #[arg(long, global = true)]
    pub reconnect_count: Option<u32>,

    /// Argument and payload checking: none, normal, strict
    #[arg(long, global = true)]
    pub validation: Option<Validation>,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(long, short = 'v', action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Suppress non-error output
    #[arg(long, short = 'q', global = true)]
    pub quiet: bool,

    /// Accept invalid TLS certificates on REST calls
    #[arg(long, short = 'k', global = true)]
    pub insecure: bool,

    /// Request timeout in seconds
    #[arg(long, env = "WAPP_TIMEOUT", global = true)]
    pub timeout: Option<u64>,
}

// ── Top-Level Command Enum ───────────────────────────────────────────

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Print stream events under a path prefix
    Listen(ListenArgs),

    /// Send a request over the stream and print the result
    #[command(alias = "req")]
    Request(RequestArgs),

    /// Ask the user for access to objects and wait for the grant
    #[command(alias = "perm")]
    Permission(PermissionArgs),

    /// Wait for an OAuth connection and print its token parameters
    Oauth(OauthArgs),

    /// Load one object and follow its updates
    Load(LoadArgs),

    /// Manage CLI configuration
    Config(ConfigArgs),

    /// Generate shell completions
    Completions(CompletionsArgs),
}

// ── Stream commands ──────────────────────────────────────────────────

#[derive(Debug, Args)]
pub struct ListenArgs {
    /// Path prefix to subscribe to
    #[arg(default_value = "notification")]
    pub prefix: String,

    /// Exit after this many events
    #[arg(long, short = 'n')]
    pub count: Option<usize>,
}

#[derive(Debug, Args)]
pub struct RequestArgs {
    /// Request method (e.g., GET, POST)
    pub method: String,

    /// Request params as JSON
    #[arg(long, default_value = "{}")]
    pub params: String,
}

#[derive(Debug, Args)]
pub struct PermissionArgs {
    /// Endpoint to request access to (e.g., /2.0/network)
    pub endpoint: String,

    /// Message shown to the user (default: derived from the filters)
    #[arg(long, short = 'm')]
    pub message: Option<String>,

    /// Only objects whose attribute equals a value, as key=value (repeatable)
    #[arg(long, value_parser = parse_filter)]
    pub filter: Vec<(String, String)>,

    /// Number of objects, or "all"
    #[arg(long, default_value = "1")]
    pub quantity: Quantity,

    /// Give up after this many seconds (default: wait indefinitely)
    #[arg(long)]
    pub wait: Option<u64>,
}

#[derive(Debug, Args)]
pub struct OauthArgs {
    /// Connection name
    pub name: String,
}

#[derive(Debug, Args)]
pub struct LoadArgs {
    /// Object kind: network, device, value, state, data
    pub kind: ModelKind,

    /// Object id
    pub id: String,

    /// Keep running and print each change
    #[arg(long, short = 'f')]
    pub follow: bool,
}

// ── Config ───────────────────────────────────────────────────────────

#[derive(Debug, Args)]
pub struct ConfigArgs {
    #[command(subcommand)]
    pub command: ConfigCommand,
}

#[derive(Debug, Subcommand)]
pub enum ConfigCommand {
    /// Display current resolved configuration
    Show,

    /// Print the config file path
    Path,

    /// Set a value on the active profile
    Set {
        /// Profile key (host, stream_url, session_env, timeout, ...)
        key: String,

        /// Value to set
        value: String,
    },

    /// List configured profiles
    Profiles,

    /// Set the default profile
    Use {
        /// Profile name to set as default
        name: String,
    },

    /// Store a session token in the system keyring (read from stdin)
    SetSession {
        /// Profile name
        #[arg(long)]
        profile: Option<String>,
    },
}

// ── Completions ──────────────────────────────────────────────────────

#[derive(Debug, Args)]
pub struct CompletionsArgs {
    /// Shell to generate completions for
    pub shell: clap_complete::Shell,
}

/// Parse a `key=value` attribute filter.
fn parse_filter(raw: &str) -> Result<(String, String), String> {
    match raw.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_owned(), value.to_owned())),
        _ => Err(format!("expected key=value, got {raw:?}")),
    }
}
