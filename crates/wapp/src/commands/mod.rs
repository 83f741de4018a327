//! Command dispatch: bridges CLI args to runtime operations and output.

pub mod config_cmd;
pub mod listen;
pub mod load;
pub mod oauth;
pub mod permission;
pub mod request;

use wapp_core::Runtime;

use crate::cli::{Command, GlobalOpts};
use crate::error::CliError;
use crate::output;

/// Dispatch a stream-bound command to the appropriate handler.
pub async fn dispatch(cmd: Command, runtime: &Runtime, global: &GlobalOpts) -> Result<(), CliError> {
    match cmd {
        Command::Listen(args) => listen::handle(runtime, args, global).await,
        Command::Request(args) => request::handle(runtime, args, global).await,
        Command::Permission(args) => permission::handle(runtime, args, global).await,
        Command::Oauth(args) => oauth::handle(runtime, args, global).await,
        Command::Load(args) => load::handle(runtime, args, global).await,
        // Config and Completions are handled before dispatch
        Command::Config(_) | Command::Completions(_) => unreachable!(),
    }
}

/// Open the stream, telling the user where.
pub(crate) async fn connect(runtime: &Runtime, global: &GlobalOpts) -> Result<(), CliError> {
    output::status(
        &format!("connecting to {}", runtime.config().stream_url),
        global.quiet,
    );
    runtime.connect().await?;
    Ok(())
}
