//! `wapp oauth`: wait for a named OAuth connection.

use wapp_core::Runtime;

use crate::cli::{GlobalOpts, OauthArgs};
use crate::error::CliError;
use crate::output;

pub async fn handle(runtime: &Runtime, args: OauthArgs, global: &GlobalOpts) -> Result<(), CliError> {
    super::connect(runtime, global).await?;
    output::status(
        &format!("waiting for oauth connection '{}'", args.name),
        global.quiet,
    );
    let params = runtime.oauth().get_token(&args.name).await?;
    output::print_json(&params, global.quiet);
    Ok(())
}
