//! `wapp request`: one request over the stream.

use serde_json::Value;

use wapp_core::Runtime;

use crate::cli::{GlobalOpts, RequestArgs};
use crate::error::CliError;
use crate::output;

pub async fn handle(runtime: &Runtime, args: RequestArgs, global: &GlobalOpts) -> Result<(), CliError> {
    let params: Value = serde_json::from_str(&args.params).map_err(|e| CliError::Validation {
        field: "params".into(),
        reason: format!("invalid JSON: {e}"),
    })?;

    super::connect(runtime, global).await?;
    let result = runtime.send_request(&args.method, params).await?;
    output::print_json(&result, global.quiet);
    Ok(())
}
