//! `wapp listen`: print stream events under a prefix.

use futures_util::StreamExt;

use wapp_core::Runtime;

use crate::cli::{GlobalOpts, ListenArgs};
use crate::error::CliError;
use crate::output;

pub async fn handle(runtime: &Runtime, args: ListenArgs, global: &GlobalOpts) -> Result<(), CliError> {
    // Subscribe before connecting so no early event is missed.
    let mut events = runtime.services().stream(args.prefix.as_str());
    super::connect(runtime, global).await?;
    output::status(&format!("listening on /{}", events.handle().prefix()), global.quiet);

    let mut seen = 0usize;
    while args.count.is_none_or(|limit| seen < limit) {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            event = events.next() => {
                let Some(event) = event else {
                    // Registry closed: the connection is gone for good.
                    return Err(CliError::ConnectionLost {
                        attempts: runtime.config().reconnect.max_retries,
                    });
                };
                output::print_json_line(&serde_json::to_value(&event)?);
                seen += 1;
            }
        }
    }
    Ok(())
}
