//! `wapp load`: fetch one object, optionally following its updates.

use futures_util::StreamExt;
use wapp_core::Runtime;

use crate::cli::{GlobalOpts, LoadArgs};
use crate::error::CliError;
use crate::output;

pub async fn handle(runtime: &Runtime, args: LoadArgs, global: &GlobalOpts) -> Result<(), CliError> {
    if args.follow {
        super::connect(runtime, global).await?;
    }

    let object = runtime.load(args.kind, &args.id).await?;
    output::print_json(&object.to_json(), global.quiet);
    if !args.follow {
        return Ok(());
    }

    // The stream opens with the state just printed.
    let mut changes = object.subscribe().into_stream().skip(1);
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            snapshot = changes.next() => {
                let Some(snapshot) = snapshot else { break };
                output::print_json_line(&snapshot.to_json());
            }
        }
    }
    Ok(())
}
