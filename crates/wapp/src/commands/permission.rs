//! `wapp permission`: request access and wait for the user's grant.

use std::time::Duration;

use serde_json::Value;

use wapp_core::{PermissionRequest, Quantity, Runtime};

use crate::cli::{GlobalOpts, PermissionArgs};
use crate::error::CliError;
use crate::output;

pub async fn handle(
    runtime: &Runtime,
    args: PermissionArgs,
    global: &GlobalOpts,
) -> Result<(), CliError> {
    let request = build_request(args.endpoint, args.quantity, &args.filter, args.message)?;

    // Grants arrive over the stream.
    super::connect(runtime, global).await?;
    output::status(
        &format!("waiting for access ({})", request.identifier()),
        global.quiet,
    );

    let permissions = runtime.permissions();
    let objects = match args.wait {
        Some(secs) => {
            permissions
                .request_within(request, Duration::from_secs(secs))
                .await?
        }
        None => permissions.request(request).await?,
    };

    output::print_json(&Value::Array(objects), global.quiet);
    Ok(())
}

/// Filters go through the typed lookup, which needs a known object kind.
fn build_request(
    endpoint: String,
    quantity: Quantity,
    filters: &[(String, String)],
    message: Option<String>,
) -> Result<PermissionRequest, CliError> {
    if filters.is_empty() {
        let message = message.ok_or_else(|| CliError::Validation {
            field: "message".into(),
            reason: "required when no --filter is given".into(),
        })?;
        return Ok(PermissionRequest::new(endpoint, quantity, message));
    }

    let kind = PermissionRequest::new(endpoint.as_str(), quantity, "")
        .kind()
        .ok_or_else(|| CliError::Validation {
            field: "endpoint".into(),
            reason: format!("{endpoint} does not name an object kind; --filter needs one"),
        })?;
    Ok(PermissionRequest::find(kind, quantity, filters, message))
}
