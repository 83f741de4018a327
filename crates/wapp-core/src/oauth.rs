// ── OAuth token wait ──
//
// Third-party OAuth connections are completed by the user in a browser.
// The service stores the resulting token under a named connection and
// announces it on the `oauth_connect` topic.

use std::sync::{Arc, Mutex, PoisonError};

use serde_json::{Map, Value};
use tokio::sync::oneshot;
use tracing::{debug, info};

use crate::api::RestApi;
use crate::error::CoreError;
use crate::subscription::{ServiceFlow, ServiceRegistry};

/// Service topic announcing completed OAuth connections.
pub const OAUTH_TOPIC: &str = "oauth_connect";

fn endpoint(name: &str) -> String {
    format!("/2.0/oauth_connect/{name}")
}

/// Token parameters of a connection that has completed.
fn completed_params(body: &Value) -> Option<Value> {
    let params = body.get("params")?;
    params.get("oauth_token").is_some().then(|| params.clone())
}

/// Waits for OAuth tokens by connection name.
#[derive(Clone)]
pub struct OAuthTokens {
    api: Arc<dyn RestApi>,
    services: ServiceRegistry,
    reconnect_budget: u32,
}

impl OAuthTokens {
    pub fn new(api: Arc<dyn RestApi>, services: ServiceRegistry, reconnect_budget: u32) -> Self {
        Self {
            api,
            services,
            reconnect_budget,
        }
    }

    /// Token parameters for connection `name`.
    ///
    /// Returns the stored parameters when the connection already holds a
    /// token; otherwise waits, without a deadline, for the user to finish
    /// the connection.
    pub async fn get_token(&self, name: &str) -> Result<Value, CoreError> {
        let stored = self.api.fetch(&endpoint(name), Map::new()).await?;
        if let Some(params) = stored.iter().find_map(completed_params) {
            debug!(connection = name, "oauth token already present");
            return Ok(params);
        }

        info!(connection = name, "waiting for oauth connection");
        let (tx, rx) = oneshot::channel::<Value>();
        let tx = Mutex::new(Some(tx));
        let wanted = name.to_owned();
        let _subscription = self
            .services
            .subscribe(OAUTH_TOPIC, move |event| {
                if event.data.get("name").and_then(Value::as_str) != Some(wanted.as_str()) {
                    return ServiceFlow::Continue;
                }
                let params = event.data.get("params").cloned().unwrap_or(Value::Null);
                if let Some(tx) = tx.lock().unwrap_or_else(PoisonError::into_inner).take() {
                    let _ = tx.send(params);
                }
                ServiceFlow::Done
            })
            .guard();

        rx.await.map_err(|_| CoreError::ReconnectExhausted {
            attempts: self.reconnect_budget,
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::api::fake::{Call, FakeRest};
    use crate::model::StreamEvent;
    use serde_json::json;
    use wapp_api::EventKind;

    fn tokens(api: &Arc<FakeRest>, services: &ServiceRegistry) -> OAuthTokens {
        OAuthTokens::new(api.clone(), services.clone(), 10)
    }

    #[tokio::test]
    async fn stored_token_returns_immediately() {
        let api = Arc::new(FakeRest::default());
        api.respond(Ok(json!({ "name": "github", "params": { "oauth_token": "t0k" } })));
        let services = ServiceRegistry::new();

        let params = tokens(&api, &services).get_token("github").await.unwrap();

        assert_eq!(params["oauth_token"], json!("t0k"));
        assert_eq!(
            api.calls(),
            vec![Call::Fetch("/2.0/oauth_connect/github".into(), Map::new())]
        );
        assert!(services.is_empty());
    }

    #[tokio::test]
    async fn waits_for_matching_connection_event() {
        let api = Arc::new(FakeRest::default());
        api.respond(Ok(json!({ "name": "github", "params": {} })));
        let services = ServiceRegistry::new();

        let task = tokio::spawn({
            let tokens = tokens(&api, &services);
            async move { tokens.get_token("github").await }
        });
        while services.is_empty() {
            tokio::task::yield_now().await;
        }

        services.dispatch(&StreamEvent::new(
            "/oauth_connect/1",
            EventKind::Update,
            json!({ "name": "gitlab", "params": { "oauth_token": "other" } }),
        ));
        services.dispatch(&StreamEvent::new(
            "/oauth_connect/2",
            EventKind::Update,
            json!({ "name": "github", "params": { "oauth_token": "mine" } }),
        ));

        let params = task.await.unwrap().unwrap();
        assert_eq!(params["oauth_token"], json!("mine"));
        assert!(services.is_empty());
    }
}
