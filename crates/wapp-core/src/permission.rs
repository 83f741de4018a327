// ── Permission negotiation ──
//
// Asks the service for data the user has not yet shared. When the first
// lookup comes back empty, the service raises a consent prompt for the
// user and later pushes a `notification` event once they answer; the
// negotiator waits for that grant and repeats the lookup for the granted
// ids.

use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use futures_util::StreamExt;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value, json};
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::api::RestApi;
use crate::config::Validation;
use crate::error::CoreError;
use crate::model::{CODE_SAVE_GRANTED, ModelKind, NotificationRecord};
use crate::subscription::{ServiceFlow, ServiceRegistry};

/// Service topic carrying consent answers.
pub const NOTIFICATION_TOPIC: &str = "notification";

/// The server needs the user's consent before saving the object.
pub const CODE_CONSENT_REQUIRED: i64 = 400_008;
/// A consent prompt for this object is already open.
pub const CODE_CONSENT_PENDING: i64 = 400_013;

/// Identifier sent with the retried create after consent.
const SAVE_CONSENT_IDENTIFIER: &str = "request access to save data under users account";

// ── Quantity ─────────────────────────────────────────────────────────

/// How many objects a permission request asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Quantity {
    Count(u32),
    All,
}

impl Quantity {
    /// Pick the granted ids this quantity asks for, or `None` when the
    /// grant does not cover it yet.
    ///
    /// `All` takes every id in order; `Count(n)` takes the last `n`,
    /// newest first.
    pub fn select(self, ids: &[String]) -> Option<Vec<String>> {
        match self {
            Self::All if ids.is_empty() => None,
            Self::All => Some(ids.to_vec()),
            Self::Count(n) => {
                let n = usize::try_from(n).unwrap_or(usize::MAX);
                (ids.len() >= n).then(|| ids.iter().rev().take(n).cloned().collect())
            }
        }
    }
}

impl fmt::Display for Quantity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Count(n) => write!(f, "{n}"),
            Self::All => f.write_str("all"),
        }
    }
}

impl FromStr for Quantity {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.eq_ignore_ascii_case("all") {
            return Ok(Self::All);
        }
        s.parse::<u32>()
            .map(Self::Count)
            .map_err(|_| CoreError::ValidationFailed {
                message: format!("quantity must be a number or \"all\", got {s:?}"),
            })
    }
}

impl Serialize for Quantity {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::Count(n) => serializer.serialize_u32(*n),
            Self::All => serializer.serialize_str("all"),
        }
    }
}

impl<'de> Deserialize<'de> for Quantity {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Count(u32),
            Text(String),
        }
        match Raw::deserialize(deserializer)? {
            Raw::Count(n) => Ok(Self::Count(n)),
            Raw::Text(text) => text.parse().map_err(serde::de::Error::custom),
        }
    }
}

// ── PermissionRequest ────────────────────────────────────────────────

/// One request for access to objects behind `endpoint`.
#[derive(Debug, Clone)]
pub struct PermissionRequest {
    pub endpoint: String,
    pub quantity: Quantity,
    /// Shown to the user in the consent prompt.
    pub message: String,
    /// Extra lookup parameters (filters, expand, ...).
    pub params: Map<String, Value>,
}

impl PermissionRequest {
    pub fn new(endpoint: impl Into<String>, quantity: Quantity, message: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            quantity,
            message: message.into(),
            params: Map::new(),
        }
    }

    #[must_use]
    pub fn with_params(mut self, params: Map<String, Value>) -> Self {
        self.params = params;
        self
    }

    /// Look up `kind` objects whose attributes equal `filters`.
    ///
    /// Each `(key, value)` becomes a `this_{key}: "={value}"` filter and the
    /// full subtree is expanded. Without a `message` the prompt reads
    /// `Find {quantity} {kind}`, plus `with {key} {value}` when there is
    /// exactly one filter.
    pub fn find<K, V>(
        kind: ModelKind,
        quantity: Quantity,
        filters: &[(K, V)],
        message: Option<String>,
    ) -> Self
    where
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let mut params = Map::new();
        params.insert("expand".into(), json!(kind.expand_depth()));
        for (key, value) in filters {
            params.insert(
                format!("this_{}", key.as_ref()),
                json!(format!("={}", value.as_ref())),
            );
        }

        let message = message.unwrap_or_else(|| match filters {
            [(key, value)] => format!(
                "Find {quantity} {kind} with {} {}",
                key.as_ref(),
                value.as_ref()
            ),
            _ => format!("Find {quantity} {kind}"),
        });
        Self::new(kind.endpoint(), quantity, message).with_params(params)
    }

    /// [`find`](Self::find) on the `name` attribute.
    pub fn find_by_name(kind: ModelKind, name: &str, quantity: Quantity) -> Self {
        Self::find(kind, quantity, &[("name", name)], None)
    }

    /// Stable identifier for this request: `{kind}-{quantity}-{message}`,
    /// where `kind` is the endpoint's object segment (`device` for
    /// `/2.0/device`).
    pub fn identifier(&self) -> String {
        let kind = self.kind_segment().unwrap_or_default();
        format!("{kind}-{}-{}", self.quantity, self.message)
    }

    /// Object kind the endpoint serves, if it names one.
    pub fn kind(&self) -> Option<ModelKind> {
        self.kind_segment()?.parse().ok()
    }

    fn kind_segment(&self) -> Option<&str> {
        self.endpoint.split('/').nth(2)
    }

    fn validate(&self, validation: Validation) -> Result<(), CoreError> {
        if validation == Validation::None {
            return Ok(());
        }
        if self.endpoint.trim_matches('/').is_empty() {
            return Err(CoreError::ValidationFailed {
                message: "permission endpoint is empty".into(),
            });
        }
        if self.quantity == Quantity::Count(0) {
            return Err(CoreError::ValidationFailed {
                message: "quantity must be at least 1".into(),
            });
        }
        if self.message.trim().is_empty() {
            return Err(CoreError::ValidationFailed {
                message: "permission message is empty".into(),
            });
        }
        Ok(())
    }

    fn lookup_params(&self) -> Map<String, Value> {
        let mut params = self.params.clone();
        params.insert("quantity".into(), json!(self.quantity));
        params.insert("message".into(), json!(self.message));
        params.insert("identifier".into(), json!(self.identifier()));
        params.insert("method".into(), json!(["retrieve", "update"]));
        params
    }
}

// ── PermissionNegotiator ─────────────────────────────────────────────

/// Requests access to user data and waits for the user's answer.
///
/// # Liveness
///
/// [`request`](Self::request) and
/// [`create_with_consent`](Self::create_with_consent) wait for as long as
/// the user takes to answer, which may be forever. They end early only
/// when the connection closes for good. Wrap them in
/// [`request_within`](Self::request_within) or a `tokio::time::timeout`
/// when a bound is needed.
#[derive(Clone)]
pub struct PermissionNegotiator {
    api: Arc<dyn RestApi>,
    services: ServiceRegistry,
    validation: Validation,
    reconnect_budget: u32,
}

impl PermissionNegotiator {
    pub fn new(
        api: Arc<dyn RestApi>,
        services: ServiceRegistry,
        validation: Validation,
        reconnect_budget: u32,
    ) -> Self {
        Self {
            api,
            services,
            validation,
            reconnect_budget,
        }
    }

    /// Resolve `request` to the objects the user shares.
    ///
    /// Returns at once when access already exists; otherwise waits for a
    /// grant covering the requested quantity and fetches the granted ids.
    pub async fn request(&self, request: PermissionRequest) -> Result<Vec<Value>, CoreError> {
        request.validate(self.validation)?;
        let mut params = request.lookup_params();

        let existing = self.api.fetch(&request.endpoint, params.clone()).await?;
        if !existing.is_empty() {
            debug!(endpoint = %request.endpoint, count = existing.len(), "access already granted");
            return Ok(existing);
        }

        info!(
            endpoint = %request.endpoint,
            identifier = %request.identifier(),
            "waiting for the user to grant access"
        );

        let (tx, rx) = oneshot::channel::<Vec<String>>();
        let tx = Mutex::new(Some(tx));
        let quantity = request.quantity;
        let _subscription = self
            .services
            .subscribe(NOTIFICATION_TOPIC, move |event| {
                let Some(record) = NotificationRecord::from_event(event) else {
                    return ServiceFlow::Continue;
                };
                if !record.is_grant() {
                    return ServiceFlow::Continue;
                }
                let Some(ids) = quantity.select(record.ids()) else {
                    debug!(granted = record.ids().len(), %quantity, "grant does not cover quantity yet");
                    return ServiceFlow::Continue;
                };
                if let Some(tx) = tx.lock().unwrap_or_else(PoisonError::into_inner).take() {
                    let _ = tx.send(ids);
                }
                ServiceFlow::Done
            })
            .guard();

        let ids = rx.await.map_err(|_| self.closed())?;
        debug!(endpoint = %request.endpoint, ids = ?ids, "access granted");

        params.insert("id".into(), json!(ids));
        self.api.fetch(&request.endpoint, params).await
    }

    /// [`request`](Self::request) bounded by `timeout`.
    ///
    /// On expiry the notification subscription is removed.
    pub async fn request_within(
        &self,
        request: PermissionRequest,
        timeout: Duration,
    ) -> Result<Vec<Value>, CoreError> {
        tokio::time::timeout(timeout, self.request(request))
            .await
            .map_err(|_| CoreError::RequestTimeout {
                timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
            })?
    }

    /// POST `body` to `endpoint`, asking the user for consent first when
    /// the service requires it.
    ///
    /// Every save-grant notification triggers one retry; a failed retry
    /// keeps waiting for the next grant.
    pub async fn create_with_consent(&self, endpoint: &str, body: Value) -> Result<Value, CoreError> {
        let err = match self.api.post(endpoint, Map::new(), body.clone()).await {
            Ok(created) => return Ok(created),
            Err(e) => e,
        };
        if !matches!(err.api_code(), Some(CODE_CONSENT_REQUIRED | CODE_CONSENT_PENDING)) {
            return Err(err);
        }

        info!(%endpoint, "waiting for consent to save data");
        let mut notifications = self.services.stream(NOTIFICATION_TOPIC);
        let mut params = Map::new();
        params.insert("identifier".into(), json!(SAVE_CONSENT_IDENTIFIER));

        while let Some(event) = notifications.next().await {
            let Some(record) = NotificationRecord::from_event(&event) else {
                continue;
            };
            if record.code() != CODE_SAVE_GRANTED {
                continue;
            }
            match self.api.post(endpoint, params.clone(), body.clone()).await {
                Ok(created) => return Ok(created),
                Err(e) => warn!(%endpoint, error = %e, "create after consent failed"),
            }
        }
        Err(self.closed())
    }

    fn closed(&self) -> CoreError {
        CoreError::ReconnectExhausted {
            attempts: self.reconnect_budget,
        }
    }
}

impl fmt::Debug for PermissionNegotiator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PermissionNegotiator")
            .field("validation", &self.validation)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::api::fake::{Call, FakeRest};
    use crate::model::{CODE_ACCESS_GRANTED, StreamEvent};
    use pretty_assertions::assert_eq;
    use wapp_api::EventKind;

    fn ids(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| (*s).to_owned()).collect()
    }

    fn grant(code: i64, granted: &[&str]) -> StreamEvent {
        StreamEvent::new(
            "/notification/n1",
            EventKind::Create,
            json!({ "base": { "code": code, "ids": granted } }),
        )
        .with_meta_object("notification")
    }

    fn negotiator(api: &Arc<FakeRest>, services: &ServiceRegistry) -> PermissionNegotiator {
        PermissionNegotiator::new(
            api.clone(),
            services.clone(),
            Validation::Normal,
            10,
        )
    }

    async fn until_subscribed(services: &ServiceRegistry) {
        while services.is_empty() {
            tokio::task::yield_now().await;
        }
    }

    #[test]
    fn count_selects_last_n_newest_first() {
        let granted = ids(&["a", "b", "c", "d"]);
        assert_eq!(Quantity::Count(2).select(&granted), Some(ids(&["d", "c"])));
        assert_eq!(Quantity::All.select(&granted), Some(granted.clone()));
        assert_eq!(Quantity::Count(5).select(&granted), None);
        assert_eq!(Quantity::All.select(&[]), None);
    }

    #[test]
    fn quantity_wire_form() {
        assert_eq!(json!(Quantity::Count(3)), json!(3));
        assert_eq!(json!(Quantity::All), json!("all"));
        assert_eq!("all".parse::<Quantity>().unwrap(), Quantity::All);
        assert!("many".parse::<Quantity>().is_err());
        let parsed: Quantity = serde_json::from_value(json!(4)).unwrap();
        assert_eq!(parsed, Quantity::Count(4));
    }

    #[test]
    fn identifier_uses_endpoint_kind() {
        let req = PermissionRequest::new("/2.0/device", Quantity::Count(1), "Share a lamp");
        assert_eq!(req.identifier(), "device-1-Share a lamp");
        assert_eq!(req.kind(), Some(ModelKind::Device));
        assert_eq!(PermissionRequest::new("/2.0/thing", Quantity::All, "x").kind(), None);
    }

    #[test]
    fn find_by_name_builds_filter_and_default_message() {
        let req = PermissionRequest::find_by_name(ModelKind::Device, "test", Quantity::Count(1));
        assert_eq!(req.endpoint, "/2.0/device");
        assert_eq!(
            json!(req.lookup_params()),
            json!({
                "expand": 3,
                "this_name": "=test",
                "quantity": 1,
                "message": "Find 1 device with name test",
                "identifier": "device-1-Find 1 device with name test",
                "method": ["retrieve", "update"],
            })
        );
    }

    #[test]
    fn find_keeps_explicit_message_and_all_filters() {
        let req = PermissionRequest::find(
            ModelKind::Value,
            Quantity::All,
            &[("type", "temperature"), ("name", "inside")],
            None,
        );
        assert_eq!(req.message, "Find all value");
        assert_eq!(req.params["this_type"], json!("=temperature"));
        assert_eq!(req.params["this_name"], json!("=inside"));
        assert_eq!(req.params["expand"], json!(2));

        let named = PermissionRequest::find::<&str, &str>(
            ModelKind::Network,
            Quantity::Count(2),
            &[],
            Some("Pick two homes".into()),
        );
        assert_eq!(named.identifier(), "network-2-Pick two homes");
    }

    #[tokio::test]
    async fn existing_access_resolves_without_subscribing() {
        let api = Arc::new(FakeRest::default());
        api.respond(Ok(json!([{ "meta": { "id": "d1" } }])));
        let services = ServiceRegistry::new();

        let found = negotiator(&api, &services)
            .request(PermissionRequest::new("/2.0/device", Quantity::Count(1), "lamp"))
            .await
            .unwrap();

        assert_eq!(found.len(), 1);
        assert!(services.is_empty());
        let calls = api.calls();
        let Call::Fetch(endpoint, params) = &calls[0] else {
            panic!("expected a fetch");
        };
        assert_eq!(endpoint, "/2.0/device");
        assert_eq!(params["quantity"], json!(1));
        assert_eq!(params["method"], json!(["retrieve", "update"]));
        assert_eq!(params["identifier"], json!("device-1-lamp"));
    }

    #[tokio::test]
    async fn grant_triggers_confirming_fetch_with_selected_ids() {
        let api = Arc::new(FakeRest::default());
        api.respond(Ok(json!([])))
            .respond(Ok(json!([{ "meta": { "id": "d" } }, { "meta": { "id": "c" } }])));
        let services = ServiceRegistry::new();

        let task = tokio::spawn({
            let negotiator = negotiator(&api, &services);
            async move {
                negotiator
                    .request(PermissionRequest::new("/2.0/device", Quantity::Count(2), "two"))
                    .await
            }
        });
        until_subscribed(&services).await;

        // Not enough ids yet, then a non-grant code.
        services.dispatch(&grant(CODE_ACCESS_GRANTED, &["a"]));
        services.dispatch(&grant(1_100_001, &["a", "b", "c", "d"]));
        assert_eq!(services.len(), 1);
        services.dispatch(&grant(CODE_ACCESS_GRANTED, &["a", "b", "c", "d"]));

        let found = task.await.unwrap().unwrap();
        assert_eq!(found.len(), 2);
        assert!(services.is_empty());

        let calls = api.calls();
        let Call::Fetch(_, params) = &calls[1] else {
            panic!("expected a confirming fetch");
        };
        assert_eq!(params["id"], json!(["d", "c"]));
    }

    #[tokio::test]
    async fn non_notification_events_are_ignored() {
        let api = Arc::new(FakeRest::default());
        let services = ServiceRegistry::new();
        let task = tokio::spawn({
            let negotiator = negotiator(&api, &services);
            async move {
                negotiator
                    .request(PermissionRequest::new("/2.0/network", Quantity::All, "all"))
                    .await
            }
        });
        until_subscribed(&services).await;

        let plain = StreamEvent::new(
            "/notification/x",
            EventKind::Create,
            json!({ "base": { "code": CODE_ACCESS_GRANTED, "ids": ["n1"] } }),
        );
        services.dispatch(&plain);
        assert_eq!(services.len(), 1);

        services.close();
        let err = task.await.unwrap().unwrap_err();
        assert!(matches!(err, CoreError::ReconnectExhausted { attempts: 10 }));
    }

    #[tokio::test(start_paused = true)]
    async fn request_within_times_out_and_unsubscribes() {
        let api = Arc::new(FakeRest::default());
        let services = ServiceRegistry::new();

        let err = negotiator(&api, &services)
            .request_within(
                PermissionRequest::new("/2.0/device", Quantity::Count(1), "lamp"),
                Duration::from_secs(5),
            )
            .await
            .unwrap_err();

        assert!(matches!(err, CoreError::RequestTimeout { timeout_ms: 5000 }));
        assert!(services.is_empty());
    }

    #[tokio::test]
    async fn invalid_arguments_rejected_before_any_call() {
        let api = Arc::new(FakeRest::default());
        let services = ServiceRegistry::new();
        let err = negotiator(&api, &services)
            .request(PermissionRequest::new("/2.0/device", Quantity::Count(0), "none"))
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::ValidationFailed { .. }));
        assert!(api.calls().is_empty());
    }

    #[tokio::test]
    async fn create_retries_after_save_grant() {
        let api = Arc::new(FakeRest::default());
        api.respond(Err(CoreError::Api {
            message: "consent required".into(),
            code: Some(CODE_CONSENT_REQUIRED),
            status: Some(400),
        }))
        .respond(Ok(json!({ "meta": { "id": "net1", "type": "network" } })));
        let services = ServiceRegistry::new();

        let task = tokio::spawn({
            let negotiator = negotiator(&api, &services);
            async move {
                negotiator
                    .create_with_consent("/2.0/network", json!({ "name": "home" }))
                    .await
            }
        });
        until_subscribed(&services).await;
        services.dispatch(&grant(CODE_SAVE_GRANTED, &[]));

        let created = task.await.unwrap().unwrap();
        assert_eq!(created["meta"]["id"], json!("net1"));

        let calls = api.calls();
        let Call::Post(_, params, body) = &calls[1] else {
            panic!("expected a retried post");
        };
        assert_eq!(params["identifier"], json!(SAVE_CONSENT_IDENTIFIER));
        assert_eq!(body["name"], json!("home"));
    }

    #[tokio::test]
    async fn create_keeps_waiting_after_failed_retry() {
        let api = Arc::new(FakeRest::default());
        api.respond(Err(CoreError::Api {
            message: "consent required".into(),
            code: Some(CODE_CONSENT_REQUIRED),
            status: Some(400),
        }))
        .respond(Err(CoreError::Api {
            message: "still pending".into(),
            code: Some(CODE_CONSENT_PENDING),
            status: Some(400),
        }))
        .respond(Ok(json!({ "meta": { "id": "net1", "type": "network" } })));
        let services = ServiceRegistry::new();

        let task = tokio::spawn({
            let negotiator = negotiator(&api, &services);
            async move {
                negotiator
                    .create_with_consent("/2.0/network", json!({ "name": "home" }))
                    .await
            }
        });
        until_subscribed(&services).await;
        services.dispatch(&grant(CODE_SAVE_GRANTED, &[]));
        while api.calls().len() < 2 {
            tokio::task::yield_now().await;
        }
        assert!(!task.is_finished());
        services.dispatch(&grant(CODE_SAVE_GRANTED, &[]));

        let created = task.await.unwrap().unwrap();
        assert_eq!(created["meta"]["id"], json!("net1"));

        let calls = api.calls();
        assert_eq!(calls.len(), 3);
        assert!(calls.iter().all(|c| matches!(c, Call::Post(..))));
        let Call::Post(_, params, _) = &calls[2] else {
            panic!("expected a second retried post");
        };
        assert_eq!(params["identifier"], json!(SAVE_CONSENT_IDENTIFIER));
    }

    #[tokio::test]
    async fn create_passes_through_other_errors() {
        let api = Arc::new(FakeRest::default());
        api.respond(Err(CoreError::Api {
            message: "bad".into(),
            code: Some(300_098),
            status: Some(400),
        }));
        let services = ServiceRegistry::new();

        let err = negotiator(&api, &services)
            .create_with_consent("/2.0/network", json!({}))
            .await
            .unwrap_err();
        assert_eq!(err.api_code(), Some(300_098));
        assert!(services.is_empty());
    }
}
