// ── Runtime ──
//
// Owns one stream connection and everything that consumes it: the object
// registry, the service subscriptions, the request correlator, and the
// single task that routes inbound frames to them in arrival order.

use std::sync::Arc;

use arc_swap::ArcSwapOption;
use serde_json::{Map, Value};
use tokio::sync::{Mutex, mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use wapp_api::{
    ConnectionState, FrameSink, RestClient, TlsMode, TransportConfig, WebSocketHandle,
};

use crate::api::RestApi;
use crate::config::{RuntimeConfig, TlsVerification};
use crate::correlator::RequestCorrelator;
use crate::error::CoreError;
use crate::model::{ModelKind, RemoteObject, StreamEvent, StreamModel};
use crate::oauth::OAuthTokens;
use crate::permission::{PermissionNegotiator, PermissionRequest};
use crate::registry::ObjectRegistry;
use crate::router::EventRouter;
use crate::subscription::ServiceRegistry;

// ── ConnectionSlot ───────────────────────────────────────────────────

/// The socket outbound requests go through. Empty while disconnected.
#[derive(Default)]
struct ConnectionSlot {
    current: ArcSwapOption<WebSocketHandle>,
}

impl FrameSink for ConnectionSlot {
    fn send_frame(&self, frame: String) -> Result<(), wapp_api::Error> {
        match self.current.load().as_deref() {
            Some(handle) => handle.send(frame),
            None => Err(wapp_api::Error::NotConnected),
        }
    }
}

// ── Runtime ──────────────────────────────────────────────────────────

/// A stream-synchronised object runtime.
///
/// Cheaply cloneable; clones share one connection. Nothing is global:
/// create as many runtimes as there are sessions.
#[derive(Clone)]
pub struct Runtime {
    inner: Arc<RuntimeInner>,
}

struct RuntimeInner {
    config: RuntimeConfig,
    api: Arc<dyn RestApi>,
    objects: Arc<ObjectRegistry>,
    services: ServiceRegistry,
    correlator: Arc<RequestCorrelator>,
    router: Arc<EventRouter>,
    permissions: PermissionNegotiator,
    oauth: OAuthTokens,
    slot: Arc<ConnectionSlot>,
    connection_state: watch::Sender<ConnectionState>,
    /// Held for the whole of `connect` so concurrent calls open one socket.
    connect_lock: Mutex<()>,
    cancel: CancellationToken,
    /// Child token for the current connection; replaced on every connect.
    cancel_child: Mutex<CancellationToken>,
    task_handles: Mutex<Vec<JoinHandle<()>>>,
}

impl Drop for RuntimeInner {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl Runtime {
    /// Create a runtime with an HTTP client built from `config`. Does not
    /// connect; call [`connect`](Self::connect).
    pub fn new(config: RuntimeConfig) -> Result<Self, CoreError> {
        let client = RestClient::new(config.base_url.clone(), &transport_for(&config))?
            .with_verbose(config.verbose);
        Ok(Self::with_api(config, Arc::new(client)))
    }

    /// Create a runtime over a caller-supplied REST implementation.
    pub fn with_api(config: RuntimeConfig, api: Arc<dyn RestApi>) -> Self {
        let objects = Arc::new(ObjectRegistry::new());
        let services = ServiceRegistry::new();
        let slot = Arc::new(ConnectionSlot::default());
        let sink: Arc<dyn FrameSink> = slot.clone();
        let correlator = Arc::new(RequestCorrelator::new(sink, config.request_timeout));
        let router = Arc::new(EventRouter::new(
            Arc::clone(&objects),
            services.clone(),
            Arc::clone(&correlator),
            config.validation,
        ));
        let budget = config.reconnect.max_retries;
        let permissions =
            PermissionNegotiator::new(Arc::clone(&api), services.clone(), config.validation, budget);
        let oauth = OAuthTokens::new(Arc::clone(&api), services.clone(), budget);
        let (connection_state, _) = watch::channel(ConnectionState::Disconnected);
        let cancel = CancellationToken::new();
        let cancel_child = cancel.child_token();

        Self {
            inner: Arc::new(RuntimeInner {
                config,
                api,
                objects,
                services,
                correlator,
                router,
                permissions,
                oauth,
                slot,
                connection_state,
                connect_lock: Mutex::new(()),
                cancel,
                cancel_child: Mutex::new(cancel_child),
                task_handles: Mutex::new(Vec::new()),
            }),
        }
    }

    // ── Connection lifecycle ─────────────────────────────────────

    /// Open the stream and start routing frames.
    ///
    /// Resolves once the first connection is up. Fails with
    /// [`CoreError::ReconnectExhausted`] if the reconnect budget runs out
    /// first, or if an earlier connection already closed for good.
    pub async fn connect(&self) -> Result<(), CoreError> {
        let _connecting = self.inner.connect_lock.lock().await;
        if self.connection_state() == ConnectionState::Closed {
            return Err(CoreError::ReconnectExhausted {
                attempts: self.inner.config.reconnect.max_retries,
            });
        }
        if self.inner.slot.current.load().is_some() {
            debug!("already connected");
            return Ok(());
        }

        let child = self.inner.cancel.child_token();
        *self.inner.cancel_child.lock().await = child.clone();

        let config = &self.inner.config;
        let (handle, inbound) = WebSocketHandle::spawn(
            config.stream_url.clone(),
            config.reconnect.clone(),
            config.session.clone(),
            child.clone(),
        );
        self.inner.slot.current.store(Some(Arc::new(handle.clone())));

        let task = tokio::spawn(dispatch_task(
            Dispatch {
                router: Arc::clone(&self.inner.router),
                correlator: Arc::clone(&self.inner.correlator),
                services: self.inner.services.clone(),
                state_tx: self.inner.connection_state.clone(),
                max_retries: config.reconnect.max_retries,
            },
            inbound,
            handle.state(),
            child,
        ));
        self.inner.task_handles.lock().await.push(task);

        info!(url = %config.stream_url, "stream spawned (handshake in progress)");
        handle.wait_connected().await?;
        Ok(())
    }

    /// Close the stream and stop routing.
    ///
    /// Registered objects and service subscriptions stay in place; a later
    /// [`connect`](Self::connect) resumes delivery to them.
    pub async fn disconnect(&self) {
        self.inner.cancel_child.lock().await.cancel();

        let mut handles = self.inner.task_handles.lock().await;
        for handle in handles.drain(..) {
            let _ = handle.await;
        }

        if let Some(handle) = self.inner.slot.current.swap(None) {
            handle.shutdown();
        }

        if self.connection_state() != ConnectionState::Closed {
            let _ = self
                .inner
                .connection_state
                .send_replace(ConnectionState::Disconnected);
        }
        debug!("disconnected");
    }

    // ── Accessors ────────────────────────────────────────────────

    pub fn config(&self) -> &RuntimeConfig {
        &self.inner.config
    }

    pub fn api(&self) -> &Arc<dyn RestApi> {
        &self.inner.api
    }

    pub fn objects(&self) -> &Arc<ObjectRegistry> {
        &self.inner.objects
    }

    pub fn services(&self) -> &ServiceRegistry {
        &self.inner.services
    }

    pub fn correlator(&self) -> &Arc<RequestCorrelator> {
        &self.inner.correlator
    }

    pub fn permissions(&self) -> &PermissionNegotiator {
        &self.inner.permissions
    }

    pub fn oauth(&self) -> &OAuthTokens {
        &self.inner.oauth
    }

    pub fn connection_state(&self) -> ConnectionState {
        *self.inner.connection_state.borrow()
    }

    /// Watch connection state changes.
    pub fn watch_connection_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.connection_state.subscribe()
    }

    /// The most recent event received on the stream.
    pub fn last_event(&self) -> Option<Arc<StreamEvent>> {
        self.inner.router.last_event()
    }

    // ── Operations ───────────────────────────────────────────────

    /// Send a request over the stream and wait for its response.
    pub async fn send_request(&self, method: &str, params: Value) -> Result<Value, CoreError> {
        self.inner.correlator.send_request(method, params).await
    }

    /// GET one object and register it for stream updates.
    pub async fn load(&self, kind: ModelKind, id: &str) -> Result<Arc<RemoteObject>, CoreError> {
        let endpoint = format!("{}/{id}", kind.endpoint());
        let body = self
            .inner
            .api
            .fetch(&endpoint, Map::new())
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| CoreError::NoMatchingObject {
                path: format!("/{kind}/{id}"),
            })?;

        let object = Arc::new(RemoteObject::from_json(Some(kind), &body)?);
        self.inner.objects.register(object.clone());
        debug!(path = %object.endpoint(), "object loaded");
        Ok(object)
    }

    /// POST a new object and register the created result.
    ///
    /// Waits for the user's consent when the service asks for it; see
    /// [`PermissionNegotiator::create_with_consent`].
    pub async fn create(
        &self,
        kind: ModelKind,
        attributes: Map<String, Value>,
    ) -> Result<Arc<RemoteObject>, CoreError> {
        let body = self
            .inner
            .permissions
            .create_with_consent(&kind.endpoint(), Value::Object(attributes))
            .await?;

        let object = Arc::new(RemoteObject::from_json(Some(kind), &body)?);
        self.inner.objects.register(object.clone());
        debug!(path = %object.endpoint(), "object created");
        Ok(object)
    }

    /// PUT the object's current state and merge what the service returns.
    pub async fn update(&self, object: &RemoteObject) -> Result<(), CoreError> {
        let endpoint = object.endpoint();
        let body = self.inner.api.put(&endpoint, object.to_json()).await?;
        if let Value::Object(attributes) = &body {
            object.merge(attributes);
        }
        debug!(path = %endpoint, "object updated");
        Ok(())
    }

    /// DELETE the object and stop tracking it.
    ///
    /// The object leaves the registry and its parent's children; later
    /// stream events for its path are dropped.
    pub async fn delete(&self, object: &RemoteObject) -> Result<(), CoreError> {
        let endpoint = object.endpoint();
        self.inner.api.delete(&endpoint).await?;
        self.inner.router.forget(object.path(), object.parent_path());
        debug!(path = %endpoint, "object deleted");
        Ok(())
    }

    /// Resolve a permission request and register every object it returns.
    pub async fn find(&self, request: PermissionRequest) -> Result<Vec<Arc<RemoteObject>>, CoreError> {
        let kind = request.kind();
        let found = self.inner.permissions.request(request).await?;
        found
            .iter()
            .map(|body| -> Result<_, CoreError> {
                let object = Arc::new(RemoteObject::from_json(kind, body)?);
                self.inner.objects.register(object.clone());
                Ok(object)
            })
            .collect()
    }
}

fn transport_for(config: &RuntimeConfig) -> TransportConfig {
    let tls = match &config.tls {
        TlsVerification::SystemDefaults => TlsMode::System,
        TlsVerification::CustomCa(path) => TlsMode::CustomCa(path.clone()),
        TlsVerification::DangerAcceptInvalid => TlsMode::DangerAcceptInvalid,
    };
    TransportConfig {
        tls,
        timeout: config.request_timeout,
        session: config.session.clone(),
    }
}

// ── Dispatch task ────────────────────────────────────────────────────

/// What the dispatch task feeds.
struct Dispatch {
    router: Arc<EventRouter>,
    correlator: Arc<RequestCorrelator>,
    services: ServiceRegistry,
    state_tx: watch::Sender<ConnectionState>,
    max_retries: u32,
}

impl Dispatch {
    fn publish(&self, state: ConnectionState) {
        let previous = self.state_tx.send_replace(state);
        if previous != state {
            debug!(from = %previous, to = %state, "connection state changed");
        }
    }

    /// The connection is gone for good: nothing waiting on it can finish.
    fn close(&self) {
        warn!(
            attempts = self.max_retries,
            pending = self.correlator.pending_count(),
            "stream closed, failing pending work"
        );
        self.correlator.fail_all(self.max_retries);
        self.services.close();
    }
}

/// Route inbound frames one at a time, in arrival order, and mirror the
/// socket's state until the connection ends.
async fn dispatch_task(
    dispatch: Dispatch,
    mut inbound: mpsc::UnboundedReceiver<String>,
    mut ws_state: watch::Receiver<ConnectionState>,
    cancel: CancellationToken,
) {
    let mut inbound_open = true;

    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => return,
            changed = ws_state.changed() => {
                if changed.is_err() {
                    break;
                }
                let state = *ws_state.borrow_and_update();
                dispatch.publish(state);
                if state == ConnectionState::Closed {
                    break;
                }
            }
            frame = inbound.recv(), if inbound_open => match frame {
                Some(text) => {
                    dispatch.router.route(&text);
                }
                None => inbound_open = false,
            },
        }
    }

    // Frames already received still reach their consumers.
    while let Ok(text) = inbound.try_recv() {
        dispatch.router.route(&text);
    }

    let last = *ws_state.borrow();
    dispatch.publish(last);
    if last == ConnectionState::Closed {
        dispatch.close();
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::api::fake::{Call, FakeRest};
    use crate::model::StreamModel;
    use serde_json::json;
    use url::Url;

    fn runtime(api: &Arc<FakeRest>) -> Runtime {
        let config = RuntimeConfig::new(Url::parse("http://127.0.0.1:9/services").unwrap()).unwrap();
        Runtime::with_api(config, api.clone())
    }

    #[tokio::test]
    async fn request_without_connection_is_not_connected() {
        let rt = runtime(&Arc::new(FakeRest::default()));
        let err = rt.send_request("GET", json!({})).await.unwrap_err();
        assert!(matches!(err, CoreError::NotConnected));
        assert_eq!(rt.correlator().pending_count(), 0);
    }

    #[tokio::test]
    async fn load_registers_object() {
        let api = Arc::new(FakeRest::default());
        api.respond(Ok(json!({ "name": "lamp", "meta": { "id": "123", "type": "device" } })));
        let rt = runtime(&api);

        let device = rt.load(ModelKind::Device, "123").await.unwrap();

        assert_eq!(device.attribute("name"), Some(json!("lamp")));
        assert!(rt.objects().contains(device.path()));
        assert_eq!(
            api.calls(),
            vec![Call::Fetch("/2.0/device/123".into(), Map::new())]
        );
    }

    #[tokio::test]
    async fn load_of_missing_object_is_no_matching_object() {
        let api = Arc::new(FakeRest::default());
        api.respond(Ok(json!([])));
        let err = runtime(&api).load(ModelKind::Network, "gone").await.unwrap_err();
        assert!(matches!(err, CoreError::NoMatchingObject { ref path } if path == "/network/gone"));
    }

    #[tokio::test]
    async fn create_registers_result() {
        let api = Arc::new(FakeRest::default());
        api.respond(Ok(json!({ "name": "home", "meta": { "id": "n1", "type": "network" } })));
        let rt = runtime(&api);

        let mut attrs = Map::new();
        attrs.insert("name".into(), json!("home"));
        let network = rt.create(ModelKind::Network, attrs).await.unwrap();

        assert_eq!(network.id(), "n1");
        assert_eq!(rt.objects().len(), 1);
    }

    #[tokio::test]
    async fn update_puts_state_and_merges_reply() {
        let api = Arc::new(FakeRest::default());
        api.respond(Ok(json!({ "name": "lamp", "meta": { "id": "123", "type": "device" } })))
            .respond(Ok(json!({ "name": "lamp", "status": "ok", "meta": { "id": "123" } })));
        let rt = runtime(&api);
        let device = rt.load(ModelKind::Device, "123").await.unwrap();
        let revision = device.snapshot().revision;

        rt.update(&device).await.unwrap();

        assert_eq!(device.attribute("status"), Some(json!("ok")));
        assert!(device.snapshot().revision > revision);
        let calls = api.calls();
        let Call::Put(endpoint, body) = &calls[1] else {
            panic!("expected a put");
        };
        assert_eq!(endpoint, "/2.0/device/123");
        assert_eq!(body["name"], json!("lamp"));
        assert_eq!(body["meta"]["id"], json!("123"));
    }

    #[tokio::test]
    async fn delete_unregisters_and_detaches_from_parent() {
        let api = Arc::new(FakeRest::default());
        let rt = runtime(&api);
        let network = Arc::new(RemoteObject::new(ModelKind::Network, "n1", Map::new()));
        rt.objects().register(network.clone());
        rt.inner.router.route(
            r#"{"path":"/network/n1/device","event":"create","data":{"meta":{"id":"d9","type":"device"}}}"#,
        );
        let device = network.children().pop().unwrap();
        assert!(rt.objects().contains(device.path()));

        rt.delete(&device).await.unwrap();

        assert_eq!(api.calls(), vec![Call::Delete("/2.0/device/d9".into())]);
        assert!(!rt.objects().contains(device.path()));
        assert!(network.children().is_empty());
        assert!(rt.objects().contains(network.path()));
    }

    #[tokio::test]
    async fn failed_delete_keeps_object() {
        let api = Arc::new(FakeRest::default());
        api.respond(Err(CoreError::Api {
            message: "forbidden".into(),
            code: None,
            status: Some(403),
        }));
        let rt = runtime(&api);
        let device = Arc::new(RemoteObject::new(ModelKind::Device, "d1", Map::new()));
        rt.objects().register(device.clone());

        assert!(rt.delete(&device).await.is_err());
        assert!(rt.objects().contains(device.path()));
    }

    #[tokio::test]
    async fn find_registers_shared_objects() {
        let api = Arc::new(FakeRest::default());
        api.respond(Ok(json!([{ "name": "test", "meta": { "id": "d1", "type": "device" } }])));
        let rt = runtime(&api);

        let found = rt
            .find(PermissionRequest::find_by_name(
                ModelKind::Device,
                "test",
                crate::permission::Quantity::Count(1),
            ))
            .await
            .unwrap();

        assert_eq!(found.len(), 1);
        assert_eq!(found[0].kind(), ModelKind::Device);
        assert!(rt.objects().contains(found[0].path()));
        let calls = api.calls();
        let Call::Fetch(endpoint, params) = &calls[0] else {
            panic!("expected a fetch");
        };
        assert_eq!(endpoint, "/2.0/device");
        assert_eq!(params["this_name"], json!("=test"));
    }

    #[test]
    fn empty_slot_refuses_frames() {
        let slot = ConnectionSlot::default();
        assert!(matches!(
            slot.send_frame("{}".into()),
            Err(wapp_api::Error::NotConnected)
        ));
    }
}
