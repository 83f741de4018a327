// ── Service subscriptions ──
//
// Long-lived handlers keyed by path prefix. Every active subscription
// whose prefix covers an event's path is invoked, in registration order,
// until its handler reports `ServiceFlow::Done`.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::task::{Context, Poll};

use futures_core::Stream;
use futures_util::future::BoxFuture;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, trace};

use crate::model::{ModelPath, StreamEvent};

/// Whether a handler wants further events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceFlow {
    Continue,
    /// Remove the subscription.
    Done,
}

type SyncHandler = Box<dyn Fn(&StreamEvent) -> ServiceFlow + Send + Sync>;
type AsyncHandler = Box<dyn Fn(StreamEvent) -> BoxFuture<'static, ServiceFlow> + Send + Sync>;

enum Handler {
    Sync(SyncHandler),
    Async(AsyncHandler),
}

struct Subscription {
    id: u64,
    prefix: ModelPath,
    handler: Handler,
    active: AtomicBool,
}

impl Subscription {
    fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }
}

#[derive(Default)]
struct Inner {
    subscriptions: Mutex<Vec<Arc<Subscription>>>,
    next_id: AtomicU64,
    closed: AtomicBool,
}

impl Inner {
    fn remove(&self, id: u64) {
        let mut subs = self
            .subscriptions
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        subs.retain(|s| {
            if s.id == id {
                s.active.store(false, Ordering::Release);
                false
            } else {
                true
            }
        });
    }
}

// ── ServiceRegistry ──────────────────────────────────────────────────

/// Registry of service subscriptions.
///
/// Cheaply cloneable; clones share one table. Dispatch takes a snapshot of
/// the matching subscriptions and releases the lock before invoking any
/// handler, so handlers may subscribe or unsubscribe freely.
#[derive(Clone, Default)]
pub struct ServiceRegistry {
    inner: Arc<Inner>,
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe a synchronous handler to every path under `prefix`.
    pub fn subscribe(
        &self,
        prefix: impl Into<ModelPath>,
        handler: impl Fn(&StreamEvent) -> ServiceFlow + Send + Sync + 'static,
    ) -> SubscriptionHandle {
        self.insert(prefix.into(), Handler::Sync(Box::new(handler)))
    }

    /// Subscribe an async handler.
    ///
    /// Each matching event spawns the handler's future; when a future
    /// resolves to `Done` the subscription is removed. Events arriving
    /// while a future is pending still start new invocations.
    pub fn subscribe_async<F, Fut>(&self, prefix: impl Into<ModelPath>, handler: F) -> SubscriptionHandle
    where
        F: Fn(StreamEvent) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ServiceFlow> + Send + 'static,
    {
        let boxed: AsyncHandler = Box::new(move |event| Box::pin(handler(event)));
        self.insert(prefix.into(), Handler::Async(boxed))
    }

    /// Stream every event under `prefix`.
    ///
    /// The subscription lives as long as the stream; the stream ends when
    /// the registry is closed.
    pub fn stream(&self, prefix: impl Into<ModelPath>) -> ServiceStream {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = self.subscribe(prefix, move |event| {
            if tx.send(event.clone()).is_ok() {
                ServiceFlow::Continue
            } else {
                ServiceFlow::Done
            }
        });
        ServiceStream {
            inner: UnboundedReceiverStream::new(rx),
            handle,
        }
    }

    fn insert(&self, prefix: ModelPath, handler: Handler) -> SubscriptionHandle {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let handle = SubscriptionHandle {
            id,
            prefix: prefix.clone(),
            registry: Arc::downgrade(&self.inner),
        };

        if self.inner.closed.load(Ordering::Acquire) {
            // Dropping the handler closes whatever channel it owns.
            debug!(%prefix, "registry closed, subscription discarded");
            return handle;
        }

        debug!(%prefix, id, "service subscription added");
        self.inner
            .subscriptions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Arc::new(Subscription {
                id,
                prefix,
                handler,
                active: AtomicBool::new(true),
            }));
        handle
    }

    /// Whether any active subscription covers `path`.
    pub fn matches(&self, path: &ModelPath) -> bool {
        self.inner
            .subscriptions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .any(|s| s.is_active() && path.starts_with(&s.prefix))
    }

    /// Deliver `event` to every matching subscription.
    ///
    /// Returns the number of handlers invoked.
    pub fn dispatch(&self, event: &StreamEvent) -> usize {
        let matching: Vec<Arc<Subscription>> = self
            .inner
            .subscriptions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|s| s.is_active() && event.path.starts_with(&s.prefix))
            .cloned()
            .collect();

        let mut invoked = 0;
        for sub in matching {
            // Unsubscribed by an earlier handler in this same dispatch.
            if !sub.is_active() {
                continue;
            }
            invoked += 1;
            trace!(id = sub.id, path = %event.path, "dispatching service event");

            match &sub.handler {
                Handler::Sync(handler) => {
                    if handler(event) == ServiceFlow::Done {
                        self.inner.remove(sub.id);
                    }
                }
                Handler::Async(handler) => {
                    let fut = handler(event.clone());
                    let inner = Arc::downgrade(&self.inner);
                    let id = sub.id;
                    tokio::spawn(async move {
                        if fut.await == ServiceFlow::Done {
                            if let Some(inner) = inner.upgrade() {
                                inner.remove(id);
                            }
                        }
                    });
                }
            }
        }
        invoked
    }

    pub fn len(&self) -> usize {
        self.inner
            .subscriptions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every subscription and refuse new ones.
    ///
    /// Handlers are dropped with their captured channels, so anything
    /// waiting on one observes a closed channel.
    pub fn close(&self) {
        self.inner.closed.store(true, Ordering::Release);
        let drained: Vec<Arc<Subscription>> = self
            .inner
            .subscriptions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        for sub in &drained {
            sub.active.store(false, Ordering::Release);
        }
        debug!(count = drained.len(), "service registry closed");
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }
}

// ── SubscriptionHandle ───────────────────────────────────────────────

/// Handle to one subscription. Dropping it does not unsubscribe.
#[derive(Debug, Clone)]
pub struct SubscriptionHandle {
    id: u64,
    prefix: ModelPath,
    registry: Weak<Inner>,
}

impl SubscriptionHandle {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn prefix(&self) -> &ModelPath {
        &self.prefix
    }

    /// Deactivate and remove the subscription. Idempotent.
    pub fn unsubscribe(&self) {
        if let Some(inner) = self.registry.upgrade() {
            inner.remove(self.id);
        }
    }

    /// Tie the subscription's lifetime to the returned guard.
    pub fn guard(self) -> SubscriptionGuard {
        SubscriptionGuard(self)
    }

    pub fn is_active(&self) -> bool {
        self.registry.upgrade().is_some_and(|inner| {
            inner
                .subscriptions
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .iter()
                .any(|s| s.id == self.id && s.is_active())
        })
    }
}

/// Unsubscribes when dropped.
#[derive(Debug)]
pub struct SubscriptionGuard(SubscriptionHandle);

impl Drop for SubscriptionGuard {
    fn drop(&mut self) {
        self.0.unsubscribe();
    }
}

// ── ServiceStream ────────────────────────────────────────────────────

/// `Stream` of events under one prefix. Unsubscribes on drop.
pub struct ServiceStream {
    inner: UnboundedReceiverStream<StreamEvent>,
    handle: SubscriptionHandle,
}

impl ServiceStream {
    pub fn handle(&self) -> &SubscriptionHandle {
        &self.handle
    }
}

impl Stream for ServiceStream {
    type Item = StreamEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.inner).poll_next(cx)
    }
}

impl Drop for ServiceStream {
    fn drop(&mut self) {
        self.handle.unsubscribe();
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use super::*;
    use futures_util::StreamExt;
    use serde_json::json;
    use wapp_api::EventKind;

    fn event(path: &str) -> StreamEvent {
        StreamEvent::new(path, EventKind::Create, json!({}))
    }

    fn counter() -> (Arc<AtomicUsize>, Arc<AtomicUsize>) {
        let c = Arc::new(AtomicUsize::new(0));
        (Arc::clone(&c), c)
    }

    #[test]
    fn prefix_subscription_receives_nested_path_once() {
        let registry = ServiceRegistry::new();
        let (hits, seen) = counter();
        registry.subscribe("/notification", move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
            ServiceFlow::Continue
        });

        assert_eq!(registry.dispatch(&event("/notification/abc")), 1);
        assert_eq!(registry.dispatch(&event("/notifications")), 0);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn done_removes_subscription() {
        let registry = ServiceRegistry::new();
        let (hits, seen) = counter();
        let handle = registry.subscribe("notification", move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
            ServiceFlow::Done
        });

        registry.dispatch(&event("notification"));
        registry.dispatch(&event("notification"));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert!(!handle.is_active());
        assert!(registry.is_empty());
    }

    #[test]
    fn unsubscribe_during_dispatch_spares_others() {
        let registry = ServiceRegistry::new();
        let (second_hits, seen) = counter();

        // The first handler removes the second one mid-dispatch.
        let victim: Arc<Mutex<Option<SubscriptionHandle>>> = Arc::new(Mutex::new(None));
        let target = Arc::clone(&victim);
        registry.subscribe("oauth_connect", move |_| {
            if let Some(handle) = target.lock().unwrap().as_ref() {
                handle.unsubscribe();
            }
            ServiceFlow::Continue
        });
        let second = registry.subscribe("oauth_connect", move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
            ServiceFlow::Continue
        });
        let (third_hits, third_seen) = counter();
        registry.subscribe("oauth_connect", move |_| {
            third_seen.fetch_add(1, Ordering::SeqCst);
            ServiceFlow::Continue
        });
        *victim.lock().unwrap() = Some(second);

        assert_eq!(registry.dispatch(&event("oauth_connect")), 2);
        assert_eq!(second_hits.load(Ordering::SeqCst), 0);
        assert_eq!(third_hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn handlers_run_in_registration_order() {
        let registry = ServiceRegistry::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        for n in 0..3 {
            let order = Arc::clone(&order);
            registry.subscribe("notification", move |_| {
                order.lock().unwrap().push(n);
                ServiceFlow::Continue
            });
        }
        registry.dispatch(&event("notification/x"));
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn async_done_removes_after_future_resolves() {
        let registry = ServiceRegistry::new();
        let handle = registry.subscribe_async("notification", |_| async { ServiceFlow::Done });

        registry.dispatch(&event("notification"));
        // Let the spawned handler run.
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert!(!handle.is_active());
    }

    #[tokio::test]
    async fn stream_yields_events_and_ends_on_close() {
        let registry = ServiceRegistry::new();
        let mut stream = registry.stream("notification");

        registry.dispatch(&event("notification/1"));
        registry.dispatch(&event("device/1"));
        registry.dispatch(&event("notification/2"));
        registry.close();

        let paths: Vec<String> = (&mut stream)
            .map(|e| e.path.as_str().to_owned())
            .collect()
            .await;
        assert_eq!(paths, vec!["notification/1", "notification/2"]);
        assert!(registry.is_closed());
    }

    #[test]
    fn subscribe_after_close_is_inert() {
        let registry = ServiceRegistry::new();
        registry.close();
        let handle = registry.subscribe("notification", |_| ServiceFlow::Continue);
        assert!(!handle.is_active());
        assert_eq!(registry.dispatch(&event("notification")), 0);
    }
}
