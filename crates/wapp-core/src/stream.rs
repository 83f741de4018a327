// ── Reactive object streams ──
//
// Subscription type for consuming state changes of a single object.

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures_core::Stream;
use tokio::sync::watch;
use tokio_stream::wrappers::WatchStream;

use crate::model::ObjectSnapshot;

/// A subscription to one object's state.
///
/// Provides both point-in-time snapshot access and reactive change
/// notification via [`changed`](Self::changed) or by converting to a
/// `Stream`.
pub struct ModelStream {
    current: Arc<ObjectSnapshot>,
    receiver: watch::Receiver<Arc<ObjectSnapshot>>,
}

impl ModelStream {
    pub(crate) fn new(receiver: watch::Receiver<Arc<ObjectSnapshot>>) -> Self {
        let current = receiver.borrow().clone();
        Self { current, receiver }
    }

    /// The snapshot captured at creation time (or at the last `changed`).
    pub fn current(&self) -> &Arc<ObjectSnapshot> {
        &self.current
    }

    /// The latest snapshot.
    pub fn latest(&self) -> Arc<ObjectSnapshot> {
        self.receiver.borrow().clone()
    }

    /// Wait for the next change, returning the new snapshot.
    /// Returns `None` once the object has been dropped.
    pub async fn changed(&mut self) -> Option<Arc<ObjectSnapshot>> {
        self.receiver.changed().await.ok()?;
        let snap = self.receiver.borrow_and_update().clone();
        self.current = Arc::clone(&snap);
        Some(snap)
    }

    /// Convert into a `Stream` for use with `StreamExt` combinators.
    pub fn into_stream(self) -> ModelWatchStream {
        ModelWatchStream {
            inner: WatchStream::new(self.receiver),
        }
    }
}

/// `Stream` adapter backed by a `watch::Receiver`.
///
/// Yields the current snapshot first, then one per mutation.
pub struct ModelWatchStream {
    inner: WatchStream<Arc<ObjectSnapshot>>,
}

impl Stream for ModelWatchStream {
    type Item = Arc<ObjectSnapshot>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.inner).poll_next(cx)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use futures_util::StreamExt;
    use serde_json::{Map, json};

    use crate::model::{ModelKind, RemoteObject};

    fn named(name: &str) -> Map<String, serde_json::Value> {
        let mut attrs = Map::new();
        attrs.insert("name".into(), json!(name));
        attrs
    }

    #[tokio::test]
    async fn stream_yields_current_then_each_change() {
        let object = RemoteObject::new(ModelKind::Device, "d1", named("old"));
        let mut stream = object.subscribe().into_stream();

        let first = stream.next().await.unwrap();
        assert_eq!(first.get("name"), Some(&json!("old")));

        object.merge(&named("new"));
        let second = stream.next().await.unwrap();
        assert_eq!(second.get("name"), Some(&json!("new")));
        assert!(second.revision > first.revision);

        drop(object);
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn changed_tracks_current() {
        let object = RemoteObject::new(ModelKind::Device, "d1", named("old"));
        let mut watch = object.subscribe();
        object.merge(&named("new"));

        assert_eq!(watch.current().get("name"), Some(&json!("old")));
        assert_eq!(watch.latest().get("name"), Some(&json!("new")));
        let next = watch.changed().await.unwrap();
        assert_eq!(next.get("name"), Some(&json!("new")));
        assert_eq!(watch.current().revision, next.revision);

        drop(object);
        assert!(watch.changed().await.is_none());
    }
}
