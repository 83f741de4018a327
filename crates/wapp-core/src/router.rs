// ── Event router ──
//
// Classifies every inbound frame and hands it to exactly one consumer:
// the request correlator, the matching service subscriptions, or the
// registered object at the frame's path.

use std::sync::Arc;

use arc_swap::ArcSwapOption;
use tracing::{debug, trace, warn};

use wapp_api::{EventKind, Frame, frame};

use crate::config::Validation;
use crate::correlator::RequestCorrelator;
use crate::model::{Effect, ModelPath, StreamEvent};
use crate::registry::ObjectRegistry;
use crate::subscription::ServiceRegistry;

/// Where one frame went.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    /// A response; `resolved` is false when nothing was waiting for it.
    Response { resolved: bool },
    /// Delivered to `handlers` service subscriptions.
    Service { path: ModelPath, handlers: usize },
    /// Applied to the object registered at `path`.
    Object { path: ModelPath, kind: EventKind },
    /// No consumer.
    Dropped { path: ModelPath },
    /// Could not be decoded.
    Malformed,
}

pub struct EventRouter {
    objects: Arc<ObjectRegistry>,
    services: ServiceRegistry,
    correlator: Arc<RequestCorrelator>,
    validation: Validation,
    last_event: ArcSwapOption<StreamEvent>,
}

impl EventRouter {
    pub fn new(
        objects: Arc<ObjectRegistry>,
        services: ServiceRegistry,
        correlator: Arc<RequestCorrelator>,
        validation: Validation,
    ) -> Self {
        Self {
            objects,
            services,
            correlator,
            validation,
            last_event: ArcSwapOption::empty(),
        }
    }

    /// The most recent event routed, whatever its outcome.
    pub fn last_event(&self) -> Option<Arc<StreamEvent>> {
        self.last_event.load_full()
    }

    /// Route every frame in one text message.
    ///
    /// Bad frames are logged and skipped; the rest of the batch still
    /// routes.
    pub fn route(&self, text: &str) -> Vec<Route> {
        frame::decode(text)
            .into_iter()
            .map(|decoded| match decoded {
                Ok(Frame::Response(response)) => Route::Response {
                    resolved: self.correlator.resolve(response),
                },
                Ok(Frame::Event(event)) => self.route_event(&StreamEvent::from(event)),
                Err(e) => {
                    warn!(error = %e, "dropping malformed frame");
                    Route::Malformed
                }
            })
            .collect()
    }

    /// Route one decoded event.
    pub fn route_event(&self, event: &StreamEvent) -> Route {
        trace!(path = %event.path, kind = ?event.kind, "routing event");
        self.last_event.store(Some(Arc::new(event.clone())));

        if self.services.matches(&event.path) {
            let handlers = self.services.dispatch(event);
            return Route::Service {
                path: event.path.clone(),
                handlers,
            };
        }

        if event.kind == EventKind::Unknown {
            debug!(path = %event.path, "dropping event of unknown kind");
            return self.dropped(event);
        }

        let mut delivered = false;

        if let Some(object) = self.objects.get(&event.path) {
            delivered = true;
            let effect = object.handle_event(event, self.validation);
            self.apply(effect, &event.path, object.parent_path());
        }

        // Creates also reach the collection that owns the new path.
        if event.kind == EventKind::Create {
            if let Some(parent) = event.path.parent().and_then(|p| self.objects.get(&p)) {
                delivered = true;
                let effect = parent.handle_event(event, self.validation);
                self.apply(effect, &event.path, None);
            }
        }

        if delivered {
            Route::Object {
                path: event.path.clone(),
                kind: event.kind,
            }
        } else {
            self.dropped(event)
        }
    }

    fn apply(&self, effect: Effect, path: &ModelPath, parent: Option<ModelPath>) {
        match effect {
            Effect::None => {}
            Effect::Register(child) => {
                debug!(path = %child.path(), "registering materialised child");
                self.objects.register(child);
            }
            Effect::Unregister => {
                self.forget(path, parent);
                debug!(%path, "object deleted");
            }
        }
    }

    /// Drop `path` from the registry and from its parent's children.
    pub(crate) fn forget(&self, path: &ModelPath, parent: Option<ModelPath>) {
        self.objects.unregister(path);
        if let Some(owner) = parent.and_then(|p| self.objects.get(&p)) {
            owner.detach_child(path);
        }
    }

    fn dropped(&self, event: &StreamEvent) -> Route {
        debug!(path = %event.path, kind = ?event.kind, "no consumer for event");
        Route::Dropped {
            path: event.path.clone(),
        }
    }
}
