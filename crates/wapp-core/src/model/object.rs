// ── Stream-synchronised remote objects ──
//
// `StreamModel` is the capability the router dispatches to. `RemoteObject`
// is the provided implementation over the closed set of service kinds.

use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

use arc_swap::ArcSwapOption;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::watch;
use tracing::{debug, warn};

use wapp_api::EventKind;

use super::event::StreamEvent;
use super::path::ModelPath;
use crate::config::Validation;
use crate::error::CoreError;
use crate::stream::ModelStream;

/// REST API version used for object endpoints.
pub const API_VERSION: &str = "2.0";

// ── ModelKind ────────────────────────────────────────────────────────

/// Kinds of remote object the runtime knows how to materialise.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
    strum::AsRefStr,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum ModelKind {
    Network,
    Device,
    Value,
    State,
    Data,
}

impl ModelKind {
    /// Kind of the objects nested directly under this one.
    pub fn child_kind(self) -> Option<Self> {
        match self {
            Self::Network => Some(Self::Device),
            Self::Device => Some(Self::Value),
            Self::Value => Some(Self::State),
            Self::State | Self::Data => None,
        }
    }

    /// REST collection endpoint, e.g. `/2.0/device`.
    pub fn endpoint(self) -> String {
        format!("/{API_VERSION}/{self}")
    }

    /// `expand` depth that inlines the whole subtree below this kind.
    pub fn expand_depth(self) -> u8 {
        match self {
            Self::Network => 4,
            Self::Device => 3,
            Self::Value => 2,
            Self::State | Self::Data => 1,
        }
    }
}

// ── Snapshot ─────────────────────────────────────────────────────────

/// Identity of a remote object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectMeta {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: ModelKind,
    pub version: String,
}

/// Immutable view of an object's state at one point in time.
#[derive(Debug, Clone, PartialEq)]
pub struct ObjectSnapshot {
    pub meta: ObjectMeta,
    pub attributes: Map<String, Value>,
    pub updated_at: DateTime<Utc>,
    /// Bumped on every applied update.
    pub revision: u64,
}

impl ObjectSnapshot {
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.attributes.get(key)
    }

    /// Wire form: attributes plus a `meta` block.
    pub fn to_json(&self) -> Value {
        let mut body = self.attributes.clone();
        if let Ok(meta) = serde_json::to_value(&self.meta) {
            body.insert("meta".into(), meta);
        }
        Value::Object(body)
    }
}

// ── StreamModel ──────────────────────────────────────────────────────

/// What the router must do after an object handled an event.
pub enum Effect {
    None,
    /// A child was materialised and should be registered at its own path.
    Register(Arc<dyn StreamModel>),
    /// The object was deleted and should leave the registry.
    Unregister,
}

impl fmt::Debug for Effect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::None => f.write_str("None"),
            Self::Register(model) => write!(f, "Register({})", model.path()),
            Self::Unregister => f.write_str("Unregister"),
        }
    }
}

/// A local object kept in sync by stream events.
pub trait StreamModel: Send + Sync {
    /// Registry key.
    fn path(&self) -> &ModelPath;

    /// Path of the owning object, if any.
    fn parent_path(&self) -> Option<ModelPath> {
        None
    }

    /// Apply one event addressed to this object or to its child collection.
    fn handle_event(&self, event: &StreamEvent, validation: Validation) -> Effect;

    /// Forget a child that was deleted.
    fn detach_child(&self, _path: &ModelPath) {}
}

// ── RemoteObject ─────────────────────────────────────────────────────

type ObjectCallback = Arc<dyn Fn(&RemoteObject) + Send + Sync>;
type DirectCallback = Arc<dyn Fn(&RemoteObject, &Value) + Send + Sync>;

#[derive(Default)]
struct Callbacks {
    change: Mutex<Vec<ObjectCallback>>,
    create: Mutex<Vec<ObjectCallback>>,
    delete: Mutex<Vec<ObjectCallback>>,
    direct: Mutex<Vec<DirectCallback>>,
}

/// Clone the callback list so none run under the lock.
fn listeners<T: Clone>(list: &Mutex<Vec<T>>) -> Vec<T> {
    list.lock().unwrap_or_else(PoisonError::into_inner).clone()
}

fn push<T>(list: &Mutex<Vec<T>>, item: T) {
    list.lock().unwrap_or_else(PoisonError::into_inner).push(item);
}

/// In-memory mirror of one remote object.
///
/// Addressed as `{kind}/{id}`. State lives behind a `watch` channel, so
/// readers get cheap `Arc` snapshots and can await changes through
/// [`subscribe`](Self::subscribe).
pub struct RemoteObject {
    path: ModelPath,
    parent: ArcSwapOption<ModelPath>,
    state: watch::Sender<Arc<ObjectSnapshot>>,
    children: Mutex<Vec<Arc<RemoteObject>>>,
    callbacks: Callbacks,
}

impl RemoteObject {
    pub fn new(kind: ModelKind, id: impl Into<String>, attributes: Map<String, Value>) -> Self {
        let meta = ObjectMeta {
            id: id.into(),
            kind,
            version: API_VERSION.to_owned(),
        };
        Self::from_parts(meta, attributes)
    }

    /// Build from a service JSON body (`{"meta": {"id", "type"}, ...}`).
    ///
    /// `kind_hint` is used when the body carries no recognisable type.
    pub fn from_json(kind_hint: Option<ModelKind>, body: &Value) -> Result<Self, CoreError> {
        let object = body.as_object().ok_or_else(|| CoreError::ValidationFailed {
            message: "object body must be a JSON object".into(),
        })?;
        let meta = object.get("meta");

        let id = meta
            .and_then(|m| m.get("id"))
            .and_then(Value::as_str)
            .ok_or_else(|| CoreError::ValidationFailed {
                message: "object body has no meta.id".into(),
            })?;
        let kind = meta
            .and_then(|m| m.get("type"))
            .and_then(Value::as_str)
            .and_then(|t| t.parse::<ModelKind>().ok())
            .or(kind_hint)
            .ok_or_else(|| CoreError::ValidationFailed {
                message: format!("object {id} has no known meta.type"),
            })?;
        let version = meta
            .and_then(|m| m.get("version"))
            .and_then(Value::as_str)
            .unwrap_or(API_VERSION);

        let meta = ObjectMeta {
            id: id.to_owned(),
            kind,
            version: version.to_owned(),
        };
        Ok(Self::from_parts(meta, strip_meta(object)))
    }

    fn from_parts(meta: ObjectMeta, attributes: Map<String, Value>) -> Self {
        let path = ModelPath::new(&format!("{}/{}", meta.kind, meta.id));
        let (state, _) = watch::channel(Arc::new(ObjectSnapshot {
            meta,
            attributes,
            updated_at: Utc::now(),
            revision: 0,
        }));
        Self {
            path,
            parent: ArcSwapOption::empty(),
            state,
            children: Mutex::new(Vec::new()),
            callbacks: Callbacks::default(),
        }
    }

    // ── Accessors ────────────────────────────────────────────────────

    pub fn kind(&self) -> ModelKind {
        self.state.borrow().meta.kind
    }

    pub fn id(&self) -> String {
        self.state.borrow().meta.id.clone()
    }

    pub fn snapshot(&self) -> Arc<ObjectSnapshot> {
        self.state.borrow().clone()
    }

    pub fn attribute(&self, key: &str) -> Option<Value> {
        self.state.borrow().attributes.get(key).cloned()
    }

    pub fn to_json(&self) -> Value {
        self.snapshot().to_json()
    }

    /// REST endpoint of this object, e.g. `/2.0/device/{id}`.
    pub fn endpoint(&self) -> String {
        let snap = self.snapshot();
        format!("/{}/{}/{}", snap.meta.version, snap.meta.kind, snap.meta.id)
    }

    pub fn children(&self) -> Vec<Arc<RemoteObject>> {
        listeners(&self.children)
    }

    pub fn set_parent(&self, parent: ModelPath) {
        self.parent.store(Some(Arc::new(parent)));
    }

    /// Watch this object's state.
    pub fn subscribe(&self) -> ModelStream {
        ModelStream::new(self.state.subscribe())
    }

    // ── Callbacks ────────────────────────────────────────────────────

    /// Called after every applied update, duplicates included.
    pub fn on_change(&self, f: impl Fn(&RemoteObject) + Send + Sync + 'static) {
        push(&self.callbacks.change, Arc::new(f) as ObjectCallback);
    }

    /// Called with the created object: a new child, or this object itself
    /// when the create event is addressed to its own path.
    pub fn on_create(&self, f: impl Fn(&RemoteObject) + Send + Sync + 'static) {
        push(&self.callbacks.create, Arc::new(f) as ObjectCallback);
    }

    pub fn on_delete(&self, f: impl Fn(&RemoteObject) + Send + Sync + 'static) {
        push(&self.callbacks.delete, Arc::new(f) as ObjectCallback);
    }

    /// Called with the payload of a direct message; state is untouched.
    pub fn on_direct(&self, f: impl Fn(&RemoteObject, &Value) + Send + Sync + 'static) {
        push(&self.callbacks.direct, Arc::new(f) as DirectCallback);
    }

    // ── State changes ────────────────────────────────────────────────

    /// Shallow-merge `attributes` into the current state.
    ///
    /// A `meta` key is ignored; identity never changes after creation.
    pub fn merge(&self, attributes: &Map<String, Value>) {
        self.state.send_modify(|snap| {
            let mut next = ObjectSnapshot::clone(snap);
            for (key, value) in attributes {
                if key != "meta" {
                    next.attributes.insert(key.clone(), value.clone());
                }
            }
            next.updated_at = Utc::now();
            next.revision += 1;
            *snap = Arc::new(next);
        });
    }

    fn add_child(&self, child: Arc<RemoteObject>) {
        let mut children = self.children.lock().unwrap_or_else(PoisonError::into_inner);
        children.retain(|c| c.path != child.path);
        children.push(child);
    }

    fn handle_own_event(&self, event: &StreamEvent, validation: Validation) -> Effect {
        match event.kind {
            EventKind::Create => {
                for f in listeners(&self.callbacks.create) {
                    f(self);
                }
                Effect::None
            }
            EventKind::Update => {
                match event.data.as_object() {
                    Some(attributes) => self.merge(attributes),
                    None if validation == Validation::Strict => {
                        warn!(path = %self.path, "dropping update with non-object payload");
                        return Effect::None;
                    }
                    None => debug!(path = %self.path, "update without object payload"),
                }
                for f in listeners(&self.callbacks.change) {
                    f(self);
                }
                Effect::None
            }
            EventKind::Delete => {
                for f in listeners(&self.callbacks.delete) {
                    f(self);
                }
                Effect::Unregister
            }
            EventKind::Direct => {
                for f in listeners(&self.callbacks.direct) {
                    f(self, &event.data);
                }
                Effect::None
            }
            EventKind::Unknown => Effect::None,
        }
    }

    /// A create addressed to this object's child collection materialises
    /// the child from the event's object meta and payload.
    fn handle_child_event(&self, event: &StreamEvent, validation: Validation) -> Effect {
        if event.kind != EventKind::Create {
            debug!(path = %event.path, kind = ?event.kind, "ignoring non-create child event");
            return Effect::None;
        }

        let attributes = match event.data.as_object() {
            Some(object) => strip_meta(object),
            None if validation == Validation::Strict => {
                warn!(path = %event.path, "dropping create with non-object payload");
                return Effect::None;
            }
            None => Map::new(),
        };

        let meta = event.object_meta();
        let Some(id) = meta.as_ref().and_then(|m| m.id.clone()) else {
            warn!(path = %event.path, "create event without object id");
            return Effect::None;
        };
        let kind = meta
            .as_ref()
            .and_then(|m| m.kind.as_deref())
            .and_then(|t| t.parse::<ModelKind>().ok())
            .or_else(|| self.kind().child_kind());
        let Some(kind) = kind else {
            warn!(path = %event.path, "create event for unknown object type");
            return Effect::None;
        };

        let child = Arc::new(RemoteObject::new(kind, id, attributes));
        child.set_parent(self.path.clone());
        self.add_child(Arc::clone(&child));
        debug!(parent = %self.path, child = %child.path, "child created");

        for f in listeners(&self.callbacks.create) {
            f(&child);
        }
        Effect::Register(child)
    }
}

fn strip_meta(object: &Map<String, Value>) -> Map<String, Value> {
    object
        .iter()
        .filter(|(key, _)| key.as_str() != "meta")
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect()
}

impl StreamModel for RemoteObject {
    fn path(&self) -> &ModelPath {
        &self.path
    }

    fn parent_path(&self) -> Option<ModelPath> {
        self.parent.load_full().map(|p| ModelPath::clone(&p))
    }

    fn handle_event(&self, event: &StreamEvent, validation: Validation) -> Effect {
        if event.path == self.path {
            self.handle_own_event(event, validation)
        } else {
            self.handle_child_event(event, validation)
        }
    }

    fn detach_child(&self, path: &ModelPath) {
        self.children
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|c| &c.path != path);
    }
}

impl fmt::Debug for RemoteObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteObject")
            .field("path", &self.path)
            .field("state", &self.snapshot())
            .finish_non_exhaustive()
    }
}
