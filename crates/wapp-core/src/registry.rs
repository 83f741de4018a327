// ── Object registry ──
//
// Path-keyed, lock-sharded store of the objects the router dispatches to.
// One active object per path.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::watch;
use tracing::warn;

use crate::error::CoreError;
use crate::model::{ModelPath, StreamModel};

pub struct ObjectRegistry {
    by_path: DashMap<ModelPath, Arc<dyn StreamModel>>,
    /// Bumped on every registration change.
    version: watch::Sender<u64>,
}

impl Default for ObjectRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ObjectRegistry {
    pub fn new() -> Self {
        let (version, _) = watch::channel(0_u64);
        Self {
            by_path: DashMap::new(),
            version,
        }
    }

    /// Register `object` at its own path.
    ///
    /// An object already at that path is replaced (and returned).
    pub fn register(&self, object: Arc<dyn StreamModel>) -> Option<Arc<dyn StreamModel>> {
        let path = object.path().clone();
        let previous = self.by_path.insert(path.clone(), object);
        if previous.is_some() {
            warn!(%path, "replacing object already registered at path");
        }
        self.bump_version();
        previous
    }

    pub fn unregister(&self, path: &ModelPath) -> Option<Arc<dyn StreamModel>> {
        let removed = self.by_path.remove(path).map(|(_, v)| v);
        if removed.is_some() {
            self.bump_version();
        }
        removed
    }

    pub fn get(&self, path: &ModelPath) -> Option<Arc<dyn StreamModel>> {
        self.by_path.get(path).map(|r| Arc::clone(r.value()))
    }

    /// Like [`get`](Self::get), but absence is an error.
    pub fn require(&self, path: &ModelPath) -> Result<Arc<dyn StreamModel>, CoreError> {
        self.get(path).ok_or_else(|| CoreError::NoMatchingObject {
            path: path.to_string(),
        })
    }

    pub fn contains(&self, path: &ModelPath) -> bool {
        self.by_path.contains_key(path)
    }

    pub fn paths(&self) -> Vec<ModelPath> {
        self.by_path.iter().map(|r| r.key().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.by_path.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_path.is_empty()
    }

    /// Watch the registration version counter.
    pub fn watch_version(&self) -> watch::Receiver<u64> {
        self.version.subscribe()
    }

    fn bump_version(&self) {
        self.version.send_modify(|v| *v += 1);
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::model::{ModelKind, RemoteObject};
    use serde_json::Map;

    fn object(kind: ModelKind, id: &str) -> Arc<dyn StreamModel> {
        Arc::new(RemoteObject::new(kind, id, Map::new()))
    }

    #[test]
    fn register_and_lookup() {
        let registry = ObjectRegistry::new();
        assert!(registry.register(object(ModelKind::Device, "1")).is_none());

        let path = ModelPath::new("/device/1/");
        assert!(registry.contains(&path));
        assert_eq!(registry.get(&path).unwrap().path(), &path);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn second_registration_replaces() {
        let registry = ObjectRegistry::new();
        registry.register(object(ModelKind::Value, "v"));
        let replaced = registry.register(object(ModelKind::Value, "v"));
        assert!(replaced.is_some());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn require_reports_missing_path() {
        let registry = ObjectRegistry::new();
        let err = registry.require(&ModelPath::new("network/x")).err().unwrap();
        assert!(matches!(err, CoreError::NoMatchingObject { ref path } if path == "/network/x"));
    }

    #[test]
    fn unregister_bumps_version() {
        let registry = ObjectRegistry::new();
        let version = registry.watch_version();
        registry.register(object(ModelKind::State, "s"));
        assert!(registry.unregister(&ModelPath::new("state/s")).is_some());
        assert!(registry.unregister(&ModelPath::new("state/s")).is_none());
        assert_eq!(*version.borrow(), 2);
        assert!(registry.is_empty());
    }
}
