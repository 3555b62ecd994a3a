//! Overlay manager: provider registry plus invalidation announcements.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError};

use serde_json::{Map, Value};

use super::emitter::{Emitter, ListenerId};
use crate::domain::OverlayKey;
use crate::ports::OverlayProvider;

type Providers = BTreeMap<String, BTreeMap<String, Arc<dyn OverlayProvider>>>;

#[derive(Default)]
pub struct DataOverlayManager {
    providers: Mutex<Providers>,
    announcements: Emitter<OverlayKey>,
}

impl DataOverlayManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `provider` under `name` in `namespace`, replacing any
    /// provider previously registered with that name.
    pub fn register_provider(
        &self,
        namespace: impl Into<String>,
        name: impl Into<String>,
        provider: Arc<dyn OverlayProvider>,
    ) {
        self.providers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(namespace.into())
            .or_default()
            .insert(name.into(), provider);
    }

    /// Tells listeners the overlays for `key` may have changed.
    pub fn announce(&self, key: &OverlayKey) {
        tracing::trace!(namespace = %key.namespace, id = %key.id, "overlay invalidated");
        self.announcements.emit(key);
    }

    pub fn on_announce(&self, listener: Arc<dyn Fn(&OverlayKey) + Send + Sync>) -> ListenerId {
        self.announcements.on(listener)
    }

    pub fn off_announce(&self, id: ListenerId) {
        self.announcements.off(id);
    }

    /// Overlays for one entity, keyed by provider name. Providers with
    /// nothing to report are left out.
    pub fn resolve(&self, namespace: &str, id: &str) -> Value {
        let providers: Vec<(String, Arc<dyn OverlayProvider>)> = self
            .providers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(namespace)
            .map(|by_name| {
                by_name
                    .iter()
                    .map(|(name, p)| (name.clone(), Arc::clone(p)))
                    .collect()
            })
            .unwrap_or_default();

        let mut overlays = Map::new();
        for (name, provider) in providers {
            if let Some(value) = provider.overlay_for(id) {
                overlays.insert(name, value);
            }
        }
        Value::Object(overlays)
    }

    /// A resolver fixed to one namespace, handed to views.
    pub fn bound_resolver(self: &Arc<Self>, namespace: impl Into<String>) -> OverlayResolver {
        OverlayResolver {
            manager: Arc::clone(self),
            namespace: namespace.into(),
        }
    }
}

impl std::fmt::Debug for DataOverlayManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let namespaces: Vec<String> = self
            .providers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        f.debug_struct("DataOverlayManager")
            .field("namespaces", &namespaces)
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct OverlayResolver {
    manager: Arc<DataOverlayManager>,
    namespace: String,
}

impl OverlayResolver {
    pub fn resolve(&self, id: &str) -> Value {
        self.manager.resolve(&self.namespace, id)
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn resolver_collects_every_provider() {
        let manager = Arc::new(DataOverlayManager::new());
        manager.register_provider(
            "accounts",
            "sync_refresh",
            Arc::new(|id: &str| (id == "a1").then(|| json!({ "status": "active" }))),
        );
        manager.register_provider("accounts", "idle", Arc::new(|_: &str| None));

        let resolver = manager.bound_resolver("accounts");
        assert_eq!(
            resolver.resolve("a1"),
            json!({ "sync_refresh": { "status": "active" } })
        );
        assert_eq!(resolver.resolve("a2"), json!({}));
        assert_eq!(manager.resolve("folders", "f1"), json!({}));
    }

    #[test]
    fn announcements_reach_listeners() {
        let manager = DataOverlayManager::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let id = manager.on_announce(Arc::new(move |k: &OverlayKey| {
            sink.lock().unwrap().push(k.clone())
        }));

        manager.announce(&OverlayKey::new("accounts", "a1"));
        manager.off_announce(id);
        manager.announce(&OverlayKey::new("accounts", "a2"));

        assert_eq!(*seen.lock().unwrap(), vec![OverlayKey::new("accounts", "a1")]);
    }
}
