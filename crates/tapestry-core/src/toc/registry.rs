//! Shared TOCs, one per (item type, scope) while anyone holds it.

use std::any::Any;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, Weak};

use super::{OrderedToc, TocItem};
use crate::domain::{ChangeEvent, Result};
use crate::ports::Store;

type CacheKey = (&'static str, String);

/// Hands out TOCs bound to the store.
///
/// Two views of the same folder share one TOC; the TOC unwatches the store
/// when the last view drops it.
pub struct TocRegistry {
    store: Arc<dyn Store>,
    cache: Mutex<HashMap<CacheKey, Weak<dyn Any + Send + Sync>>>,
}

impl TocRegistry {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self {
            store,
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Returns the live TOC for `scope`, creating and loading it if needed.
    pub fn acquire<T: TocItem>(&self, scope: &str) -> Result<Arc<OrderedToc<T>>> {
        let key: CacheKey = (std::any::type_name::<T>(), scope.to_string());
        let mut cache = self.cache.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(toc) = cache
            .get(&key)
            .and_then(Weak::upgrade)
            .and_then(|any| any.downcast::<OrderedToc<T>>().ok())
        {
            return Ok(toc);
        }

        let toc = Arc::new(OrderedToc::<T>::new(scope));
        let weak = Arc::downgrade(&toc);
        let watch = self.store.watch(
            T::COLLECTION,
            Arc::new(move |event: &ChangeEvent| {
                if let Some(toc) = weak.upgrade() {
                    toc.apply_change(event);
                }
            }),
        )?;
        toc.load(watch.snapshot);
        toc.bind(Arc::clone(&self.store), watch.id);
        tracing::debug!(collection = %T::COLLECTION, scope, len = toc.len(), "TOC loaded");

        cache.retain(|_, entry| entry.strong_count() > 0);
        let erased: Arc<dyn Any + Send + Sync> = toc.clone();
        cache.insert(key, Arc::downgrade(&erased));
        Ok(toc)
    }

    /// Number of TOCs still alive.
    pub fn live(&self) -> usize {
        self.cache
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .filter(|entry| entry.strong_count() > 0)
            .count()
    }
}

impl std::fmt::Debug for TocRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TocRegistry").field("live", &self.live()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{AccountDef, AtomicClobbers, Collection, FolderInfo, MutationSet};
    use crate::impls::MemoryStore;
    use serde_json::json;

    #[tokio::test]
    async fn toc_follows_commits() {
        let store = Arc::new(MemoryStore::new());
        store
            .commit(
                &MutationSet::new().with_put(Collection::Accounts, "z", json!({ "id": "z", "name": "Zeta" })),
                &AtomicClobbers::new(),
            )
            .await
            .unwrap();
        let registry = TocRegistry::new(store.clone());

        let toc = registry.acquire::<AccountDef>("").unwrap();
        assert_eq!(toc.ordered_ids(), vec!["z"]);

        store
            .commit(
                &MutationSet::new().with_put(Collection::Accounts, "a", json!({ "id": "a", "name": "Alpha" })),
                &AtomicClobbers::new(),
            )
            .await
            .unwrap();
        assert_eq!(toc.ordered_ids(), vec!["a", "z"]);
    }

    #[tokio::test]
    async fn same_scope_shares_one_toc() {
        let registry = TocRegistry::new(Arc::new(MemoryStore::new()));

        let first = registry.acquire::<FolderInfo>("a1").unwrap();
        let second = registry.acquire::<FolderInfo>("a1").unwrap();
        let other = registry.acquire::<FolderInfo>("a2").unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert!(!Arc::ptr_eq(&first, &other));
        assert_eq!(registry.live(), 2);

        drop((first, second));
        assert_eq!(registry.live(), 1);
    }
}
