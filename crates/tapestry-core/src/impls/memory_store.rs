//! In-memory store for development and tests.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use serde_json::Value;

use super::emitter::{Emitter, ListenerId};
use crate::domain::{
    AtomicClobbers, ChangeEvent, Collection, EngineError, MutationSet, ReadRequest, ReadResult,
    Result, apply_clobber,
};
use crate::ports::{ChangeListener, ItemWatch, Store, Watch, WatchId};

type Tables = BTreeMap<Collection, BTreeMap<String, Value>>;

#[derive(Debug, Default)]
struct Inner {
    tables: Tables,
    /// Fail the next commit after this many writes were staged.
    fail_after: Option<usize>,
}

#[derive(Debug, Default)]
struct Watchers {
    next_id: u64,
    by_id: HashMap<WatchId, (Collection, ListenerId)>,
}

/// Keeps every collection in a `BTreeMap`.
///
/// Commits stage their writes on a copy of the tables and swap it in only
/// when every write succeeded. Change events are emitted after the swap
/// while `commit_gate` is held, so listeners observe commits one at a time
/// and in commit order, and `watch` can never fall between a swap and its
/// events.
#[derive(Debug)]
pub struct MemoryStore {
    commit_gate: Mutex<()>,
    inner: Mutex<Inner>,
    watchers: Mutex<Watchers>,
    emitters: BTreeMap<Collection, Emitter<ChangeEvent>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            commit_gate: Mutex::new(()),
            inner: Mutex::new(Inner::default()),
            watchers: Mutex::new(Watchers::default()),
            emitters: Collection::ALL
                .iter()
                .map(|c| (*c, Emitter::new()))
                .collect(),
        }
    }

    /// Makes the next commit fail once `writes` writes have been staged.
    pub fn fail_after(&self, writes: usize) {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .fail_after = Some(writes);
    }

    /// Synchronous read of one entity.
    pub fn get(&self, collection: Collection, id: &str) -> Option<Value> {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .tables
            .get(&collection)
            .and_then(|table| table.get(id))
            .cloned()
    }

    pub fn len(&self, collection: Collection) -> usize {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .tables
            .get(&collection)
            .map_or(0, BTreeMap::len)
    }

    /// Adds a listener; the caller holds `commit_gate`.
    fn register(&self, collection: Collection, listener: ChangeListener) -> Result<WatchId> {
        let emitter = self
            .emitters
            .get(&collection)
            .ok_or_else(|| EngineError::Invariant(format!("no emitter for {collection}")))?;
        let listener_id = emitter.on(listener);

        let mut watchers = self.watchers.lock().unwrap_or_else(PoisonError::into_inner);
        watchers.next_id += 1;
        let id = WatchId(watchers.next_id);
        watchers.by_id.insert(id, (collection, listener_id));
        Ok(id)
    }

    fn stage(
        tables: &mut Tables,
        fail_after: Option<usize>,
        mutations: &MutationSet,
        clobbers: &AtomicClobbers,
    ) -> Result<Vec<ChangeEvent>> {
        let mut written = 0usize;
        let mut events = Vec::new();
        let check_fault = |written: usize| match fail_after {
            Some(limit) if written >= limit => Err(EngineError::Commit(format!(
                "injected fault after {limit} writes"
            ))),
            _ => Ok(()),
        };

        for (collection, id, value) in mutations.iter() {
            check_fault(written)?;
            let table = tables.entry(collection).or_default();
            match value {
                Some(value) => {
                    table.insert(id.to_string(), value.clone());
                }
                None => {
                    table.remove(id);
                }
            }
            written += 1;
            events.push(ChangeEvent {
                collection,
                id: id.to_string(),
                value: value.cloned(),
            });
        }

        for (collection, id, patch) in clobbers.iter() {
            check_fault(written)?;
            let Some(record) = tables.get_mut(&collection).and_then(|t| t.get_mut(id)) else {
                tracing::warn!(%collection, id, "clobber targets a missing record; skipped");
                continue;
            };
            apply_clobber(record, patch);
            written += 1;
            let value = record.clone();
            // a clobbered entity also written by a mutation reports its final value once
            events.retain(|e| !(e.collection == collection && e.id == id));
            events.push(ChangeEvent {
                collection,
                id: id.to_string(),
                value: Some(value),
            });
        }

        Ok(events)
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn read(&self, request: &ReadRequest) -> Result<ReadResult> {
        let inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        let mut result = ReadResult::default();
        for (collection, id) in request.iter() {
            if let Some(value) = inner.tables.get(&collection).and_then(|t| t.get(id)) {
                result.insert(collection, id, value.clone());
            }
        }
        Ok(result)
    }

    async fn scan(&self, collection: Collection) -> Result<Vec<(String, Value)>> {
        let inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(inner
            .tables
            .get(&collection)
            .map(|table| table.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
            .unwrap_or_default())
    }

    async fn commit(&self, mutations: &MutationSet, clobbers: &AtomicClobbers) -> Result<()> {
        let _gate = self.commit_gate.lock().unwrap_or_else(PoisonError::into_inner);
        let events = {
            let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
            let fail_after = inner.fail_after.take();
            let mut staged = inner.tables.clone();
            let events = Self::stage(&mut staged, fail_after, mutations, clobbers)?;
            inner.tables = staged;
            events
        };

        tracing::debug!(writes = events.len(), "commit applied");
        for event in &events {
            if let Some(emitter) = self.emitters.get(&event.collection) {
                emitter.emit(event);
            }
        }
        Ok(())
    }

    fn watch(&self, collection: Collection, listener: ChangeListener) -> Result<Watch> {
        let _gate = self.commit_gate.lock().unwrap_or_else(PoisonError::into_inner);
        let snapshot = {
            let inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
            inner
                .tables
                .get(&collection)
                .map(|table| table.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
                .unwrap_or_default()
        };
        let id = self.register(collection, listener)?;
        Ok(Watch { id, snapshot })
    }

    fn watch_item(&self, collection: Collection, id: &str, listener: ChangeListener) -> Result<ItemWatch> {
        let _gate = self.commit_gate.lock().unwrap_or_else(PoisonError::into_inner);
        let value = self.get(collection, id);
        let item_id = id.to_string();
        let filtered: ChangeListener = Arc::new(move |event: &ChangeEvent| {
            if event.id == item_id {
                listener(event);
            }
        });
        let id = self.register(collection, filtered)?;
        Ok(ItemWatch { id, value })
    }

    fn unwatch(&self, id: WatchId) {
        let entry = self
            .watchers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .by_id
            .remove(&id);
        if let Some((collection, listener_id)) = entry
            && let Some(emitter) = self.emitters.get(&collection)
        {
            emitter.off(listener_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn recorder(store: &MemoryStore, collection: Collection) -> (Watch, Arc<Mutex<Vec<ChangeEvent>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let watch = store
            .watch(
                collection,
                Arc::new(move |e: &ChangeEvent| sink.lock().unwrap().push(e.clone())),
            )
            .unwrap();
        (watch, seen)
    }

    #[tokio::test]
    async fn failed_commit_leaves_nothing_visible() {
        let store = MemoryStore::new();
        let (_watch, seen) = recorder(&store, Collection::Folders);

        let set = MutationSet::new()
            .with_put(Collection::Folders, "x", json!({ "n": 1 }))
            .with_put(Collection::Folders, "y", json!({ "n": 2 }));

        store.fail_after(1);
        let err = store.commit(&set, &AtomicClobbers::new()).await.unwrap_err();

        assert!(matches!(err, EngineError::Commit(_)));
        assert_eq!(store.get(Collection::Folders, "x"), None);
        assert_eq!(store.get(Collection::Folders, "y"), None);
        assert!(seen.lock().unwrap().is_empty());

        // the fault is one-shot
        store.commit(&set, &AtomicClobbers::new()).await.unwrap();
        assert_eq!(store.len(Collection::Folders), 2);
        assert_eq!(seen.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn clobbers_patch_existing_records_only() {
        let store = MemoryStore::new();
        store
            .commit(
                &MutationSet::new().with_put(Collection::Accounts, "a1", json!({ "name": "Work" })),
                &AtomicClobbers::new(),
            )
            .await
            .unwrap();
        let (_watch, seen) = recorder(&store, Collection::Accounts);

        let clobbers = AtomicClobbers::new()
            .with_patch(Collection::Accounts, "a1", "syncInfo", json!({ "at": 5 }))
            .with_patch(Collection::Accounts, "ghost", "syncInfo", json!({ "at": 5 }));
        store.commit(&MutationSet::new(), &clobbers).await.unwrap();

        let a1 = store.get(Collection::Accounts, "a1").unwrap();
        assert_eq!(a1["name"], "Work");
        assert_eq!(a1["syncInfo"]["at"], 5);
        assert_eq!(store.get(Collection::Accounts, "ghost"), None);
        assert_eq!(seen.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn watch_snapshot_and_events_do_not_overlap() {
        let store = MemoryStore::new();
        store
            .commit(
                &MutationSet::new().with_put(Collection::Messages, "m1", json!({})),
                &AtomicClobbers::new(),
            )
            .await
            .unwrap();

        let (watch, seen) = recorder(&store, Collection::Messages);
        assert_eq!(watch.snapshot.len(), 1);

        store
            .commit(
                &MutationSet::new()
                    .with_delete(Collection::Messages, "m1")
                    .with_put(Collection::Folders, "f1", json!({})),
                &AtomicClobbers::new(),
            )
            .await
            .unwrap();

        let events = seen.lock().unwrap().clone();
        assert_eq!(events.len(), 1);
        assert!(events[0].is_deletion());

        store.unwatch(watch.id);
        store
            .commit(
                &MutationSet::new().with_put(Collection::Messages, "m2", json!({})),
                &AtomicClobbers::new(),
            )
            .await
            .unwrap();
        assert_eq!(seen.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn panicking_watcher_does_not_fail_the_commit() {
        let store = MemoryStore::new();
        store
            .watch(
                Collection::Folders,
                Arc::new(|event: &ChangeEvent| {
                    if event.id == "f1" {
                        panic!("broken view");
                    }
                }),
            )
            .unwrap();
        let (_watch, seen) = recorder(&store, Collection::Folders);

        store
            .commit(
                &MutationSet::new().with_put(Collection::Folders, "f1", json!({})),
                &AtomicClobbers::new(),
            )
            .await
            .unwrap();

        assert_eq!(store.len(Collection::Folders), 1);
        assert_eq!(seen.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn item_watch_hears_only_its_entity() {
        let store = MemoryStore::new();
        store
            .commit(
                &MutationSet::new()
                    .with_put(Collection::Messages, "m1", json!({ "n": 1 }))
                    .with_put(Collection::Messages, "m2", json!({ "n": 2 })),
                &AtomicClobbers::new(),
            )
            .await
            .unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let watch = store
            .watch_item(
                Collection::Messages,
                "m2",
                Arc::new(move |e: &ChangeEvent| sink.lock().unwrap().push(e.clone())),
            )
            .unwrap();
        assert_eq!(watch.value, Some(json!({ "n": 2 })));

        store
            .commit(
                &MutationSet::new()
                    .with_put(Collection::Messages, "m1", json!({ "n": 10 }))
                    .with_delete(Collection::Messages, "m2"),
                &AtomicClobbers::new(),
            )
            .await
            .unwrap();

        let events = seen.lock().unwrap().clone();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].id, "m2");
        assert!(events[0].is_deletion());
        store.unwatch(watch.id);
    }

    #[tokio::test]
    async fn read_returns_only_present_entities() {
        let store = MemoryStore::new();
        store
            .commit(
                &MutationSet::new().with_put(Collection::SyncStates, "a1", json!({ "watermark": 3 })),
                &AtomicClobbers::new(),
            )
            .await
            .unwrap();

        let result = store
            .read(
                &ReadRequest::new()
                    .with(Collection::SyncStates, "a1")
                    .with(Collection::SyncStates, "a2"),
            )
            .await
            .unwrap();

        assert_eq!(result.get(Collection::SyncStates, "a1"), Some(&json!({ "watermark": 3 })));
        assert_eq!(result.get(Collection::SyncStates, "a2"), None);
    }
}
