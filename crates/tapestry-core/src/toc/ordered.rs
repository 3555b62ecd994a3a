//! One ordered index over a store collection.
//!
//! Items are kept sorted by `TocItem::compare`, ties broken by id. Listeners
//! get positional add/change/remove events; store events that arrive before
//! the initial load are buffered and replayed after it.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use serde_json::Value;

use super::{TocEvent, TocItem};
use crate::domain::ChangeEvent;
use crate::ports::{Store, WatchId};

/// Called with each event and the TOC contents right after it.
///
/// Runs while the TOC is locked; must not call back into the TOC.
pub type TocListener<T> = Arc<dyn Fn(&TocEvent<T>, &[T]) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TocListenerId(u64);

struct Inner<T> {
    items: Vec<T>,
    by_id: HashMap<String, T>,
    listeners: Vec<(TocListenerId, TocListener<T>)>,
    next_listener: u64,
    /// Change events received before the initial snapshot was loaded.
    buffered: Option<Vec<ChangeEvent>>,
}

/// Unsubscribes the TOC from the store when the TOC goes away.
struct StoreBinding {
    store: Arc<dyn Store>,
    watch: WatchId,
}

impl Drop for StoreBinding {
    fn drop(&mut self) {
        self.store.unwatch(self.watch);
    }
}

/// Items kept sorted by [`TocItem::compare`] then id.
///
/// Every insert and removal finds its position by binary search; the list is
/// never re-sorted after the initial load.
pub struct OrderedToc<T: TocItem> {
    scope: String,
    inner: Mutex<Inner<T>>,
    binding: Mutex<Option<StoreBinding>>,
}

fn total_order<T: TocItem>(a: &T, b: &T) -> Ordering {
    a.compare(b).then_with(|| a.id().cmp(b.id()))
}

impl<T: TocItem> OrderedToc<T> {
    /// An empty TOC that buffers change events until [`Self::load`].
    pub fn new(scope: impl Into<String>) -> Self {
        Self {
            scope: scope.into(),
            inner: Mutex::new(Inner {
                items: Vec::new(),
                by_id: HashMap::new(),
                listeners: Vec::new(),
                next_listener: 0,
                buffered: Some(Vec::new()),
            }),
            binding: Mutex::new(None),
        }
    }

    pub fn scope(&self) -> &str {
        &self.scope
    }

    /// Loads the initial contents, then replays events that arrived first.
    pub fn load(&self, snapshot: Vec<(String, Value)>) {
        let mut inner = self.lock();
        let mut items: Vec<T> = snapshot
            .iter()
            .filter_map(|(_, value)| T::decode(value))
            .filter(|item| item.in_scope(&self.scope))
            .collect();
        items.sort_by(total_order);
        inner.by_id = items
            .iter()
            .map(|item| (item.id().to_string(), item.clone()))
            .collect();
        inner.items = items;

        let buffered = inner.buffered.take().unwrap_or_default();
        for event in &buffered {
            self.apply_locked(&mut inner, event);
        }
    }

    pub(crate) fn bind(&self, store: Arc<dyn Store>, watch: WatchId) {
        *self.binding.lock().unwrap_or_else(PoisonError::into_inner) =
            Some(StoreBinding { store, watch });
    }

    /// Applies one store change event.
    pub fn apply_change(&self, event: &ChangeEvent) {
        if event.collection != T::COLLECTION {
            return;
        }
        let mut inner = self.lock();
        if let Some(buffered) = inner.buffered.as_mut() {
            buffered.push(event.clone());
            return;
        }
        self.apply_locked(&mut inner, event);
    }

    fn apply_locked(&self, inner: &mut Inner<T>, event: &ChangeEvent) {
        match event.value.as_ref().and_then(T::decode) {
            Some(item) if item.in_scope(&self.scope) => Self::upsert(inner, item),
            // deleted, undecodable, or moved out of scope
            _ => Self::remove_locked(inner, &event.id),
        }
    }

    pub fn add_or_update(&self, item: T) {
        let mut inner = self.lock();
        if item.in_scope(&self.scope) {
            Self::upsert(&mut inner, item);
        } else {
            let id = item.id().to_string();
            Self::remove_locked(&mut inner, &id);
        }
    }

    pub fn remove(&self, id: &str) {
        let mut inner = self.lock();
        Self::remove_locked(&mut inner, id);
    }

    fn position_of(items: &[T], item: &T) -> usize {
        items.partition_point(|x| total_order(x, item) == Ordering::Less)
    }

    fn upsert(inner: &mut Inner<T>, item: T) {
        let id = item.id().to_string();
        let old_index = inner
            .by_id
            .get(&id)
            .map(|old| Self::position_of(&inner.items, old));
        inner.by_id.insert(id.clone(), item.clone());

        match old_index {
            Some(old_index) => {
                inner.items.remove(old_index);
                let new_index = Self::position_of(&inner.items, &item);
                if new_index == old_index {
                    inner.items.insert(new_index, item.clone());
                    Self::emit(inner, &TocEvent::Change { item, index: new_index });
                } else {
                    Self::emit(inner, &TocEvent::Remove { id, index: old_index });
                    inner.items.insert(new_index, item.clone());
                    Self::emit(inner, &TocEvent::Add { item, index: new_index });
                }
            }
            None => {
                let index = Self::position_of(&inner.items, &item);
                inner.items.insert(index, item.clone());
                Self::emit(inner, &TocEvent::Add { item, index });
            }
        }
    }

    fn remove_locked(inner: &mut Inner<T>, id: &str) {
        let Some(old) = inner.by_id.remove(id) else {
            return;
        };
        let index = Self::position_of(&inner.items, &old);
        if inner.items.get(index).map(|x| x.id()) != Some(id) {
            tracing::error!(id, index, "TOC order out of sync with its index");
            return;
        }
        inner.items.remove(index);
        Self::emit(
            inner,
            &TocEvent::Remove {
                id: id.to_string(),
                index,
            },
        );
    }

    fn emit(inner: &Inner<T>, event: &TocEvent<T>) {
        for (_, listener) in &inner.listeners {
            listener(event, &inner.items);
        }
    }

    /// Registers `listener` and runs `init` on the contents it starts from;
    /// no event can fall between the two.
    pub fn subscribe<R>(
        &self,
        listener: TocListener<T>,
        init: impl FnOnce(&[T]) -> R,
    ) -> (TocListenerId, R) {
        let mut inner = self.lock();
        inner.next_listener += 1;
        let id = TocListenerId(inner.next_listener);
        inner.listeners.push((id, listener));
        (id, init(&inner.items))
    }

    pub fn unsubscribe(&self, id: TocListenerId) {
        self.lock().listeners.retain(|(listener_id, _)| *listener_id != id);
    }

    /// Runs `f` against the current contents while holding the TOC lock.
    pub fn with_items<R>(&self, f: impl FnOnce(&[T]) -> R) -> R {
        f(&self.lock().items)
    }

    pub fn ordered_ids(&self) -> Vec<String> {
        self.with_items(|items| items.iter().map(|i| i.id().to_string()).collect())
    }

    pub fn slice(&self, offset: usize, count: usize) -> Vec<T> {
        self.with_items(|items| items.iter().skip(offset).take(count).cloned().collect())
    }

    pub fn len(&self) -> usize {
        self.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, id: &str) -> Option<T> {
        self.lock().by_id.get(id).cloned()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner<T>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<T: TocItem> std::fmt::Debug for OrderedToc<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OrderedToc")
            .field("collection", &T::COLLECTION)
            .field("scope", &self.scope)
            .field("len", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{AccountDef, Collection, ConversationInfo};
    use rand::Rng;
    use serde_json::json;

    fn accounts_toc() -> OrderedToc<AccountDef> {
        let toc = OrderedToc::new("");
        toc.load(Vec::new());
        toc
    }

    fn recorder<T: TocItem>(toc: &OrderedToc<T>) -> Arc<Mutex<Vec<TocEvent<T>>>> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        toc.subscribe(
            Arc::new(move |e: &TocEvent<T>, _: &[T]| sink.lock().unwrap().push(e.clone())),
            |_| (),
        );
        seen
    }

    #[test]
    fn accounts_sort_by_name() {
        let toc = accounts_toc();
        toc.add_or_update(AccountDef::new("z", "Zeta"));
        toc.add_or_update(AccountDef::new("a", "Alpha"));
        toc.add_or_update(AccountDef::new("m", "Mike"));

        let names: Vec<String> = toc.slice(0, 10).into_iter().map(|a| a.name).collect();
        assert_eq!(names, vec!["Alpha", "Mike", "Zeta"]);
    }

    #[test]
    fn events_carry_positions_after_the_change() {
        let toc = accounts_toc();
        let seen = recorder(&toc);

        toc.add_or_update(AccountDef::new("z", "Zeta"));
        toc.add_or_update(AccountDef::new("a", "Alpha"));
        // rename moves Alpha after Zeta
        toc.add_or_update(AccountDef::new("a", "Zulu"));
        // same position, different payload
        toc.add_or_update(AccountDef::new("z", "zeta"));
        toc.remove("a");
        toc.remove("missing");

        let events: Vec<(String, usize)> = seen
            .lock()
            .unwrap()
            .iter()
            .map(|e| match e {
                TocEvent::Add { item, index } => (format!("add {}", item.id), *index),
                TocEvent::Change { item, index } => (format!("change {}", item.id), *index),
                TocEvent::Remove { id, index } => (format!("remove {id}"), *index),
            })
            .collect();
        assert_eq!(
            events,
            vec![
                ("add z".to_string(), 0),
                ("add a".to_string(), 0),
                ("remove a".to_string(), 0),
                ("add a".to_string(), 1),
                ("change z".to_string(), 0),
                ("remove a".to_string(), 1),
            ]
        );
    }

    #[test]
    fn store_events_before_load_are_replayed() {
        let toc: OrderedToc<AccountDef> = OrderedToc::new("");
        toc.apply_change(&ChangeEvent {
            collection: Collection::Accounts,
            id: "b".into(),
            value: Some(json!({ "id": "b", "name": "Bravo" })),
        });
        toc.apply_change(&ChangeEvent {
            collection: Collection::Accounts,
            id: "a".into(),
            value: None,
        });
        assert!(toc.is_empty());

        toc.load(vec![("a".into(), json!({ "id": "a", "name": "Alpha" }))]);
        assert_eq!(toc.ordered_ids(), vec!["b"]);
    }

    #[test]
    fn items_leaving_scope_are_removed() {
        let toc: OrderedToc<ConversationInfo> = OrderedToc::new("inbox");
        toc.load(Vec::new());
        let conv = |folders: &[&str]| ConversationInfo {
            id: "c1".into(),
            account_id: "a1".into(),
            folder_ids: folders.iter().map(|s| s.to_string()).collect(),
            subject: "hi".into(),
            date: 1,
            message_count: 1,
            message_ids: Vec::new(),
        };

        toc.add_or_update(conv(&["inbox"]));
        assert_eq!(toc.len(), 1);
        toc.add_or_update(conv(&["archive"]));
        assert!(toc.is_empty());
    }

    #[test]
    fn random_churn_keeps_order() {
        let toc = accounts_toc();
        let mut rng = rand::thread_rng();
        for _ in 0..500 {
            let id = format!("acct{}", rng.gen_range(0..40));
            if rng.gen_bool(0.25) {
                toc.remove(&id);
            } else {
                let name = format!("name{:03}", rng.gen_range(0..100));
                toc.add_or_update(AccountDef::new(id, name));
            }
        }

        let items = toc.slice(0, usize::MAX);
        assert!(items.windows(2).all(|w| total_order(&w[0], &w[1]) == Ordering::Less));
    }
}
