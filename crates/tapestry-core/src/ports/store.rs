//! Store port: the durable entity store.
//!
//! The store is the only mutable state shared between tasks. Commits are
//! atomic: after a failed commit nothing of it is visible, and listeners only
//! ever see the change events of successful commits, in commit order.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::domain::{AtomicClobbers, ChangeEvent, Collection, MutationSet, ReadRequest, ReadResult, Result};

/// Receives the change events of one collection.
///
/// Called synchronously during the commit that produced the event; must not
/// call back into the store.
pub type ChangeListener = Arc<dyn Fn(&ChangeEvent) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WatchId(pub u64);

/// A registered listener plus the collection contents at registration time.
///
/// Every commit is either part of `snapshot` or delivered to the listener,
/// never both and never neither.
#[derive(Debug)]
pub struct Watch {
    pub id: WatchId,
    pub snapshot: Vec<(String, Value)>,
}

/// A listener on one entity plus its value at registration time.
#[derive(Debug)]
pub struct ItemWatch {
    pub id: WatchId,
    pub value: Option<Value>,
}

#[async_trait]
pub trait Store: Send + Sync {
    async fn read(&self, request: &ReadRequest) -> Result<ReadResult>;

    /// Every entity of a collection, ordered by id.
    async fn scan(&self, collection: Collection) -> Result<Vec<(String, Value)>>;

    /// Applies mutations then clobbers atomically and raises one change event
    /// per written entity.
    async fn commit(&self, mutations: &MutationSet, clobbers: &AtomicClobbers) -> Result<()>;

    fn watch(&self, collection: Collection, listener: ChangeListener) -> Result<Watch>;

    /// Like [`Store::watch`] for a single entity: the listener only hears
    /// events for `id`.
    fn watch_item(&self, collection: Collection, id: &str, listener: ChangeListener) -> Result<ItemWatch>;

    fn unwatch(&self, id: WatchId);
}
