//! Mutation sets, atomic clobbers and the change events they raise.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Entity collections of the durable store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Collection {
    Accounts,
    Folders,
    Conversations,
    Messages,
    SyncStates,
    Tasks,
}

impl Collection {
    pub const ALL: [Collection; 6] = [
        Collection::Accounts,
        Collection::Folders,
        Collection::Conversations,
        Collection::Messages,
        Collection::SyncStates,
        Collection::Tasks,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Collection::Accounts => "accounts",
            Collection::Folders => "folders",
            Collection::Conversations => "conversations",
            Collection::Messages => "messages",
            Collection::SyncStates => "syncStates",
            Collection::Tasks => "tasks",
        }
    }
}

impl fmt::Display for Collection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A batch of writes applied atomically.
///
/// `None` as a value means "delete this entity".
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MutationSet {
    writes: BTreeMap<Collection, BTreeMap<String, Option<Value>>>,
}

impl MutationSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&mut self, collection: Collection, id: impl Into<String>, value: Value) {
        self.writes
            .entry(collection)
            .or_default()
            .insert(id.into(), Some(value));
    }

    pub fn delete(&mut self, collection: Collection, id: impl Into<String>) {
        self.writes
            .entry(collection)
            .or_default()
            .insert(id.into(), None);
    }

    pub fn with_put(mut self, collection: Collection, id: impl Into<String>, value: Value) -> Self {
        self.put(collection, id, value);
        self
    }

    pub fn with_delete(mut self, collection: Collection, id: impl Into<String>) -> Self {
        self.delete(collection, id);
        self
    }

    /// Folds `other` into `self`; later writes to the same entity win.
    pub fn merge(&mut self, other: MutationSet) {
        for (collection, writes) in other.writes {
            self.writes.entry(collection).or_default().extend(writes);
        }
    }

    /// Writes in commit order: collections in declaration order, ids sorted.
    pub fn iter(&self) -> impl Iterator<Item = (Collection, &str, Option<&Value>)> {
        self.writes.iter().flat_map(|(collection, writes)| {
            writes
                .iter()
                .map(move |(id, value)| (*collection, id.as_str(), value.as_ref()))
        })
    }

    pub fn get(&self, collection: Collection, id: &str) -> Option<Option<&Value>> {
        self.writes
            .get(&collection)
            .and_then(|writes| writes.get(id))
            .map(Option::as_ref)
    }

    pub fn len(&self) -> usize {
        self.writes.values().map(BTreeMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Partial-field patches merged into existing records without a prior read.
///
/// Used for fields that take no part in conflict logic, such as sync
/// timestamps. Each patch is a JSON object whose top-level fields replace the
/// stored record's fields.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AtomicClobbers {
    patches: BTreeMap<Collection, BTreeMap<String, serde_json::Map<String, Value>>>,
}

impl AtomicClobbers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn patch(&mut self, collection: Collection, id: impl Into<String>, field: impl Into<String>, value: Value) {
        self.patches
            .entry(collection)
            .or_default()
            .entry(id.into())
            .or_default()
            .insert(field.into(), value);
    }

    pub fn with_patch(
        mut self,
        collection: Collection,
        id: impl Into<String>,
        field: impl Into<String>,
        value: Value,
    ) -> Self {
        self.patch(collection, id, field, value);
        self
    }

    pub fn iter(&self) -> impl Iterator<Item = (Collection, &str, &serde_json::Map<String, Value>)> {
        self.patches.iter().flat_map(|(collection, patches)| {
            patches
                .iter()
                .map(move |(id, patch)| (*collection, id.as_str(), patch))
        })
    }

    pub fn is_empty(&self) -> bool {
        self.patches.values().all(BTreeMap::is_empty)
    }
}

/// Applies a clobber patch to a stored record (top-level field replace).
pub fn apply_clobber(record: &mut Value, patch: &serde_json::Map<String, Value>) {
    match record {
        Value::Object(fields) => {
            for (key, value) in patch {
                fields.insert(key.clone(), value.clone());
            }
        }
        other => *other = Value::Object(patch.clone()),
    }
}

/// Raised once per written entity after a successful commit.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeEvent {
    pub collection: Collection,
    pub id: String,
    /// New value, or `None` when the entity was deleted.
    pub value: Option<Value>,
}

impl ChangeEvent {
    pub fn is_deletion(&self) -> bool {
        self.value.is_none()
    }
}

/// Identifies one overlay entry: `(namespace, id)`, e.g. `("accounts", "a1")`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OverlayKey {
    pub namespace: String,
    pub id: String,
}

impl OverlayKey {
    pub fn new(namespace: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            id: id.into(),
        }
    }
}

/// Ids to read per collection, e.g. for `begin_mutate`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReadRequest {
    ids: BTreeMap<Collection, BTreeSet<String>>,
}

impl ReadRequest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, collection: Collection, id: impl Into<String>) -> Self {
        self.ids.entry(collection).or_default().insert(id.into());
        self
    }

    pub fn iter(&self) -> impl Iterator<Item = (Collection, &str)> {
        self.ids
            .iter()
            .flat_map(|(collection, ids)| ids.iter().map(move |id| (*collection, id.as_str())))
    }
}

/// Result of a read; missing entities are absent.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReadResult {
    values: BTreeMap<Collection, BTreeMap<String, Value>>,
}

impl ReadResult {
    pub fn insert(&mut self, collection: Collection, id: impl Into<String>, value: Value) {
        self.values
            .entry(collection)
            .or_default()
            .insert(id.into(), value);
    }

    pub fn get(&self, collection: Collection, id: &str) -> Option<&Value> {
        self.values.get(&collection).and_then(|values| values.get(id))
    }

    /// Decodes one entity, if present.
    pub fn decode<T: serde::de::DeserializeOwned>(
        &self,
        collection: Collection,
        id: &str,
    ) -> Result<Option<T>, serde_json::Error> {
        self.get(collection, id)
            .map(|value| serde_json::from_value(value.clone()))
            .transpose()
    }
}
