//! Strongly-typed identifiers.
//!
//! Task and group ids are ULIDs wrapped in a phantom-typed `Id<T>` so that a
//! `TaskId` can never be passed where a `GroupId` is expected. ULIDs sort by
//! creation time, which keeps log output and persisted task records in
//! submission order.
//!
//! Entity ids (accounts, folders, conversations, messages) are plain strings
//! owned by the remote side and are not modelled here.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::marker::PhantomData;
use ulid::Ulid;

/// Marker trait providing the display prefix of an id family.
pub trait IdMarker: Send + Sync + 'static {
    fn prefix() -> &'static str;
}

/// Generic ULID-backed id.
///
/// ```ignore
/// let task: TaskId = Id::from(Ulid::new());
/// let group: GroupId = Id::from(Ulid::new());
/// // task and group are different types and cannot be mixed up
/// ```
#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Id<T: IdMarker> {
    ulid: Ulid,
    #[serde(skip)]
    _marker: PhantomData<T>,
}

impl<T: IdMarker> Id<T> {
    pub fn from_ulid(ulid: Ulid) -> Self {
        Self {
            ulid,
            _marker: PhantomData,
        }
    }

    pub fn as_ulid(&self) -> Ulid {
        self.ulid
    }

    /// Deterministic id for tests.
    #[cfg(test)]
    pub fn from_raw(value: u128) -> Self {
        Self::from_ulid(Ulid(value))
    }
}

impl<T: IdMarker> From<Ulid> for Id<T> {
    fn from(ulid: Ulid) -> Self {
        Self::from_ulid(ulid)
    }
}

impl<T: IdMarker> fmt::Display for Id<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", T::prefix(), self.ulid)
    }
}

/// Task marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Task {}

impl IdMarker for Task {
    fn prefix() -> &'static str {
        "task-"
    }
}

/// Task group marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Group {}

impl IdMarker for Group {
    fn prefix() -> &'static str {
        "group-"
    }
}

/// Identifier of a scheduled task.
pub type TaskId = Id<Task>;

/// Identifier of one incarnation of a named task group.
pub type GroupId = Id<Group>;
