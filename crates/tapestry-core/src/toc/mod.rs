//! TOCs: in-memory ordered views over one collection, kept current by store
//! change events.
//!
//! A TOC never writes to the store. It only reacts to committed mutations
//! and tells its listeners, with positions, what moved.

mod items;
mod ordered;
mod registry;

pub use items::ACCOUNT_CASCADE_TO_FOLDERS;
pub use ordered::{OrderedToc, TocListener, TocListenerId};
pub use registry::TocRegistry;

use std::cmp::Ordering;

use serde_json::Value;

use crate::domain::{Collection, OverlayKey};

/// An entity projection that can live in a TOC.
pub trait TocItem: Clone + Send + Sync + 'static {
    const COLLECTION: Collection;

    /// Overlay namespace of these items, e.g. `accounts`.
    const OVERLAY_NAMESPACE: &'static str;

    fn id(&self) -> &str;

    fn decode(value: &Value) -> Option<Self>;

    /// Whether the item belongs in the TOC for `scope` (an account id for
    /// folders, a folder id for conversations, ...).
    fn in_scope(&self, scope: &str) -> bool;

    /// TOC order. Ties are broken by id.
    fn compare(&self, other: &Self) -> Ordering;

    fn to_wire(&self) -> Value;

    /// Whether an overlay announcement about something else (e.g. the
    /// owning account) affects every item in the TOC for `scope`.
    fn cascades(_key: &OverlayKey, _scope: &str) -> bool {
        false
    }
}

/// What happened to a TOC. Indexes are valid against the TOC contents right
/// after the event.
#[derive(Debug, Clone, PartialEq)]
pub enum TocEvent<T> {
    Add { item: T, index: usize },
    Change { item: T, index: usize },
    Remove { id: String, index: usize },
}

impl<T> TocEvent<T> {
    pub fn index(&self) -> usize {
        match self {
            TocEvent::Add { index, .. }
            | TocEvent::Change { index, .. }
            | TocEvent::Remove { index, .. } => *index,
        }
    }
}
