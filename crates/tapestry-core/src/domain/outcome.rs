//! Plan and execute results.
//!
//! A plan is the cheap, lock-free first phase of a task: it decides what the
//! task will need (resources, group, priority tags) and produces the state
//! that gets persisted. Execute is the second phase and returns everything the
//! engine must commit and announce on success.

use serde::Serialize;
use serde_json::Value;

use super::{AtomicClobbers, MutationSet, OverlayKey, RawTask};

/// Typed result of the plan phase.
#[derive(Debug, Clone, PartialEq)]
pub struct Plan<T> {
    pub state: T,
    pub resources: Vec<String>,
    pub priority_tags: Vec<String>,
    pub group: Option<String>,
}

impl<T> Plan<T> {
    pub fn new(state: T) -> Self {
        Self {
            state,
            resources: Vec::new(),
            priority_tags: Vec::new(),
            group: None,
        }
    }

    /// Adds an exclusive resource; duplicates are ignored, order is kept.
    pub fn with_resource(mut self, resource: impl Into<String>) -> Self {
        push_unique(&mut self.resources, resource.into());
        self
    }

    pub fn with_priority_tag(mut self, tag: impl Into<String>) -> Self {
        push_unique(&mut self.priority_tags, tag.into());
        self
    }

    /// Tracks the task (and everything it spawns) in the named group.
    pub fn in_group(mut self, group: impl Into<String>) -> Self {
        self.group = Some(group.into());
        self
    }
}

impl<T: Serialize> Plan<T> {
    pub fn erase(self) -> Result<PlanOutcome, serde_json::Error> {
        Ok(PlanOutcome {
            state: serde_json::to_value(&self.state)?,
            resources: self.resources,
            priority_tags: self.priority_tags,
            group: self.group,
        })
    }
}

/// Type-erased plan, as the runtime sees it.
#[derive(Debug, Clone, PartialEq)]
pub struct PlanOutcome {
    pub state: Value,
    pub resources: Vec<String>,
    pub priority_tags: Vec<String>,
    pub group: Option<String>,
}

fn push_unique(items: &mut Vec<String>, item: String) {
    if !items.contains(&item) {
        items.push(item);
    }
}

/// Everything a successful execute phase hands back to the engine.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExecuteOutcome {
    pub mutations: MutationSet,
    pub atomic_clobbers: AtomicClobbers,
    /// Offspring, enqueued after the commit and tracked in the parent's group.
    pub new_tasks: Vec<RawTask>,
    pub invalidated_overlays: Vec<OverlayKey>,
}

impl ExecuteOutcome {
    pub fn done() -> Self {
        Self::default()
    }

    pub fn with_mutations(mut self, mutations: MutationSet) -> Self {
        self.mutations.merge(mutations);
        self
    }

    pub fn with_clobbers(mut self, clobbers: AtomicClobbers) -> Self {
        self.atomic_clobbers = clobbers;
        self
    }

    pub fn spawn(mut self, task: RawTask) -> Self {
        self.new_tasks.push(task);
        self
    }

    pub fn invalidate(mut self, namespace: impl Into<String>, id: impl Into<String>) -> Self {
        self.invalidated_overlays.push(OverlayKey::new(namespace, id));
        self
    }
}
