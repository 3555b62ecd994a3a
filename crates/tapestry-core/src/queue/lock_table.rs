//! Resource lock table: named exclusive resources and their holder.

use std::collections::HashMap;

use crate::domain::TaskId;

/// Result of [`ResourceLockTable::try_acquire`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Acquire {
    Held,
    /// Nothing was acquired; `resource` is held by `holder`.
    Conflict { resource: String, holder: TaskId },
}

/// Maps each held resource name to the task holding it.
///
/// Acquisition is all-or-nothing: either every requested name is free (or
/// already held by the same task) and all are taken, or nothing changes.
#[derive(Debug, Default)]
pub struct ResourceLockTable {
    held: HashMap<String, TaskId>,
}

impl ResourceLockTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// First resource in `resources` held by a task other than `task`.
    pub fn conflict<'a>(&self, task: TaskId, resources: &'a [String]) -> Option<(&'a str, TaskId)> {
        resources.iter().find_map(|name| match self.held.get(name) {
            Some(holder) if *holder != task => Some((name.as_str(), *holder)),
            _ => None,
        })
    }

    pub fn try_acquire(&mut self, task: TaskId, resources: &[String]) -> Acquire {
        if let Some((resource, holder)) = self.conflict(task, resources) {
            return Acquire::Conflict {
                resource: resource.to_string(),
                holder,
            };
        }
        for name in resources {
            self.held.insert(name.clone(), task);
        }
        Acquire::Held
    }

    /// Releases the names held by `task`. Names held by someone else, or not
    /// held at all, are left alone, so releasing twice is harmless.
    pub fn release(&mut self, task: TaskId, resources: &[String]) {
        for name in resources {
            if self.held.get(name) == Some(&task) {
                self.held.remove(name);
            }
        }
    }

    pub fn holder(&self, resource: &str) -> Option<TaskId> {
        self.held.get(resource).copied()
    }

    pub fn is_empty(&self) -> bool {
        self.held.is_empty()
    }
}
