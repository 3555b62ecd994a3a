//! Task groups: a root task plus everything it spawns, tracked to completion.

use std::collections::{BTreeSet, HashMap};

use tokio::sync::watch;

use super::record::{Completion, Settlement};
use crate::domain::{GroupId, TaskFailure, TaskId};

#[derive(Debug)]
struct GroupState {
    id: GroupId,
    members: BTreeSet<TaskId>,
    /// First member failure; reported when the group settles.
    failure: Option<TaskFailure>,
    tx: watch::Sender<Settlement>,
}

/// How a group ended, returned by [`TaskGroups::settle_member`].
#[derive(Debug, Clone, PartialEq)]
pub struct SettledGroup {
    pub name: String,
    pub id: GroupId,
    pub result: Result<(), TaskFailure>,
}

/// Live groups by name.
///
/// A group exists from the first tracked member until its last member is
/// terminal; then its signal fires once and the name is free for a new
/// incarnation.
#[derive(Debug, Default)]
pub struct TaskGroups {
    groups: HashMap<String, GroupState>,
}

impl TaskGroups {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `task` to the named group, creating the group if needed.
    pub fn track(
        &mut self,
        name: &str,
        task: TaskId,
        new_id: impl FnOnce() -> GroupId,
    ) -> Completion {
        let group = self.groups.entry(name.to_string()).or_insert_with(|| {
            let (tx, _) = watch::channel(None);
            GroupState {
                id: new_id(),
                members: BTreeSet::new(),
                failure: None,
                tx,
            }
        });
        group.members.insert(task);
        Completion::from_sender(&group.tx)
    }

    pub fn completion(&self, name: &str) -> Option<Completion> {
        self.groups
            .get(name)
            .map(|group| Completion::from_sender(&group.tx))
    }

    pub fn id(&self, name: &str) -> Option<GroupId> {
        self.groups.get(name).map(|group| group.id)
    }

    pub fn is_live(&self, name: &str) -> bool {
        self.groups.contains_key(name)
    }

    /// Records that `task` reached a terminal state.
    ///
    /// Returns the groups that settled because of it: those whose last
    /// remaining member was `task`.
    pub fn settle_member(
        &mut self,
        task: TaskId,
        groups: &[String],
        result: &Result<(), TaskFailure>,
    ) -> Vec<SettledGroup> {
        let mut settled = Vec::new();
        for name in groups {
            let Some(group) = self.groups.get_mut(name) else {
                continue;
            };
            if !group.members.remove(&task) {
                continue;
            }
            if let Err(failure) = result
                && group.failure.is_none()
            {
                group.failure = Some(failure.clone());
            }
            if !group.members.is_empty() {
                continue;
            }
            if let Some(group) = self.groups.remove(name) {
                let result = match group.failure {
                    Some(failure) => Err(failure),
                    None => Ok(()),
                };
                group.tx.send_replace(Some(result.clone()));
                settled.push(SettledGroup {
                    name: name.clone(),
                    id: group.id,
                    result,
                });
            }
        }
        settled
    }
}
