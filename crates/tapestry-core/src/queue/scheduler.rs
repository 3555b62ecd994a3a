//! Scheduler state: live task records, resource locks, bins, groups and the
//! retry backoff heap.
//!
//! Everything here is plain synchronous bookkeeping. The runtime keeps one
//! `Scheduler` behind a mutex and never holds it across an `.await`.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::time::Instant;

use super::group::{SettledGroup, TaskGroups};
use super::lock_table::{Acquire, ResourceLockTable};
use super::record::{Completion, TaskRecord};
use crate::domain::{GroupId, PlannedTask, TaskFailure, TaskId, TaskKind, TaskState};

/// Retry entry; the heap pops the earliest `next_run_at` first.
#[derive(Debug, Clone, PartialEq, Eq)]
struct ScheduledTask {
    next_run_at: Instant,
    task_id: TaskId,
}

impl PartialOrd for ScheduledTask {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ScheduledTask {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        other
            .next_run_at
            .cmp(&self.next_run_at)
            .then_with(|| other.task_id.cmp(&self.task_id))
    }
}

/// Per-state task counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TaskCounts {
    pub planned: usize,
    pub queued: usize,
    pub executing: usize,
    pub retry_scheduled: usize,
}

impl TaskCounts {
    pub fn live(&self) -> usize {
        self.planned + self.queued + self.executing + self.retry_scheduled
    }
}

/// A terminal task, removed from the scheduler.
#[derive(Debug)]
pub struct Finished {
    pub record: TaskRecord,
    pub groups: Vec<SettledGroup>,
}

#[derive(Debug)]
pub struct Scheduler {
    records: HashMap<TaskId, TaskRecord>,
    locks: ResourceLockTable,
    groups: TaskGroups,
    bins: HashMap<(TaskKind, String), TaskId>,
    /// Boost per tag and how many holders set it.
    priorities: HashMap<String, (i32, usize)>,
    scheduled: BinaryHeap<ScheduledTask>,
    executing: usize,
    max_concurrent: usize,
    next_seq: u64,
}

impl Scheduler {
    pub fn new(max_concurrent: usize) -> Self {
        Self {
            records: HashMap::new(),
            locks: ResourceLockTable::new(),
            groups: TaskGroups::new(),
            bins: HashMap::new(),
            priorities: HashMap::new(),
            scheduled: BinaryHeap::new(),
            executing: 0,
            max_concurrent: max_concurrent.max(1),
            next_seq: 0,
        }
    }

    fn allocate_seq(&mut self) -> u64 {
        self.next_seq += 1;
        self.next_seq
    }

    /// Live task occupying `(kind, key)`, if any.
    pub fn bin_holder(&self, kind: &TaskKind, key: &str) -> Option<TaskId> {
        self.bins
            .get(&(kind.clone(), key.to_string()))
            .copied()
            .filter(|id| self.records.get(id).is_some_and(|r| r.state.holds_bin()))
    }

    /// Adds a freshly planned task in the `Planned` state.
    pub fn insert(&mut self, planned: PlannedTask, max_attempts: u32) -> Completion {
        let seq = self.allocate_seq();
        let id = planned.id;
        if let Some(key) = &planned.bin_key {
            self.bins.insert((planned.kind.clone(), key.clone()), id);
        }
        let (record, completion) = TaskRecord::new(planned, seq, max_attempts);
        self.records.insert(id, record);
        completion
    }

    /// Planned -> Queued.
    pub fn enqueue(&mut self, id: TaskId) {
        let seq = self.allocate_seq();
        if let Some(record) = self.records.get_mut(&id) {
            record.enqueue(seq);
        }
    }

    pub fn get(&self, id: TaskId) -> Option<&TaskRecord> {
        self.records.get(&id)
    }

    pub fn get_mut(&mut self, id: TaskId) -> Option<&mut TaskRecord> {
        self.records.get_mut(&id)
    }

    pub fn completion(&self, id: TaskId) -> Option<Completion> {
        self.records.get(&id).map(TaskRecord::completion)
    }

    /// Adds `id` to the named group. Returns the group's signal.
    pub fn track_group(
        &mut self,
        name: &str,
        id: TaskId,
        new_id: impl FnOnce() -> GroupId,
    ) -> Completion {
        if let Some(record) = self.records.get_mut(&id)
            && !record.groups.iter().any(|g| g == name)
        {
            record.groups.push(name.to_string());
        }
        self.groups.track(name, id, new_id)
    }

    pub fn group_completion(&self, name: &str) -> Option<Completion> {
        self.groups.completion(name)
    }

    /// Boosts `tag` for one more holder. The latest boost value wins.
    pub fn set_priority(&mut self, tag: impl Into<String>, boost: i32) {
        let entry = self.priorities.entry(tag.into()).or_insert((boost, 0));
        entry.0 = boost;
        entry.1 += 1;
    }

    /// Drops one holder; the boost goes away with the last one.
    pub fn clear_priority(&mut self, tag: &str) {
        if let Some(entry) = self.priorities.get_mut(tag) {
            entry.1 = entry.1.saturating_sub(1);
            if entry.1 == 0 {
                self.priorities.remove(tag);
            }
        }
    }

    pub fn boost(&self, tag: &str) -> Option<i32> {
        self.priorities.get(tag).map(|(boost, _)| *boost)
    }

    /// Highest boost over the task's tags; 0 when none is boosted.
    pub fn priority_of(&self, planned: &PlannedTask) -> i32 {
        planned
            .priority_tags
            .iter()
            .filter_map(|tag| self.boost(tag))
            .max()
            .unwrap_or(0)
    }

    /// Picks the next task to execute and takes its resources.
    ///
    /// Among queued tasks whose resources are all free, the highest priority
    /// wins; ties go to the earliest enqueued. Returns `None` when nothing is
    /// runnable or the concurrency cap is reached.
    pub fn next_runnable(&mut self) -> Option<TaskId> {
        if self.executing >= self.max_concurrent {
            return None;
        }
        let id = self
            .records
            .values()
            .filter(|r| r.state.is_runnable())
            .filter(|r| {
                self.locks
                    .conflict(r.id(), &r.planned.exclusive_resources)
                    .is_none()
            })
            .max_by_key(|r| (self.priority_of(&r.planned), Reverse(r.seq)))
            .map(TaskRecord::id)?;

        let record = self.records.get_mut(&id)?;
        match self
            .locks
            .try_acquire(id, &record.planned.exclusive_resources)
        {
            Acquire::Held => {
                record.start_attempt();
                self.executing += 1;
                Some(id)
            }
            Acquire::Conflict { .. } => None,
        }
    }

    /// Ends an execute phase: releases resources and frees a slot.
    pub fn end_attempt(&mut self, id: TaskId) {
        if let Some(record) = self.records.get(&id)
            && record.state == TaskState::Executing
        {
            self.locks.release(id, &record.planned.exclusive_resources);
            self.executing = self.executing.saturating_sub(1);
        }
    }

    pub fn schedule_retry(&mut self, id: TaskId, next_run_at: Instant, error: String) {
        self.end_attempt(id);
        if let Some(record) = self.records.get_mut(&id) {
            record.schedule_retry(next_run_at, error);
            self.scheduled.push(ScheduledTask {
                next_run_at,
                task_id: id,
            });
        }
    }

    /// Moves due retries back to `Queued`. Returns how many were promoted.
    pub fn promote_due(&mut self, now: Instant) -> usize {
        let mut promoted = 0;
        while let Some(entry) = self.scheduled.peek() {
            if entry.next_run_at > now {
                break;
            }
            let Some(entry) = self.scheduled.pop() else {
                break;
            };
            let seq = self.allocate_seq();
            if let Some(record) = self.records.get_mut(&entry.task_id)
                && record.state == TaskState::RetryScheduled
            {
                record.requeue(seq);
                promoted += 1;
            }
        }
        promoted
    }

    pub fn next_retry_at(&self) -> Option<Instant> {
        self.scheduled.peek().map(|entry| entry.next_run_at)
    }

    /// Puts a task back in line with a new plan after a failed commit.
    pub fn replan(&mut self, id: TaskId, planned: PlannedTask, error: String) {
        self.end_attempt(id);
        let seq = self.allocate_seq();
        if let Some(record) = self.records.get_mut(&id) {
            record.replan(planned, seq, error);
        }
    }

    pub fn complete(&mut self, id: TaskId) -> Option<Finished> {
        self.finish(id, Ok(()))
    }

    pub fn fail(&mut self, id: TaskId, failure: TaskFailure) -> Option<Finished> {
        self.finish(id, Err(failure))
    }

    fn finish(&mut self, id: TaskId, result: Result<(), TaskFailure>) -> Option<Finished> {
        self.end_attempt(id);
        let mut record = self.records.remove(&id)?;
        if let Some(key) = &record.planned.bin_key {
            let bin = (record.planned.kind.clone(), key.clone());
            if self.bins.get(&bin) == Some(&id) {
                self.bins.remove(&bin);
            }
        }
        match &result {
            Ok(()) => record.mark_completed(),
            Err(failure) => record.mark_failed(failure.clone()),
        }
        let groups = self.groups.settle_member(id, &record.groups, &result);
        Some(Finished { record, groups })
    }

    pub fn counts(&self) -> TaskCounts {
        let mut counts = TaskCounts::default();
        for record in self.records.values() {
            match record.state {
                TaskState::Planned | TaskState::Pending | TaskState::Planning => {
                    counts.planned += 1
                }
                TaskState::Queued => counts.queued += 1,
                TaskState::Executing => counts.executing += 1,
                TaskState::RetryScheduled => counts.retry_scheduled += 1,
                TaskState::Completed | TaskState::Failed | TaskState::Superseded => {}
            }
        }
        counts
    }

    pub fn holder(&self, resource: &str) -> Option<TaskId> {
        self.locks.holder(resource)
    }
}
