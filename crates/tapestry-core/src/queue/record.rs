//! Task record: planned task + lifecycle metadata + completion signal.

use std::time::Instant;

use tokio::sync::watch;

use crate::domain::{EngineError, OverlayKey, PlannedTask, TaskFailure, TaskId, TaskState};

/// Value of a completion signal: `None` until settled.
pub type Settlement = Option<Result<(), TaskFailure>>;

/// A joinable completion signal for a task or a group.
///
/// Any number of handles may wait on the same signal; they all observe the
/// same settlement.
#[derive(Debug, Clone)]
pub struct Completion {
    rx: watch::Receiver<Settlement>,
}

impl Completion {
    pub(crate) fn channel() -> (watch::Sender<Settlement>, Self) {
        let (tx, rx) = watch::channel(None);
        (tx, Self { rx })
    }

    pub(crate) fn from_sender(tx: &watch::Sender<Settlement>) -> Self {
        Self { rx: tx.subscribe() }
    }

    /// An already-settled signal.
    pub(crate) fn settled(result: Result<(), TaskFailure>) -> Self {
        let (_tx, rx) = watch::channel(Some(result));
        Self { rx }
    }

    pub fn is_settled(&self) -> bool {
        self.rx.borrow().is_some()
    }

    pub async fn wait(mut self) -> Result<(), EngineError> {
        let settled = self
            .rx
            .wait_for(Option::is_some)
            .await
            .map_err(|_| EngineError::Invariant("completion signal dropped unsettled".into()))?
            .clone();
        match settled {
            Some(Ok(())) => Ok(()),
            Some(Err(failure)) => Err(EngineError::Task(failure)),
            None => Err(EngineError::Invariant("completion signal dropped unsettled".into())),
        }
    }
}

/// Lifecycle metadata for one live task.
///
/// The scheduler is the single owner; every state transition happens through
/// the methods here.
#[derive(Debug)]
pub struct TaskRecord {
    pub planned: PlannedTask,
    pub state: TaskState,

    /// Enqueue order, for FIFO tie-breaking. Refreshed on requeue.
    pub seq: u64,

    /// Number of execute attempts, including the current one if executing.
    pub attempts: u32,
    pub max_attempts: u32,
    pub last_error: Option<String>,

    /// When to retry next (RetryScheduled only).
    pub next_run_at: Option<Instant>,

    /// Groups tracking this task; offspring inherit them.
    pub groups: Vec<String>,

    /// Overlay reporting this task's progress, if its kind has one.
    pub overlay: Option<OverlayKey>,

    completion: watch::Sender<Settlement>,

    pub created_at: Instant,
    pub updated_at: Instant,
}

impl TaskRecord {
    pub fn new(planned: PlannedTask, seq: u64, max_attempts: u32) -> (Self, Completion) {
        let (completion, handle) = Completion::channel();
        let now = Instant::now();
        let record = Self {
            planned,
            state: TaskState::Planned,
            seq,
            attempts: 0,
            max_attempts,
            last_error: None,
            next_run_at: None,
            groups: Vec::new(),
            overlay: None,
            completion,
            created_at: now,
            updated_at: now,
        };
        (record, handle)
    }

    pub fn id(&self) -> TaskId {
        self.planned.id
    }

    pub fn completion(&self) -> Completion {
        Completion::from_sender(&self.completion)
    }

    pub fn enqueue(&mut self, seq: u64) {
        self.state = TaskState::Queued;
        self.seq = seq;
        self.touch();
    }

    pub fn start_attempt(&mut self) {
        self.state = TaskState::Executing;
        self.attempts += 1;
        self.touch();
    }

    pub fn schedule_retry(&mut self, next_run_at: Instant, error: String) {
        self.state = TaskState::RetryScheduled;
        self.next_run_at = Some(next_run_at);
        self.last_error = Some(error);
        self.touch();
    }

    /// RetryScheduled -> Queued.
    pub fn requeue(&mut self, seq: u64) {
        self.next_run_at = None;
        self.enqueue(seq);
    }

    /// Replaces the plan after a failed commit; the task goes back in line.
    pub fn replan(&mut self, planned: PlannedTask, seq: u64, error: String) {
        self.planned = planned;
        self.last_error = Some(error);
        self.enqueue(seq);
    }

    pub fn mark_completed(&mut self) {
        self.state = TaskState::Completed;
        self.touch();
        self.completion.send_replace(Some(Ok(())));
    }

    pub fn mark_failed(&mut self, failure: TaskFailure) {
        self.state = TaskState::Failed;
        self.last_error = Some(failure.message.clone());
        self.touch();
        self.completion.send_replace(Some(Err(failure)));
    }

    fn touch(&mut self) {
        self.updated_at = Instant::now();
    }
}
