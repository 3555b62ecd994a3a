//! Task lifecycle.

use serde::{Deserialize, Serialize};

/// Lifecycle state of a task.
///
/// State transitions:
/// - Pending -> Planning -> Planned -> Queued -> Executing -> Completed
/// - ... -> Executing -> RetryScheduled -> Queued (retryable failure, backoff)
/// - ... -> Executing -> Failed (permanent failure or attempts exhausted)
/// - Planning -> Failed (planning error, never retried)
/// - Pending -> Superseded (binned into an earlier live task)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TaskState {
    Pending,
    Planning,
    Planned,
    Queued,
    Executing,
    RetryScheduled,
    Completed,
    Failed,
    Superseded,
}

impl TaskState {
    /// Is this a terminal state (no further transitions)?
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskState::Completed | TaskState::Failed | TaskState::Superseded
        )
    }

    /// Can the scheduler pick this task?
    pub fn is_runnable(self) -> bool {
        matches!(self, TaskState::Queued)
    }

    /// Does a task in this state occupy its bin key?
    pub fn holds_bin(self) -> bool {
        !self.is_terminal() && self != TaskState::Pending
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TaskState::Pending => "pending",
            TaskState::Planning => "planning",
            TaskState::Planned => "planned",
            TaskState::Queued => "queued",
            TaskState::Executing => "executing",
            TaskState::RetryScheduled => "retryScheduled",
            TaskState::Completed => "completed",
            TaskState::Failed => "failed",
            TaskState::Superseded => "superseded",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::completed(TaskState::Completed)]
    #[case::failed(TaskState::Failed)]
    #[case::superseded(TaskState::Superseded)]
    fn terminal_states(#[case] state: TaskState) {
        assert!(state.is_terminal());
        assert!(!state.holds_bin());
    }

    #[rstest]
    #[case::planned(TaskState::Planned)]
    #[case::queued(TaskState::Queued)]
    #[case::executing(TaskState::Executing)]
    #[case::retry(TaskState::RetryScheduled)]
    fn live_states_hold_their_bin(#[case] state: TaskState) {
        assert!(!state.is_terminal());
        assert!(state.holds_bin());
    }

    #[test]
    fn only_queued_is_runnable() {
        assert!(TaskState::Queued.is_runnable());
        assert!(!TaskState::RetryScheduled.is_runnable());
        assert!(!TaskState::Executing.is_runnable());
    }

    #[test]
    fn as_str_matches_serde_name() {
        let s = serde_json::to_string(&TaskState::RetryScheduled).unwrap();
        assert_eq!(s, format!("\"{}\"", TaskState::RetryScheduled.as_str()));
    }
}
