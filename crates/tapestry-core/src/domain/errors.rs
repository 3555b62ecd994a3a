//! Errors and their operational classification.

use serde::{Deserialize, Serialize};
use std::fmt;

use super::{TaskId, TaskKind};

/// How the engine reacts to an error.
///
/// - Planning: fatal to the request, never retried, rejected to the caller
/// - Transient: retried with backoff while attempts remain
/// - Permanent: fails the task; may carry an account problem
/// - Commit: the attempt is discarded and the task re-planned
/// - Invariant: internal inconsistency, fails loudly
/// - Bridge: malformed or unroutable bridge command
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ErrorKind {
    Planning,
    Transient,
    Permanent,
    Commit,
    Invariant,
    Bridge,
}

/// Account-level problem reported by a protocol collaborator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AccountProblem {
    BadUserOrPass,
    BadAddress,
    NeedsOauthReauth,
    ImapDisabled,
    Connection,
}

impl AccountProblem {
    /// Problems that only the user can fix (credentials, account settings).
    ///
    /// `clearAccountProblems` keeps problems while any side still reports one
    /// of these.
    pub fn is_authentication(self) -> bool {
        !matches!(self, AccountProblem::Connection)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            AccountProblem::BadUserOrPass => "bad-user-or-pass",
            AccountProblem::BadAddress => "bad-address",
            AccountProblem::NeedsOauthReauth => "needs-oauth-reauth",
            AccountProblem::ImapDisabled => "imap-disabled",
            AccountProblem::Connection => "connection",
        }
    }
}

impl fmt::Display for AccountProblem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A task failure as seen by every waiter joined to the task or its group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskFailure {
    pub task_id: TaskId,
    pub kind: TaskKind,
    pub error_kind: ErrorKind,
    pub message: String,
}

impl fmt::Display for TaskFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} ({}) failed [{:?}]: {}",
            self.task_id, self.kind, self.error_kind, self.message
        )
    }
}

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("planning failed: {0}")]
    Planning(String),

    #[error("no handler registered for task kind '{0}'")]
    UnknownKind(String),

    #[error("transient failure: {0}")]
    Transient(String),

    #[error("permanent failure: {message}")]
    Permanent {
        message: String,
        problem: Option<AccountProblem>,
    },

    #[error("commit failed: {0}")]
    Commit(String),

    #[error("invariant violated: {0}")]
    Invariant(String),

    #[error("bridge: {0}")]
    Bridge(String),

    #[error("unknown account '{0}'")]
    UnknownAccount(String),

    #[error("json: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{0}")]
    Task(TaskFailure),
}

pub type Result<T, E = EngineError> = std::result::Result<T, E>;

impl EngineError {
    pub fn permanent(message: impl Into<String>) -> Self {
        EngineError::Permanent {
            message: message.into(),
            problem: None,
        }
    }

    /// A permanent failure caused by an account problem.
    ///
    /// Connection problems are transient: the account is fine, the network
    /// is not.
    pub fn account(problem: AccountProblem, message: impl Into<String>) -> Self {
        match problem {
            AccountProblem::Connection => EngineError::Transient(message.into()),
            problem => EngineError::Permanent {
                message: message.into(),
                problem: Some(problem),
            },
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            EngineError::Planning(_) | EngineError::UnknownKind(_) => ErrorKind::Planning,
            EngineError::Transient(_) => ErrorKind::Transient,
            EngineError::Permanent { .. }
            | EngineError::UnknownAccount(_)
            | EngineError::Json(_) => ErrorKind::Permanent,
            EngineError::Commit(_) => ErrorKind::Commit,
            EngineError::Invariant(_) => ErrorKind::Invariant,
            EngineError::Bridge(_) => ErrorKind::Bridge,
            EngineError::Task(failure) => failure.error_kind,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.kind() == ErrorKind::Transient
    }

    pub fn account_problem(&self) -> Option<AccountProblem> {
        match self {
            EngineError::Permanent { problem, .. } => *problem,
            _ => None,
        }
    }
}

impl From<TaskFailure> for EngineError {
    fn from(failure: TaskFailure) -> Self {
        EngineError::Task(failure)
    }
}
