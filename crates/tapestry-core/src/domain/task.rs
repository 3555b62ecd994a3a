use serde::{Deserialize, Serialize};
use std::fmt;

use super::TaskId;

/// Name of a task kind, e.g. `sync_refresh`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskKind(String);

impl TaskKind {
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<&str> for TaskKind {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// A request for work: kind + argument bag, before planning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawTask {
    pub kind: TaskKind,
    #[serde(default)]
    pub args: serde_json::Value,
}

impl RawTask {
    pub fn new(kind: impl Into<TaskKind>, args: serde_json::Value) -> Self {
        Self {
            kind: kind.into(),
            args,
        }
    }

    /// Builds a raw task from typed args.
    pub fn from_args<T: Serialize>(
        kind: impl Into<TaskKind>,
        args: &T,
    ) -> Result<Self, serde_json::Error> {
        Ok(Self::new(kind, serde_json::to_value(args)?))
    }
}

/// What planning produced for one task, in the form that is persisted.
///
/// This is the durable record written to the `tasks` collection before the
/// task is queued, so a crash after planning can resume it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlannedTask {
    pub id: TaskId,
    pub kind: TaskKind,
    /// The original request, kept so a commit failure can re-plan from scratch.
    pub args: serde_json::Value,
    pub plan_state: serde_json::Value,
    #[serde(default)]
    pub exclusive_resources: Vec<String>,
    #[serde(default)]
    pub priority_tags: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bin_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group: Option<String>,
}
