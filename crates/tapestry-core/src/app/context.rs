//! Execution context handed to every execute phase.

use std::sync::Arc;

use serde_json::Value;

use crate::account::{AccountManager, CompositeAccount};
use crate::domain::{Collection, ReadRequest, ReadResult, Result, TaskId, TaskKind};
use crate::ports::{Clock, Store};

/// Store, accounts, clock and the identity of the running task.
///
/// Tasks reach every collaborator through this; there are no globals.
pub struct TaskContext {
    task_id: TaskId,
    kind: TaskKind,
    store: Arc<dyn Store>,
    accounts: Arc<AccountManager>,
    clock: Arc<dyn Clock>,
}

impl TaskContext {
    pub(crate) fn new(
        task_id: TaskId,
        kind: TaskKind,
        store: Arc<dyn Store>,
        accounts: Arc<AccountManager>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            task_id,
            kind,
            store,
            accounts,
            clock,
        }
    }

    pub fn task_id(&self) -> TaskId {
        self.task_id
    }

    pub fn kind(&self) -> &TaskKind {
        &self.kind
    }

    /// Reads the current state of the entities this task is about to
    /// mutate.
    pub async fn begin_mutate(&self, request: ReadRequest) -> Result<ReadResult> {
        self.store.read(&request).await
    }

    pub async fn scan(&self, collection: Collection) -> Result<Vec<(String, Value)>> {
        self.store.scan(collection).await
    }

    pub fn account(&self, id: &str) -> Result<Arc<CompositeAccount>> {
        self.accounts.get(id)
    }

    pub fn now_millis(&self) -> i64 {
        self.clock.now_millis()
    }

    /// A context over an empty store, for handler tests.
    #[cfg(test)]
    pub(crate) fn detached() -> Self {
        Self::new(
            TaskId::from_raw(0),
            TaskKind::new("detached"),
            Arc::new(crate::impls::MemoryStore::new()),
            Arc::new(AccountManager::new()),
            Arc::new(crate::ports::SystemClock),
        )
    }

    #[cfg(test)]
    pub(crate) fn with_parts(
        store: Arc<dyn Store>,
        accounts: Arc<AccountManager>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self::new(
            TaskId::from_raw(0),
            TaskKind::new("test"),
            store,
            accounts,
            clock,
        )
    }
}

impl std::fmt::Debug for TaskContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskContext")
            .field("task_id", &self.task_id)
            .field("kind", &self.kind)
            .finish()
    }
}
