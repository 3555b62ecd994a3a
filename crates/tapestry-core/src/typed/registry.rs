//! TaskRegistry: the closed set of task kinds, fixed at build time.

use std::collections::HashMap;
use std::sync::Arc;

use super::handler::{DynHandler, Handler, TypedHandler};
use super::task::TaskArgs;

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("Handler for task kind '{0}' is already registered")]
    AlreadyRegistered(String),
}

/// Handlers by kind name.
///
/// ```ignore
/// let mut registry = TaskRegistry::new();
/// registry.register::<SyncFolderList, _>(SyncFolderListHandler)?;
/// let handler = registry.get("sync_folder_list");
/// ```
#[derive(Default)]
pub struct TaskRegistry {
    handlers: HashMap<String, Arc<dyn DynHandler>>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<T: TaskArgs, H: Handler<T> + 'static>(
        &mut self,
        handler: H,
    ) -> Result<(), RegistryError> {
        let kind = T::KIND.to_string();
        if self.handlers.contains_key(&kind) {
            return Err(RegistryError::AlreadyRegistered(kind));
        }
        self.handlers
            .insert(kind, Arc::new(TypedHandler::<T, H>::new(handler)));
        Ok(())
    }

    pub fn get(&self, kind: &str) -> Option<Arc<dyn DynHandler>> {
        self.handlers.get(kind).cloned()
    }

    /// Registered kinds, sorted.
    pub fn registered_kinds(&self) -> Vec<String> {
        let mut kinds: Vec<String> = self.handlers.keys().cloned().collect();
        kinds.sort();
        kinds
    }
}

impl std::fmt::Debug for TaskRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskRegistry")
            .field("kinds", &self.registered_kinds())
            .finish()
    }
}
