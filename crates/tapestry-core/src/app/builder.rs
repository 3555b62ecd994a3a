//! EngineBuilder: wires the store, accounts, clock, config and task kinds
//! into a [`Runtime`].
//!
//! Missing collaborators fall back to in-memory/system defaults. Expected
//! task kinds are checked at build time so a forgotten registration fails
//! at startup rather than when the first request for it arrives.

use std::sync::Arc;

use super::runtime::{Runtime, RuntimeParts};
use crate::account::AccountManager;
use crate::config::{ConfigError, EngineConfig};
use crate::impls::MemoryStore;
use crate::ports::{Clock, Store, SystemClock};
use crate::tasks::{
    SyncConversation, SyncConversationHandler, SyncFolderList, SyncFolderListHandler, SyncRefresh,
    SyncRefreshHandler,
};
use crate::typed::{Handler, RegistryError, TaskArgs, TaskRegistry};

/// Builds a [`Runtime`].
///
/// ```ignore
/// let runtime = EngineBuilder::new()
///     .with_builtin_tasks()?
///     .expect_tasks(&[SyncRefresh::KIND])
///     .store(store)
///     .accounts(accounts)
///     .build()?;
/// ```
pub struct EngineBuilder {
    registry: TaskRegistry,
    expected_tasks: Option<Vec<String>>,
    store: Option<Arc<dyn Store>>,
    accounts: Option<Arc<AccountManager>>,
    clock: Option<Arc<dyn Clock>>,
    config: EngineConfig,
}

#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("Missing task kinds: {0:?}. These kinds were expected but not registered.")]
    MissingTaskTypes(Vec<String>),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl EngineBuilder {
    pub fn new() -> Self {
        Self {
            registry: TaskRegistry::new(),
            expected_tasks: None,
            store: None,
            accounts: None,
            clock: None,
            config: EngineConfig::default(),
        }
    }

    pub fn register<T: TaskArgs, H: Handler<T> + 'static>(
        mut self,
        handler: H,
    ) -> Result<Self, RegistryError> {
        self.registry.register::<T, H>(handler)?;
        Ok(self)
    }

    /// Registers `sync_folder_list`, `sync_refresh` and `sync_conversation`.
    pub fn with_builtin_tasks(self) -> Result<Self, RegistryError> {
        self.register::<SyncFolderList, _>(SyncFolderListHandler)?
            .register::<SyncRefresh, _>(SyncRefreshHandler)?
            .register::<SyncConversation, _>(SyncConversationHandler)
    }

    pub fn expect_tasks(mut self, kinds: &[&str]) -> Self {
        self.expected_tasks = Some(kinds.iter().map(|kind| kind.to_string()).collect());
        self
    }

    pub fn store(mut self, store: Arc<dyn Store>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn accounts(mut self, accounts: Arc<AccountManager>) -> Self {
        self.accounts = Some(accounts);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Checks the expected kinds and the config, then starts the runtime.
    pub fn build(self) -> Result<Runtime, BuildError> {
        if let Some(expected) = &self.expected_tasks {
            let registered = self.registry.registered_kinds();
            let missing: Vec<String> = expected
                .iter()
                .filter(|kind| !registered.contains(kind))
                .cloned()
                .collect();
            if !missing.is_empty() {
                return Err(BuildError::MissingTaskTypes(missing));
            }
        }
        self.config.validate()?;

        tracing::debug!(kinds = ?self.registry.registered_kinds(), "engine built");
        Ok(Runtime::from_parts(RuntimeParts {
            store: self.store.unwrap_or_else(|| Arc::new(MemoryStore::new())),
            accounts: self.accounts.unwrap_or_default(),
            clock: self.clock.unwrap_or_else(|| Arc::new(SystemClock)),
            registry: self.registry,
            config: self.config,
        }))
    }
}

impl Default for EngineBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SchedulerConfig;
    use crate::typed::handler::tests::{Touch, TouchHandler};

    #[test]
    fn builds_with_expected_kinds() {
        let runtime = EngineBuilder::new()
            .with_builtin_tasks()
            .unwrap()
            .expect_tasks(&[SyncRefresh::KIND, SyncFolderList::KIND])
            .build();
        assert!(runtime.is_ok());
    }

    #[test]
    fn missing_kinds_fail_the_build() {
        let result = EngineBuilder::new()
            .register::<Touch, _>(TouchHandler)
            .unwrap()
            .expect_tasks(&[Touch::KIND, SyncRefresh::KIND])
            .build();
        assert!(matches!(
            result,
            Err(BuildError::MissingTaskTypes(missing)) if missing == vec![SyncRefresh::KIND.to_string()]
        ));
    }

    #[test]
    fn builtin_kinds_cannot_be_registered_twice() {
        let result = EngineBuilder::new()
            .with_builtin_tasks()
            .unwrap()
            .register::<SyncRefresh, _>(SyncRefreshHandler);
        assert!(matches!(result, Err(RegistryError::AlreadyRegistered(_))));
    }

    #[test]
    fn invalid_config_fails_the_build() {
        let config = EngineConfig {
            scheduler: SchedulerConfig { max_concurrent: 0 },
            ..EngineConfig::default()
        };
        let result = EngineBuilder::new().config(config).build();
        assert!(matches!(result, Err(BuildError::Config(_))));
    }
}
