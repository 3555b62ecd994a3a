use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError};

use super::CompositeAccount;
use crate::domain::{EngineError, Result};

/// Live accounts by id.
#[derive(Debug, Default)]
pub struct AccountManager {
    accounts: Mutex<BTreeMap<String, Arc<CompositeAccount>>>,
}

impl AccountManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds or replaces an account.
    pub fn insert(&self, account: CompositeAccount) -> Arc<CompositeAccount> {
        let account = Arc::new(account);
        self.accounts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(account.id().to_string(), Arc::clone(&account));
        account
    }

    pub fn remove(&self, id: &str) -> Option<Arc<CompositeAccount>> {
        self.accounts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(id)
    }

    pub fn get(&self, id: &str) -> Result<Arc<CompositeAccount>> {
        self.accounts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .cloned()
            .ok_or_else(|| EngineError::UnknownAccount(id.to_string()))
    }

    pub fn ids(&self) -> Vec<String> {
        self.accounts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect()
    }
}
