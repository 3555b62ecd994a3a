//! Scripted account halves for demos and tests.
//!
//! They serve canned folders and items from memory and can be told to
//! report a problem, fail a number of fetches, or answer slowly.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;

use crate::account::{Receiver, RemoteChange, RemoteItem, Sender};
use crate::domain::{AccountProblem, EngineError, FolderInfo, Result};

/// How often each receiver operation was called.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReceiverCalls {
    pub check: usize,
    pub list_folders: usize,
    pub fetch_changes: usize,
    pub fetch_item: usize,
}

#[derive(Debug, Default)]
struct ReceiverScript {
    problem: Option<AccountProblem>,
    folders: Vec<FolderInfo>,
    items: BTreeMap<String, (i64, RemoteItem)>,
    transient_failures: HashMap<String, u32>,
    delay: Option<Duration>,
    calls: ReceiverCalls,
}

#[derive(Debug, Default)]
pub struct ScriptedReceiver {
    script: Mutex<ReceiverScript>,
}

impl ScriptedReceiver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_problem(&self, problem: Option<AccountProblem>) {
        self.with_script(|s| s.problem = problem);
    }

    pub fn set_folders(&self, folders: Vec<FolderInfo>) {
        self.with_script(|s| s.folders = folders);
    }

    /// Adds or replaces an item modified at `modified`.
    pub fn put_item(&self, modified: i64, item: RemoteItem) {
        self.with_script(|s| {
            s.items
                .insert(item.conversation.id.clone(), (modified, item));
        });
    }

    /// The next `times` fetches of `item_id` fail with a transient error.
    pub fn fail_item(&self, item_id: impl Into<String>, times: u32) {
        self.with_script(|s| {
            s.transient_failures.insert(item_id.into(), times);
        });
    }

    /// Every call sleeps this long before answering.
    pub fn set_delay(&self, delay: Option<Duration>) {
        self.with_script(|s| s.delay = delay);
    }

    pub fn calls(&self) -> ReceiverCalls {
        self.with_script(|s| s.calls)
    }

    fn with_script<R>(&self, f: impl FnOnce(&mut ReceiverScript) -> R) -> R {
        let mut script = self.script.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut script)
    }

    async fn pause(&self) {
        if let Some(delay) = self.with_script(|s| s.delay) {
            tokio::time::sleep(delay).await;
        }
    }

    fn fail_on_problem(&self) -> Result<()> {
        match self.with_script(|s| s.problem) {
            Some(problem) => Err(EngineError::account(problem, format!("receiver: {problem}"))),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl Receiver for ScriptedReceiver {
    async fn check(&self) -> std::result::Result<(), AccountProblem> {
        self.with_script(|s| s.calls.check += 1);
        self.pause().await;
        match self.with_script(|s| s.problem) {
            Some(problem) => Err(problem),
            None => Ok(()),
        }
    }

    async fn list_folders(&self) -> Result<Vec<FolderInfo>> {
        self.with_script(|s| s.calls.list_folders += 1);
        self.pause().await;
        self.fail_on_problem()?;
        Ok(self.with_script(|s| s.folders.clone()))
    }

    async fn fetch_changes(&self, since: Option<i64>) -> Result<Vec<RemoteChange>> {
        self.with_script(|s| s.calls.fetch_changes += 1);
        self.pause().await;
        self.fail_on_problem()?;
        let mut changes: Vec<RemoteChange> = self.with_script(|s| {
            s.items
                .iter()
                .filter(|(_, (modified, _))| since.is_none_or(|since| *modified >= since))
                .map(|(id, (modified, _))| RemoteChange {
                    item_id: id.clone(),
                    modified: *modified,
                })
                .collect()
        });
        changes.sort_by(|a, b| a.modified.cmp(&b.modified).then_with(|| a.item_id.cmp(&b.item_id)));
        Ok(changes)
    }

    async fn fetch_item(&self, item_id: &str) -> Result<RemoteItem> {
        self.with_script(|s| s.calls.fetch_item += 1);
        self.pause().await;
        self.fail_on_problem()?;
        self.with_script(|s| {
            if let Some(remaining) = s.transient_failures.get_mut(item_id)
                && *remaining > 0
            {
                *remaining -= 1;
                return Err(EngineError::Transient(format!("fetch of {item_id} timed out")));
            }
            s.items
                .get(item_id)
                .map(|(_, item)| item.clone())
                .ok_or_else(|| EngineError::permanent(format!("item {item_id} no longer exists")))
        })
    }
}

#[derive(Debug, Default)]
pub struct ScriptedSender {
    problem: Mutex<Option<AccountProblem>>,
}

impl ScriptedSender {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_problem(&self, problem: Option<AccountProblem>) {
        *self.problem.lock().unwrap_or_else(PoisonError::into_inner) = problem;
    }
}

#[async_trait]
impl Sender for ScriptedSender {
    async fn check(&self) -> std::result::Result<(), AccountProblem> {
        match *self.problem.lock().unwrap_or_else(PoisonError::into_inner) {
            Some(problem) => Err(problem),
            None => Ok(()),
        }
    }
}
