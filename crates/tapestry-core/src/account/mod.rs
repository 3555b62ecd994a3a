//! Accounts: protocol capabilities behind narrow traits.
//!
//! An account is a composite of a `Receiver` (incoming side: folders,
//! changes, items) and a `Sender` (outgoing side). The engine only reaches
//! accounts through the `AccountManager` handed to every task context.

mod composite;
mod manager;

pub use composite::{CheckResult, CompositeAccount, Side};
pub use manager::AccountManager;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::domain::{AccountProblem, ConversationInfo, FolderInfo, MessageInfo, Result};

/// One remote item modified at `modified` (epoch millis).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteChange {
    pub item_id: String,
    pub modified: i64,
}

/// A fetched remote item: one conversation and its messages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteItem {
    pub conversation: ConversationInfo,
    pub messages: Vec<MessageInfo>,
}

#[async_trait]
pub trait Receiver: Send + Sync {
    /// Verifies the incoming connection and credentials.
    async fn check(&self) -> std::result::Result<(), AccountProblem>;

    async fn list_folders(&self) -> Result<Vec<FolderInfo>>;

    /// Items modified at or after `since`, oldest modification first.
    ///
    /// The bound is inclusive, so items sharing the watermark stamp are
    /// returned again rather than skipped.
    async fn fetch_changes(&self, since: Option<i64>) -> Result<Vec<RemoteChange>>;

    async fn fetch_item(&self, item_id: &str) -> Result<RemoteItem>;
}

#[async_trait]
pub trait Sender: Send + Sync {
    /// Verifies the outgoing connection and credentials.
    async fn check(&self) -> std::result::Result<(), AccountProblem>;
}
