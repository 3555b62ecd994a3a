//! Bridge wire format: commands in, messages out, both JSON.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::account::Side;
use crate::domain::AccountProblem;

/// Client-chosen name of a view or request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Handle(pub u64);

impl std::fmt::Display for Handle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// What entity `getItemAndTrackUpdates` follows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ItemType {
    Conversation,
    Message,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum Command {
    Ping {
        handle: Option<Handle>,
    },
    ViewAccounts {
        handle: Handle,
    },
    ViewFolders {
        handle: Handle,
        account_id: String,
    },
    ViewFolderConversations {
        handle: Handle,
        folder_id: String,
    },
    ViewConversationMessages {
        handle: Handle,
        conversation_id: String,
    },
    SeekProxy {
        handle: Handle,
        offset: usize,
        count: usize,
    },
    RefreshView {
        handle: Handle,
    },
    GetItemAndTrackUpdates {
        handle: Handle,
        item_type: ItemType,
        item_id: String,
    },
    CleanupContext {
        handle: Handle,
    },
    SyncFolderList {
        handle: Option<Handle>,
        account_id: String,
    },
    SyncRefresh {
        handle: Option<Handle>,
        account_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        folder_id: Option<String>,
    },
    ModifyAccount {
        handle: Option<Handle>,
        account_id: String,
        mods: Map<String, Value>,
    },
    ClearAccountProblems {
        handle: Option<Handle>,
        account_id: String,
    },
}

impl Command {
    pub fn handle(&self) -> Option<Handle> {
        match self {
            Command::ViewAccounts { handle }
            | Command::ViewFolders { handle, .. }
            | Command::ViewFolderConversations { handle, .. }
            | Command::ViewConversationMessages { handle, .. }
            | Command::SeekProxy { handle, .. }
            | Command::RefreshView { handle }
            | Command::GetItemAndTrackUpdates { handle, .. }
            | Command::CleanupContext { handle } => Some(*handle),
            Command::Ping { handle }
            | Command::SyncFolderList { handle, .. }
            | Command::SyncRefresh { handle, .. }
            | Command::ModifyAccount { handle, .. }
            | Command::ClearAccountProblems { handle, .. } => *handle,
        }
    }

    /// Commands that open a named context for their handle.
    pub fn creates_context(&self) -> bool {
        matches!(
            self,
            Command::ViewAccounts { .. }
                | Command::ViewFolders { .. }
                | Command::ViewFolderConversations { .. }
                | Command::ViewConversationMessages { .. }
                | Command::GetItemAndTrackUpdates { .. }
        )
    }

    /// Whether a failure is answered with an `error` message; the others
    /// are logged and swallowed.
    pub fn replies_on_error(&self) -> bool {
        !matches!(self, Command::SeekProxy { .. })
    }

    pub fn name(&self) -> &'static str {
        match self {
            Command::Ping { .. } => "ping",
            Command::ViewAccounts { .. } => "viewAccounts",
            Command::ViewFolders { .. } => "viewFolders",
            Command::ViewFolderConversations { .. } => "viewFolderConversations",
            Command::ViewConversationMessages { .. } => "viewConversationMessages",
            Command::SeekProxy { .. } => "seekProxy",
            Command::RefreshView { .. } => "refreshView",
            Command::GetItemAndTrackUpdates { .. } => "getItemAndTrackUpdates",
            Command::CleanupContext { .. } => "cleanupContext",
            Command::SyncFolderList { .. } => "syncFolderList",
            Command::SyncRefresh { .. } => "syncRefresh",
            Command::ModifyAccount { .. } => "modifyAccount",
            Command::ClearAccountProblems { .. } => "clearAccountProblems",
        }
    }
}

/// One list diff. Indexes are valid right after the diff is applied, in
/// message order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "camelCase")]
pub enum ListChange {
    Add { index: usize, item: Value },
    Change { index: usize, item: Value },
    Remove { index: usize, id: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum BridgeMessage {
    Pong {
        handle: Option<Handle>,
    },
    PromisedResult {
        handle: Option<Handle>,
        data: Value,
    },
    ListUpdate {
        handle: Handle,
        total: usize,
        changes: Vec<ListChange>,
    },
    WindowUpdate {
        handle: Handle,
        offset: usize,
        total: usize,
        changes: Vec<ListChange>,
        /// Full window contents; only sent after a seek.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        items: Option<Vec<Value>>,
    },
    GotItemNowTrackingUpdates {
        handle: Handle,
        state: Option<Value>,
        overlays: Value,
    },
    UpdateItem {
        handle: Handle,
        /// `Some(None)` means the item was deleted.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        state: Option<Option<Value>>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        overlays: Option<Value>,
    },
    ContextCleanedUp {
        handle: Handle,
    },
    BadLogin {
        account_id: String,
        problem: AccountProblem,
        which_side: Side,
    },
    Broadcast {
        name: String,
        data: Value,
    },
    Error {
        handle: Option<Handle>,
        message: String,
    },
}

impl BridgeMessage {
    pub fn handle(&self) -> Option<Handle> {
        match self {
            BridgeMessage::ListUpdate { handle, .. }
            | BridgeMessage::WindowUpdate { handle, .. }
            | BridgeMessage::GotItemNowTrackingUpdates { handle, .. }
            | BridgeMessage::UpdateItem { handle, .. }
            | BridgeMessage::ContextCleanedUp { handle } => Some(*handle),
            BridgeMessage::Pong { handle }
            | BridgeMessage::PromisedResult { handle, .. }
            | BridgeMessage::Error { handle, .. } => *handle,
            BridgeMessage::BadLogin { .. } | BridgeMessage::Broadcast { .. } => None,
        }
    }
}

/// Wire form of a list item: its state plus the overlays that apply.
pub fn wire_item(state: Value, overlays: Value) -> Value {
    serde_json::json!({ "state": state, "overlays": overlays })
}
