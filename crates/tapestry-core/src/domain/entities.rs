//! Typed projections of the stored entities.
//!
//! The store keeps plain JSON objects; these structs decode the fields the
//! engine and the TOCs care about. Unknown fields are ignored on decode.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::AccountProblem;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountDef {
    pub id: String,
    pub name: String,
    #[serde(default, rename = "type")]
    pub account_type: String,
    #[serde(default = "enabled_by_default")]
    pub enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub problems: Vec<AccountProblem>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sync_info: Option<Value>,
}

fn enabled_by_default() -> bool {
    true
}

impl AccountDef {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            account_type: String::new(),
            enabled: true,
            password: None,
            problems: Vec::new(),
            sync_info: None,
        }
    }

    /// Representation sent over the bridge; never carries credentials.
    pub fn to_wire(&self) -> Value {
        serde_json::json!({
            "id": self.id,
            "name": self.name,
            "type": self.account_type,
            "enabled": self.enabled,
            "problems": self.problems,
            "syncInfo": self.sync_info,
        })
    }
}

/// Folder role, used to rank folders in the folder list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FolderKind {
    Inbox,
    Drafts,
    Sent,
    Archive,
    Junk,
    Trash,
    #[default]
    Normal,
}

impl FolderKind {
    /// Inbox first, then the other system folders, then user folders.
    pub fn rank(self) -> u8 {
        match self {
            FolderKind::Inbox => 0,
            FolderKind::Drafts => 1,
            FolderKind::Sent => 2,
            FolderKind::Archive => 3,
            FolderKind::Junk => 4,
            FolderKind::Trash => 5,
            FolderKind::Normal => 6,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FolderInfo {
    pub id: String,
    pub account_id: String,
    pub path: String,
    pub name: String,
    #[serde(default)]
    pub kind: FolderKind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationInfo {
    pub id: String,
    pub account_id: String,
    #[serde(default)]
    pub folder_ids: Vec<String>,
    #[serde(default)]
    pub subject: String,
    /// Most recent activity, epoch millis.
    pub date: i64,
    #[serde(default)]
    pub message_count: u32,
    /// Ids of the stored messages, so a re-sync can drop the stale ones
    /// without scanning every message.
    #[serde(default)]
    pub message_ids: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageInfo {
    pub id: String,
    pub conversation_id: String,
    pub account_id: String,
    /// Epoch millis.
    pub date: i64,
    #[serde(default)]
    pub author: String,
    #[serde(default)]
    pub body: String,
}

/// Per-account incremental sync progress.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncState {
    /// Highest modification stamp already synced.
    #[serde(default)]
    pub watermark: Option<i64>,
}
