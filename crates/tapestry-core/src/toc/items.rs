//! TOC orderings of the stored entities.

use std::cmp::Ordering;

use serde_json::Value;

use super::TocItem;
use crate::domain::{AccountDef, Collection, ConversationInfo, FolderInfo, MessageInfo, OverlayKey};

/// Overlay namespace announced when something about an account changes that
/// every folder of that account shows (sync status, problems).
pub const ACCOUNT_CASCADE_TO_FOLDERS: &str = "accountCascadeToFolders";

fn to_json<T: serde::Serialize>(value: &T) -> Value {
    serde_json::to_value(value).unwrap_or(Value::Null)
}

impl TocItem for AccountDef {
    const COLLECTION: Collection = Collection::Accounts;
    const OVERLAY_NAMESPACE: &'static str = "accounts";

    fn id(&self) -> &str {
        &self.id
    }

    fn decode(value: &Value) -> Option<Self> {
        serde_json::from_value(value.clone()).ok()
    }

    /// There is a single account list.
    fn in_scope(&self, _scope: &str) -> bool {
        true
    }

    fn compare(&self, other: &Self) -> Ordering {
        self.name.to_lowercase().cmp(&other.name.to_lowercase())
    }

    fn to_wire(&self) -> Value {
        AccountDef::to_wire(self)
    }
}

impl TocItem for FolderInfo {
    const COLLECTION: Collection = Collection::Folders;
    const OVERLAY_NAMESPACE: &'static str = "folders";

    fn id(&self) -> &str {
        &self.id
    }

    fn decode(value: &Value) -> Option<Self> {
        serde_json::from_value(value.clone()).ok()
    }

    fn in_scope(&self, account_id: &str) -> bool {
        self.account_id == account_id
    }

    fn compare(&self, other: &Self) -> Ordering {
        self.kind
            .rank()
            .cmp(&other.kind.rank())
            .then_with(|| self.path.to_lowercase().cmp(&other.path.to_lowercase()))
    }

    fn to_wire(&self) -> Value {
        to_json(self)
    }

    fn cascades(key: &OverlayKey, account_id: &str) -> bool {
        key.namespace == ACCOUNT_CASCADE_TO_FOLDERS && key.id == account_id
    }
}

impl TocItem for ConversationInfo {
    const COLLECTION: Collection = Collection::Conversations;
    const OVERLAY_NAMESPACE: &'static str = "conversations";

    fn id(&self) -> &str {
        &self.id
    }

    fn decode(value: &Value) -> Option<Self> {
        serde_json::from_value(value.clone()).ok()
    }

    fn in_scope(&self, folder_id: &str) -> bool {
        self.folder_ids.iter().any(|f| f == folder_id)
    }

    /// Newest first.
    fn compare(&self, other: &Self) -> Ordering {
        other
            .date
            .cmp(&self.date)
            .then_with(|| other.id.cmp(&self.id))
    }

    fn to_wire(&self) -> Value {
        to_json(self)
    }
}

impl TocItem for MessageInfo {
    const COLLECTION: Collection = Collection::Messages;
    const OVERLAY_NAMESPACE: &'static str = "messages";

    fn id(&self) -> &str {
        &self.id
    }

    fn decode(value: &Value) -> Option<Self> {
        serde_json::from_value(value.clone()).ok()
    }

    fn in_scope(&self, conversation_id: &str) -> bool {
        self.conversation_id == conversation_id
    }

    /// Oldest first.
    fn compare(&self, other: &Self) -> Ordering {
        self.date.cmp(&other.date)
    }

    fn to_wire(&self) -> Value {
        to_json(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::FolderKind;
    use rstest::rstest;

    fn folder(id: &str, path: &str, kind: FolderKind) -> FolderInfo {
        FolderInfo {
            id: id.into(),
            account_id: "a1".into(),
            path: path.into(),
            name: path.into(),
            kind,
        }
    }

    fn conversation(id: &str, date: i64) -> ConversationInfo {
        ConversationInfo {
            id: id.into(),
            account_id: "a1".into(),
            folder_ids: vec!["inbox".into()],
            subject: String::new(),
            date,
            message_count: 1,
            message_ids: Vec::new(),
        }
    }

    #[test]
    fn inbox_sorts_before_user_folders() {
        let inbox = folder("f1", "INBOX", FolderKind::Inbox);
        let archive = folder("f2", "Archive", FolderKind::Normal);
        assert_eq!(inbox.compare(&archive), Ordering::Less);
    }

    #[rstest]
    #[case(10, 20, Ordering::Greater)]
    #[case(20, 10, Ordering::Less)]
    fn conversations_sort_newest_first(#[case] a: i64, #[case] b: i64, #[case] expected: Ordering) {
        assert_eq!(conversation("c1", a).compare(&conversation("c2", b)), expected);
    }

    #[test]
    fn account_overlay_cascades_to_its_folders_only() {
        let key = OverlayKey::new(ACCOUNT_CASCADE_TO_FOLDERS, "a1");
        assert!(FolderInfo::cascades(&key, "a1"));
        assert!(!FolderInfo::cascades(&key, "a2"));
        assert!(!FolderInfo::cascades(&OverlayKey::new("accounts", "a1"), "a1"));
    }

    #[test]
    fn account_wire_rep_goes_through_the_toc() {
        let mut account = AccountDef::new("a1", "Work");
        account.password = Some("secret".into());
        let wire = TocItem::to_wire(&account);
        assert!(wire.get("password").is_none());
    }
}
