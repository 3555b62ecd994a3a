//! Built-in task kinds.
//!
//! - `sync_folder_list`: mirror an account's folder list
//! - `sync_refresh`: incremental sync of an account, one per account at a time
//! - `sync_conversation`: fetch and store one conversation

mod sync_conversation;
mod sync_folder_list;
mod sync_refresh;

pub use sync_conversation::{SyncConversation, SyncConversationHandler};
pub use sync_folder_list::{SyncFolderList, SyncFolderListHandler};
pub use sync_refresh::{SyncRefresh, SyncRefreshHandler};
